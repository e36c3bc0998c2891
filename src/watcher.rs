//! Observers of finished relay sessions
//!
//! The relay never looks at the bytes it captures; it hands them to a
//! [`Watcher`] once the session is over. A switch runs without one.

use crate::error::RelayError;
use crate::load_balancer::Backend;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything captured for one completed session
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    id: u64,
    client: SocketAddr,
    backend: Backend,
    opened: DateTime<Utc>,
    closed: DateTime<Utc>,
    request: Bytes,
    response: Bytes,
}

impl ConnectionRecord {
    pub fn new(
        id: u64,
        client: SocketAddr,
        backend: Backend,
        opened: DateTime<Utc>,
        closed: DateTime<Utc>,
        request: Bytes,
        response: Bytes,
    ) -> Self {
        Self {
            id,
            client,
            backend,
            opened,
            closed,
            request,
            response,
        }
    }

    /// Monotonic per server, starting at 1
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn opened(&self) -> DateTime<Utc> {
        self.opened
    }

    pub fn closed(&self) -> DateTime<Utc> {
        self.closed
    }

    /// Bytes sent by the client
    pub fn request(&self) -> &Bytes {
        &self.request
    }

    /// Bytes sent by the backend
    pub fn response(&self) -> &Bytes {
        &self.response
    }
}

/// Receives session outcomes from the relay server.
///
/// Called from session tasks on the async runtime, so implementations must
/// not block; hand slow work off as [`DirWatcher`] does.
pub trait Watcher: Send + Sync + 'static {
    /// A session with a backend ended. Called exactly once per such session,
    /// also when the relay broke off; the record then holds what was relayed
    /// before the failure.
    fn record_created(&self, record: ConnectionRecord);

    /// A session failed; the failure goes no further than this.
    fn exception_caught(&self, error: &RelayError);
}

/// Logs a summary line per session
#[derive(Debug, Default, Clone, Copy)]
pub struct LogWatcher;

impl Watcher for LogWatcher {
    fn record_created(&self, record: ConnectionRecord) {
        info!(
            id = record.id,
            client = %record.client,
            backend = %record.backend,
            opened = %record.opened.to_rfc3339(),
            duration_ms = (record.closed - record.opened).num_milliseconds(),
            request_bytes = record.request.len(),
            response_bytes = record.response.len(),
            "Connection recorded"
        );
    }

    fn exception_caught(&self, error: &RelayError) {
        warn!(error = %error, "Relay session failed");
    }
}

/// Persists every record under a context directory:
/// `<id>.request` and `<id>.response` hold the raw bytes,
/// `connections.log` gets one summary line per record and
/// `errors.log` one line per failure.
///
/// Session tasks only queue entries; a blocking writer task does the file
/// I/O. The writer finishes once every clone of the watcher is dropped and
/// the queue is drained.
#[derive(Debug, Clone)]
pub struct DirWatcher {
    dir: PathBuf,
    queue: mpsc::UnboundedSender<Entry>,
}

#[derive(Debug)]
enum Entry {
    Record(ConnectionRecord),
    Failure(String),
}

impl DirWatcher {
    /// Create the directory and start the writer on the blocking pool.
    ///
    /// Must be called from within a tokio runtime. Await the returned handle
    /// after the last clone is dropped to be sure everything reached disk.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<(Self, JoinHandle<()>)> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let (queue, rx) = mpsc::unbounded_channel();
        let writer = ContextDir { dir: dir.clone() };
        let handle = tokio::task::spawn_blocking(move || writer.run(rx));

        Ok((Self { dir, queue }, handle))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn enqueue(&self, entry: Entry) {
        if self.queue.send(entry).is_err() {
            warn!(dir = %self.dir.display(), "Context directory writer is gone, entry dropped");
        }
    }
}

impl Watcher for DirWatcher {
    fn record_created(&self, record: ConnectionRecord) {
        self.enqueue(Entry::Record(record));
    }

    fn exception_caught(&self, error: &RelayError) {
        self.enqueue(Entry::Failure(format!("{}\t{}\n", Utc::now().to_rfc3339(), error)));
    }
}

/// Writing side of a [`DirWatcher`]
struct ContextDir {
    dir: PathBuf,
}

impl ContextDir {
    fn run(self, mut rx: mpsc::UnboundedReceiver<Entry>) {
        while let Some(entry) = rx.blocking_recv() {
            match entry {
                Entry::Record(record) => {
                    if let Err(e) = self.write_record(&record) {
                        warn!(id = record.id, dir = %self.dir.display(), error = %e, "Could not persist record");
                    }
                }
                Entry::Failure(line) => {
                    if let Err(e) = self.append("errors.log", &line) {
                        warn!(dir = %self.dir.display(), error = %e, "Could not persist error");
                    }
                }
            }
        }
        debug!(dir = %self.dir.display(), "Context directory writer stopped");
    }

    fn write_record(&self, record: &ConnectionRecord) -> io::Result<()> {
        let stem = format!("{:08}", record.id);
        fs::write(self.dir.join(format!("{stem}.request")), &record.request)?;
        fs::write(self.dir.join(format!("{stem}.response")), &record.response)?;

        let line = format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            stem,
            record.opened.to_rfc3339(),
            record.closed.to_rfc3339(),
            record.client,
            record.backend,
            record.request.len(),
            record.response.len(),
        );
        self.append("connections.log", &line)
    }

    fn append(&self, file: &str, line: &str) -> io::Result<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))?;
        log.write_all(line.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Direction;

    fn record(id: u64) -> ConnectionRecord {
        let opened = Utc::now();
        ConnectionRecord::new(
            id,
            "127.0.0.1:50000".parse().unwrap(),
            Backend::new("127.0.0.1", 8080),
            opened,
            opened + chrono::Duration::milliseconds(15),
            Bytes::from_static(b"PING\n"),
            Bytes::from_static(b"PONG\n"),
        )
    }

    #[tokio::test]
    async fn dir_watcher_persists_captures() {
        let tmp = tempfile::tempdir().unwrap();
        let (watcher, writer) = DirWatcher::new(tmp.path().join("ctx")).unwrap();
        let dir = watcher.dir().to_path_buf();

        watcher.record_created(record(1));
        watcher.record_created(record(2));
        drop(watcher);
        writer.await.unwrap();

        assert_eq!(fs::read(dir.join("00000001.request")).unwrap(), b"PING\n");
        assert_eq!(fs::read(dir.join("00000002.response")).unwrap(), b"PONG\n");

        let log = fs::read_to_string(dir.join("connections.log")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000001\t"));
        assert!(lines[1].ends_with("127.0.0.1:8080\t5\t5"));
    }

    #[tokio::test]
    async fn dir_watcher_logs_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let (watcher, writer) = DirWatcher::new(tmp.path()).unwrap();

        watcher.exception_caught(&RelayError::Io {
            direction: Direction::Upstream,
            source: io::ErrorKind::ConnectionReset.into(),
        });
        drop(watcher);
        writer.await.unwrap();

        let log = fs::read_to_string(tmp.path().join("errors.log")).unwrap();
        assert!(log.contains("client->backend relay failed"));
    }

    #[tokio::test]
    async fn dir_watcher_writer_runs_until_every_clone_is_gone() {
        let tmp = tempfile::tempdir().unwrap();
        let (watcher, writer) = DirWatcher::new(tmp.path()).unwrap();
        let clone = watcher.clone();

        clone.record_created(record(7));
        drop(watcher);
        // The writer keeps running while any clone is alive
        assert!(!writer.is_finished());

        drop(clone);
        writer.await.unwrap();
        assert_eq!(fs::read(tmp.path().join("00000007.request")).unwrap(), b"PING\n");
    }
}
