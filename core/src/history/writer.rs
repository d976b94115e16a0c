use super::HistoryLog;
use crate::command::Envelope;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Background owner of a `HistoryLog`.
///
/// `append` only enqueues; a dedicated blocking thread performs the file I/O,
/// so a slow disk never delays live delivery.
pub struct HistoryWriter {
    tx: mpsc::UnboundedSender<Envelope>,
    task: JoinHandle<()>,
    log: Arc<Mutex<HistoryLog>>,
}

impl HistoryWriter {
    /// Spawn the writer thread. Must be called inside a tokio runtime.
    pub fn spawn(log: HistoryLog) -> Self {
        let log = Arc::new(Mutex::new(log));
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let worker_log = Arc::clone(&log);
        let task = tokio::task::spawn_blocking(move || {
            while let Some(envelope) = rx.blocking_recv() {
                if let Err(e) = worker_log.lock().write(&envelope) {
                    error!("History append failed for {}: {}", envelope.uuid, e);
                }
            }
            if let Err(e) = worker_log.lock().flush() {
                warn!("History flush failed: {}", e);
            }
            debug!("History writer stopped");
        });

        Self { tx, task, log }
    }

    /// Queue an envelope for appending. Never blocks.
    pub fn append(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            warn!("History writer is gone; envelope dropped");
        }
    }

    pub fn active_path(&self) -> PathBuf {
        self.log.lock().active_path().to_path_buf()
    }

    /// Drain queued envelopes, flush, and stop the writer thread.
    pub async fn shutdown(self) {
        let HistoryWriter { tx, task, .. } = self;
        drop(tx);
        if let Err(e) = task.await {
            error!("History writer panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, ConnectionState};
    use serde_json::json;

    #[tokio::test]
    async fn test_writer_appends_and_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::open(dir.path().to_path_buf(), None).unwrap();
        let writer = HistoryWriter::spawn(log);
        let path = writer.active_path();

        for i in 0..10 {
            writer.append(Envelope::new(Command::Upstream(
                json!({"cmd": "DANMU_MSG", "i": i}),
            )));
        }
        writer.append(Envelope::new(Command::status(ConnectionState::Open)));
        writer.shutdown().await;

        let envelopes = HistoryLog::read(&path).unwrap();
        assert_eq!(envelopes.len(), 11);
        assert_eq!(envelopes[3].message.kind(), Some("DANMU_MSG"));
    }
}
