//! Change listener: the single long-running long-poll worker that
//! fans out disk-event batches to every registered downstream queue.
//! Ported from `examples/original_source/change_listener.py`'s
//! `ChangeListener.get_last_event`/`get_change`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use triarchive_core::TriarchiveResult;
use triarchive_tools::sync_daemon::{parse_events_response, SyncDaemonClient};

use crate::events::{classify, ListenerEvent};

const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(3600);
const RE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ChangeListener {
    client: Arc<SyncDaemonClient>,
    last_event_file: PathBuf,
    subscribers: Vec<mpsc::Sender<Arc<Vec<ListenerEvent>>>>,
    long_poll_timeout: Duration,
}

impl ChangeListener {
    pub fn new(client: Arc<SyncDaemonClient>, last_event_file: PathBuf) -> Self {
        Self {
            client,
            last_event_file,
            subscribers: Vec::new(),
            long_poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
        }
    }

    /// Registers a downstream queue (typically a folder's upload syncer).
    /// Must be called before [`run`](Self::run) starts.
    pub fn register(&mut self, sender: mpsc::Sender<Arc<Vec<ListenerEvent>>>) {
        self.subscribers.push(sender);
    }

    async fn read_persisted_last_event(&self) -> i64 {
        tokio::fs::read_to_string(&self.last_event_file)
            .await
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(0)
    }

    async fn persist_last_event(&self, id: i64) -> TriarchiveResult<()> {
        tokio::fs::write(&self.last_event_file, id.to_string()).await?;
        Ok(())
    }

    /// On startup, re-probes `lastEvent - 1` with a short timeout; if the
    /// daemon can't answer (its counter may have reset), starts over at 0.
    async fn initial_last_event(&self) -> i64 {
        let candidate = self.read_persisted_last_event().await;
        if candidate == 0 {
            return 0;
        }

        let probe = tokio::time::timeout(
            RE_PROBE_TIMEOUT,
            self.client.get(
                "events/disk",
                &[("since", (candidate - 1).to_string()), ("timeout", "0".to_string())],
                &[],
            ),
        )
        .await;

        match probe {
            Ok(Ok(_)) => candidate,
            _ => {
                warn!(candidate, "could not re-probe last event, daemon counter may have reset");
                0
            }
        }
    }

    /// Long-polls `events/disk` and fans each non-empty batch out to every
    /// registered subscriber. `lastEvent` always advances to the final
    /// event's id in the batch, whether or not any event in it matched a
    /// particular folder — the listener owns one cursor shared by all
    /// subscribers.
    pub async fn run(&mut self, cancel: CancellationToken) -> TriarchiveResult<()> {
        let mut last_event = self.initial_last_event().await;

        loop {
            let query = [
                ("since", last_event.to_string()),
                ("timeout", self.long_poll_timeout.as_secs().to_string()),
            ];

            let value = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.client.get("events/disk", &query, &[]) => result?,
            };

            let events = parse_events_response(&value);
            if events.is_empty() {
                continue;
            }

            last_event = events.last().map(|e| e.id).unwrap_or(last_event);
            self.persist_last_event(last_event).await?;

            let batch = Arc::new(events.into_iter().map(classify).collect::<Vec<ListenerEvent>>());
            for subscriber in &self.subscribers {
                if subscriber.send(batch.clone()).await.is_err() {
                    warn!("a downstream queue for the change listener has been dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn initial_last_event_resets_to_zero_when_file_absent() {
        let dir = tempdir().unwrap();
        let client = Arc::new(SyncDaemonClient::new("http://127.0.0.1:1", "key", 1, Duration::from_millis(1)));
        let listener = ChangeListener::new(client, dir.path().join("last_event"));
        assert_eq!(listener.initial_last_event().await, 0);
    }

    #[tokio::test]
    async fn persists_and_reads_back_last_event() {
        let dir = tempdir().unwrap();
        let client = Arc::new(SyncDaemonClient::new("http://127.0.0.1:1", "key", 1, Duration::from_millis(1)));
        let listener = ChangeListener::new(client, dir.path().join("last_event"));
        listener.persist_last_event(42).await.unwrap();
        assert_eq!(listener.read_persisted_last_event().await, 42);
    }
}
