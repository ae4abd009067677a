use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;
use crate::registry::{Registry, WatchEvent};
use crate::timer::Backoff;

/// Long-poll window used for each underlying `wait` call.
const POLL_WINDOW: Duration = Duration::from_secs(30);

/// Lazy, effectively infinite stream of changes under a prefix.
///
/// The watcher only holds a cursor, so it survives disconnects: after an
/// error the next call resumes from the last delivered index. If the cursor
/// has been compacted away the caller gets [`RegistryError::CursorCompacted`]
/// and should [`resync`](Self::resync) and re-read full state.
pub struct Watcher {
    registry: Arc<dyn Registry>,
    prefix: String,
    cursor: u64,
    poll_window: Duration,
}

impl Watcher {
    /// Start watching from the registry's current index.
    pub async fn new(registry: Arc<dyn Registry>, prefix: &str) -> Result<Self, RegistryError> {
        let cursor = registry.current_index().await?;
        Ok(Self::from_cursor(registry, prefix, cursor))
    }

    pub fn from_cursor(registry: Arc<dyn Registry>, prefix: &str, cursor: u64) -> Self {
        Self {
            registry,
            prefix: prefix.to_string(),
            cursor,
            poll_window: POLL_WINDOW,
        }
    }

    pub fn with_poll_window(mut self, window: Duration) -> Self {
        self.poll_window = window;
        self
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Jump to the registry's current index, skipping anything missed.
    pub async fn resync(&mut self) -> Result<(), RegistryError> {
        self.cursor = self.registry.current_index().await?;
        Ok(())
    }

    /// Next event under the prefix. Blocks until one arrives.
    pub async fn next(&mut self) -> Result<WatchEvent, RegistryError> {
        loop {
            if let Some(event) = self
                .registry
                .wait(&self.prefix, self.cursor, self.poll_window)
                .await?
            {
                self.cursor = event.index;
                return Ok(event);
            }
        }
    }
}

/// Turn changes under `prefixes` into coalesced wake-ups on `tx`.
///
/// `tx` should have capacity 1: while a wake-up is pending further events are
/// dropped, so the consumer runs exactly one follow-up pass however many
/// changes arrived. A compacted cursor also produces a wake-up since the
/// consumer recomputes from a full snapshot anyway.
pub fn spawn_trigger(
    registry: Arc<dyn Registry>,
    prefixes: Vec<String>,
    tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    for prefix in prefixes {
        let registry = registry.clone();
        let tx = tx.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::default();
            let mut watcher: Option<Watcher> = None;

            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = next_event(&mut watcher, &registry, &prefix) => result,
                };

                match result {
                    Ok(event) => {
                        backoff.reset();
                        tracing::trace!(key = %event.key, index = event.index, "Registry change");
                        let _ = tx.try_send(());
                    }
                    Err(RegistryError::CursorCompacted { requested, oldest }) => {
                        tracing::debug!(prefix = %prefix, requested, oldest, "Watch cursor compacted, resyncing");
                        watcher = None;
                        let _ = tx.try_send(());
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        tracing::warn!(prefix = %prefix, error = %e, retry_in_ms = delay.as_millis() as u64, "Registry watch failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }

                if tx.is_closed() {
                    break;
                }
            }
        });
    }
}

async fn next_event(
    watcher: &mut Option<Watcher>,
    registry: &Arc<dyn Registry>,
    prefix: &str,
) -> Result<WatchEvent, RegistryError> {
    let w = match watcher.take() {
        Some(w) => w,
        None => Watcher::new(registry.clone(), prefix).await?,
    };
    watcher.insert(w).next().await
}
