//! Idle keepalive.
//!
//! Sends SSH_MSG_IGNORE at a fixed interval so that NAT boxes and idle
//! timers on the path keep the connection open. The payload is random so
//! that keepalives do not stand out as constant ciphertext.

use crate::ssh::message::ignore_message;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_platform::{RandomSource, TesseraResult};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};

/// Length of the random payload in a keepalive message.
pub const KEEPALIVE_PAYLOAD_LEN: usize = 16;

/// Background task that sends a keepalive every `interval`.
///
/// The task stops on the first send error, on [`stop`](Self::stop), or
/// when dropped.
pub struct KeepaliveTask {
    interval: Duration,
    stop_signal: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
    task_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for KeepaliveTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepaliveTask")
            .field("interval", &self.interval)
            .field("sent", &self.sent_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl KeepaliveTask {
    /// Creates a stopped task.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop_signal: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(AtomicU64::new(0)),
            task_handle: None,
        }
    }

    /// Interval between keepalives.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts sending. `send_fn` is called once per tick; an error ends
    /// the task. Starting a running task restarts it.
    pub fn start<F, Fut>(&mut self, send_fn: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = TesseraResult<()>> + Send + 'static,
    {
        self.stop();
        let interval = self.interval;
        let stop_signal = Arc::new(AtomicBool::new(false));
        self.stop_signal = Arc::clone(&stop_signal);
        let sent = Arc::clone(&self.sent);

        let handle = tokio::spawn(
            async move {
                debug!(?interval, "Keepalive started");
                loop {
                    tokio::time::sleep(interval).await;
                    if stop_signal.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = send_fn().await {
                        warn!(error = %e, "Keepalive failed, stopping");
                        break;
                    }
                    let count = sent.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(count, "Keepalive sent");
                }
                debug!("Keepalive stopped");
            }
            .in_current_span(),
        );
        self.task_handle = Some(handle);
    }

    /// Stops the task.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Keepalives sent so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an SSH_MSG_IGNORE carrying `len` random bytes.
pub fn keepalive_message(rng: &dyn RandomSource, len: usize) -> TesseraResult<Vec<u8>> {
    let mut data = vec![0u8; len];
    rng.fill(&mut data)?;
    Ok(ignore_message(&data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::message::MessageType;
    use crate::ssh::wire::Reader;
    use std::sync::atomic::AtomicUsize;
    use tessera_platform::{SystemRandomSource, TesseraError};

    #[test]
    fn test_keepalive_message_layout() {
        let rng = SystemRandomSource::new();
        let msg = keepalive_message(&rng, KEEPALIVE_PAYLOAD_LEN).unwrap();
        assert_eq!(msg[0], MessageType::Ignore as u8);
        let data = Reader::after_type(&msg).read_bytes().unwrap();
        assert_eq!(data.len(), KEEPALIVE_PAYLOAD_LEN);

        let other = keepalive_message(&rng, KEEPALIVE_PAYLOAD_LEN).unwrap();
        assert_ne!(msg, other);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_ticks_until_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut task = KeepaliveTask::new(Duration::from_secs(10));
        let counter = Arc::clone(&calls);
        task.start(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(task.sent_count(), 3);

        task.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_stops_on_error() {
        let mut task = KeepaliveTask::new(Duration::from_secs(1));
        task.start(|| async { Err(TesseraError::SessionClosed(None)) });
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(!task.is_running());
        assert_eq!(task.sent_count(), 0);
    }
}
