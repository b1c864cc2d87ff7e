//! Notification batcher
//!
//! Coalesces attribute value changes into [`UpstreamEvent::AttributeValuesChanged`]
//! batches with a leading + trailing throttle:
//!
//! - a push while idle opens a window and flushes as soon as the window task runs
//! - pushes inside a window accumulate and are flushed when it ends, which opens
//!   the next window
//! - a window that ends with nothing queued closes
//!
//! [`NotificationBatcher::flush`] drains the queue on demand for teardown.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::events::{AttributeValue, UpstreamEvent};

#[derive(Default)]
struct BatchState {
    queue: Vec<AttributeValue>,
    window_open: bool,
}

/// Process-wide throttle for attribute value notifications
#[derive(Clone)]
pub struct NotificationBatcher {
    state: Arc<Mutex<BatchState>>,
    window: Duration,
    upstream: mpsc::UnboundedSender<UpstreamEvent>,
}

impl NotificationBatcher {
    /// Create a new batcher delivering to `upstream`
    pub fn new(window: Duration, upstream: mpsc::UnboundedSender<UpstreamEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BatchState::default())),
            window,
            upstream,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of values waiting for the next flush
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Queue a value change
    pub fn push(&self, value: AttributeValue) {
        info!(
            "Attribute value changed, handle: 0x{:04X}, value (0x): {}",
            value.handle,
            hex::encode_upper(&value.value)
        );

        let open_window = {
            let mut state = self.state.lock();
            state.queue.push(value);
            if state.window_open {
                false
            } else {
                state.window_open = true;
                true
            }
        };

        if open_window {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let batcher = self.clone();
                    handle.spawn(async move { batcher.run_window().await });
                }
                Err(_) => {
                    // no runtime to time the window: deliver right away
                    self.flush();
                    self.state.lock().window_open = false;
                }
            }
        }
    }

    /// Drain every queued value into one batch. Returns the batch size.
    pub fn flush(&self) -> usize {
        let values = std::mem::take(&mut self.state.lock().queue);
        let count = values.len();
        if count == 0 {
            return 0;
        }

        debug!("Flushing {} attribute value change(s)", count);
        if self
            .upstream
            .send(UpstreamEvent::AttributeValuesChanged { values })
            .is_err()
        {
            debug!("Upstream receiver dropped, discarding attribute batch");
        }
        count
    }

    async fn run_window(self) {
        loop {
            self.flush();
            tokio::time::sleep(self.window).await;

            let mut state = self.state.lock();
            if state.queue.is_empty() {
                state.window_open = false;
                return;
            }
        }
    }
}
