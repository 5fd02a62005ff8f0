//! Activity indicator shown while tool-call arguments stream in.
//!
//! The spinner runs as its own task. Stopping it is a handshake: signal the
//! task, then wait until it has cleared its frame, so no output lands on top
//! of a half-drawn spinner.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::progress::{Progress, ProgressSink};

pub const FRAMES: [char; 10] = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

pub const FRAME_INTERVAL: Duration = Duration::from_millis(100);

pub struct Spinner {
    cancel: Option<oneshot::Sender<()>>,
    cleared: oneshot::Receiver<()>,
    task: JoinHandle<()>,
}

impl Spinner {
    #[must_use]
    pub fn start(sink: Arc<dyn ProgressSink>, interval: Duration) -> Self {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let (cleared_tx, cleared_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut frame = 0usize;
            loop {
                tokio::select! {
                    // Also fires when the handle is dropped without `stop`.
                    _ = &mut cancel_rx => {
                        sink.emit(Progress::SpinnerClear);
                        let _ = cleared_tx.send(());
                        return;
                    }
                    _ = ticker.tick() => {
                        sink.emit(Progress::SpinnerFrame(FRAMES[frame % FRAMES.len()]));
                        frame = frame.wrapping_add(1);
                    }
                }
            }
        });

        Self {
            cancel: Some(cancel_tx),
            cleared: cleared_rx,
            task,
        }
    }

    /// Stop the spinner and wait until its frame is cleared.
    pub async fn stop(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if (&mut self.cleared).await.is_err() {
            // Task is gone without acknowledging; make sure it is not drawing.
            self.task.abort();
        }
    }
}
