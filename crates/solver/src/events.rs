use tokio::sync::mpsc;

use crate::exchange::ExchangeKind;
use crate::parse::ParsedResponse;
use crate::store::{ImageId, QueueKind};

/// Lifecycle notifications for the display layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    CaptureSucceeded { id: ImageId, queue: QueueKind },
    CaptureFailed { message: String },
    QueueChanged { queue: QueueKind, len: usize },
    ExchangeStarted { kind: ExchangeKind },
    /// One streamed fragment, in arrival order.
    ExchangeChunk { kind: ExchangeKind, text: String },
    ExchangeSucceeded {
        kind: ExchangeKind,
        response: ParsedResponse,
        /// The stream stopped early (timeout or unexpected close).
        partial: bool,
    },
    ExchangeFailed { kind: ExchangeKind, message: String },
}

/// Fire-and-forget sender. A dropped receiver just means nobody is watching.
#[derive(Debug, Clone, Default)]
pub struct ProgressSender {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
