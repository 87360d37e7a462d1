//! Caller-facing event sink.

use tokio::sync::mpsc;

use crate::core::events::StreamEvent;
use crate::core::session::Message;

/// Receives the events of a request and its single terminal outcome.
///
/// Exactly one of `on_complete` / `on_error` is called per request, after
/// every `on_event` for that request.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &StreamEvent);

    /// Called for events that carry a progress fraction.
    fn on_progress(&self, _progress: f32) {}

    fn on_complete(&self, message: &Message);

    fn on_error(&self, error: &str);

    /// Republishes a stored message when a session is resumed.
    fn on_message(&self, _message: &Message) {}
}

/// Everything a [`ChannelSink`] forwards.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Event(StreamEvent),
    Progress(f32),
    Complete(Message),
    Error(String),
    Message(Message),
}

impl SinkEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SinkEvent::Complete(_) | SinkEvent::Error(_))
    }
}

/// Forwards sink calls into an unbounded channel, for consumers that want to
/// `await` the outcome.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SinkEvent) {
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: &StreamEvent) {
        self.forward(SinkEvent::Event(event.clone()));
    }

    fn on_progress(&self, progress: f32) {
        self.forward(SinkEvent::Progress(progress));
    }

    fn on_complete(&self, message: &Message) {
        self.forward(SinkEvent::Complete(message.clone()));
    }

    fn on_error(&self, error: &str) {
        self.forward(SinkEvent::Error(error.to_string()));
    }

    fn on_message(&self, message: &Message) {
        self.forward(SinkEvent::Message(message.clone()));
    }
}
