use super::log::LogEntry;
use tokio::sync::mpsc;
use tracing::debug;

/// Receives committed entries, in index order, exactly once each.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &LogEntry);
}

/// Forwards committed entries to an unbounded channel so the application
/// can consume them from its own task.
#[derive(Debug)]
pub struct ChannelStateMachine {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl ChannelStateMachine {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StateMachine for ChannelStateMachine {
    fn apply(&mut self, entry: &LogEntry) {
        if self.tx.send(entry.clone()).is_err() {
            debug!(index = entry.index, "Apply receiver dropped, discarding entry");
        }
    }
}

/// Collects applied entries in memory.
#[derive(Debug, Default)]
pub struct VecStateMachine {
    pub applied: Vec<LogEntry>,
}

impl StateMachine for VecStateMachine {
    fn apply(&mut self, entry: &LogEntry) {
        self.applied.push(entry.clone());
    }
}
