//! Change notification sinks
//!
//! Mutating operations report the affected table or row as a
//! [`ResourceUri`]. Delivery is synchronous and best effort.

use crate::uri::ResourceUri;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

pub trait ChangeNotifier: Send + Sync {
    fn notify_change(&self, uri: &ResourceUri);
}

/// Logs every change at debug level when enabled
#[derive(Debug, Default)]
pub struct LogNotifier {
    enabled: bool,
}

impl LogNotifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl ChangeNotifier for LogNotifier {
    fn notify_change(&self, uri: &ResourceUri) {
        if self.enabled {
            debug!("changed: {}", uri);
        }
    }
}

/// Forwards changes into a channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: Sender<ResourceUri>,
}

impl ChannelNotifier {
    pub fn new(tx: Sender<ResourceUri>) -> Self {
        Self { tx }
    }

    pub fn unbounded() -> (Self, Receiver<ResourceUri>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }
}

impl ChangeNotifier for ChannelNotifier {
    fn notify_change(&self, uri: &ResourceUri) {
        // A dropped receiver only means nobody is listening
        let _ = self.tx.send(uri.clone());
    }
}

/// Keeps every change in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    changes: Mutex<Vec<ResourceUri>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> Vec<ResourceUri> {
        self.changes.lock().clone()
    }

    /// Return and clear the recorded changes
    pub fn take(&self) -> Vec<ResourceUri> {
        std::mem::take(&mut *self.changes.lock())
    }
}

impl ChangeNotifier for RecordingNotifier {
    fn notify_change(&self, uri: &ResourceUri) {
        self.changes.lock().push(uri.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier() {
        let (notifier, rx) = ChannelNotifier::unbounded();
        notifier.notify_change(&ResourceUri::row("auth", "notes", 3));
        assert_eq!(rx.try_recv().unwrap().id, Some(3));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_notifier_without_listener() {
        let (notifier, rx) = ChannelNotifier::unbounded();
        drop(rx);
        notifier.notify_change(&ResourceUri::table("auth", "notes"));
    }

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.notify_change(&ResourceUri::table("auth", "notes"));
        notifier.notify_change(&ResourceUri::row("auth", "notes", 1));
        assert_eq!(notifier.changes().len(), 2);
        assert_eq!(notifier.take().len(), 2);
        assert!(notifier.changes().is_empty());
    }
}
