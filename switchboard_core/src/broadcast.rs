//! Minimal fan-out of status change notifications to subscribers.
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

/// Delivers cloned values to every live subscriber. Subscribers that dropped
/// their receiver are pruned on the next broadcast.
pub(crate) struct Broadcaster<T> {
    listeners: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Broadcaster<T> {
        Broadcaster {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (sender, receiver) = channel();
        self.listeners
            .lock()
            .expect("thread holding listener lock should not panic")
            .push(sender);
        receiver
    }

    pub fn broadcast(&self, value: T) {
        let mut listeners = self
            .listeners
            .lock()
            .expect("thread holding listener lock should not panic");
        listeners.retain(|listener| listener.send(value.clone()).is_ok());
    }
}
