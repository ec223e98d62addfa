//! Single-consumer event bus, the channel an embedder's UI dispatcher
//! drains. Producers
//! from any thread (session readers, timers, dialers) push events; a single
//! consumer drains them in emission order. Per-peer ordering is guaranteed
//! because the underlying channel is FIFO and every producer pushes rather
//! than mutates shared state directly.

use crossbeam_channel::{unbounded, Receiver, Sender};

pub struct EventBus<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        EventBus { tx, rx }
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cloneable handle producers use to emit events.
    pub fn sender(&self) -> EventSender<T> {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Blocks until an event is available.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Drains whatever is currently queued without blocking.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }
}

#[derive(Clone)]
pub struct EventSender<T> {
    tx: Sender<T>,
}

impl<T> EventSender<T> {
    pub fn emit(&self, event: T) {
        // The receiving end only ever disappears when the owning Network is
        // torn down; emitting into a closed bus is a benign no-op.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_emission_order() {
        let bus: EventBus<i32> = EventBus::new();
        let sender = bus.sender();
        for i in 0..5 {
            sender.emit(i);
        }
        assert_eq!(bus.drain(), vec![0, 1, 2, 3, 4]);
    }
}
