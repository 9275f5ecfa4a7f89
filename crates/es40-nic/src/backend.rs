//! Host-side packet sink/source. A real host requires raw-socket or TAP
//! access, explicitly out of scope (spec.md §1); [`LoopbackBackend`] is the
//! only implementation provided and simply echoes transmitted frames back
//! as received ones, which is enough to exercise the ring-walk and
//! interrupt-summary logic end to end.

use std::collections::VecDeque;

pub trait NetBackend: Send {
    fn send(&mut self, frame: &[u8]);
    fn recv(&mut self) -> Option<Vec<u8>>;
}

#[derive(Default)]
pub struct LoopbackBackend {
    queue: VecDeque<Vec<u8>>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NetBackend for LoopbackBackend {
    fn send(&mut self, frame: &[u8]) {
        self.queue.push_back(frame.to_vec());
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_echoes_transmitted_frames() {
        let mut backend = LoopbackBackend::new();
        backend.send(&[1, 2, 3]);
        assert_eq!(backend.recv(), Some(vec![1, 2, 3]));
        assert_eq!(backend.recv(), None);
    }
}
