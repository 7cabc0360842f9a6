use std::collections::VecDeque;

use crate::media::IceCandidate;

/// Remote candidates that arrived before a remote description could take
/// them, kept in arrival order.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Appends everything buffered in `other` after our own candidates.
    pub fn absorb(&mut self, mut other: IceCandidateBuffer) {
        self.pending.append(&mut other.pending);
    }

    /// Removes and returns every buffered candidate, oldest first.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 127.0.0.1 {n} typ host"),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    #[test]
    fn drains_in_arrival_order_exactly_once() {
        let mut buffer = IceCandidateBuffer::new();
        for n in 1..=3 {
            buffer.push(candidate(n));
        }
        let drained = buffer.drain();
        assert_eq!(drained, vec![candidate(1), candidate(2), candidate(3)]);
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn absorbed_candidates_follow_existing_ones() {
        let mut adopted = IceCandidateBuffer::new();
        adopted.push(candidate(1));
        let mut orphans = IceCandidateBuffer::new();
        orphans.push(candidate(2));
        orphans.push(candidate(3));
        adopted.absorb(orphans);
        assert_eq!(adopted.len(), 3);
        assert_eq!(adopted.drain()[2], candidate(3));
    }
}
