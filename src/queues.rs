//! Per-connection send and retransmission queues
//!
//! Outbound application messages wait in a bounded send queue until the next
//! send tick bundles them into a Data packet. Every transmitted Data packet
//! is kept in the bounded retransmission queue until the peer confirms it.
//! Neither queue ever blocks: a full send queue rejects the message back to
//! the caller, a full retransmission queue drops the new entry and the packet
//! loses replay capability.
use std::collections::VecDeque;

use tracing::warn;

use crate::packet::Packet;

/// `a` is at or before `b` in modular sequence space
pub fn seq_at_or_before(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

/// Outcome of recording a sent packet for retransmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retained {
    Stored,
    /// Queue at capacity, the packet cannot be replayed
    Dropped,
}

/// Bounded queues of one connection
#[derive(Debug)]
pub struct RetransmissionQueue {
    send_queue: VecDeque<Vec<u8>>,
    send_capacity: usize,
    unconfirmed: VecDeque<Packet>,
    retransmission_capacity: usize,
}

impl RetransmissionQueue {
    pub fn new(send_capacity: usize, retransmission_capacity: usize) -> Self {
        Self {
            send_queue: VecDeque::new(),
            send_capacity,
            unconfirmed: VecDeque::new(),
            retransmission_capacity,
        }
    }

    /// Queue an application message, handing it back when the queue is full
    pub fn push_message(&mut self, message: Vec<u8>) -> Result<(), Vec<u8>> {
        if self.send_queue.len() >= self.send_capacity {
            return Err(message);
        }
        self.send_queue.push_back(message);
        Ok(())
    }

    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    pub fn send_capacity(&self) -> usize {
        self.send_capacity
    }

    /// Pop up to `max_packet` messages for one Data packet
    pub fn take_batch(&mut self, max_packet: usize) -> Vec<Vec<u8>> {
        let count = self.send_queue.len().min(max_packet);
        self.send_queue.drain(..count).collect()
    }

    /// Keep a transmitted packet until it is confirmed
    pub fn record_sent(&mut self, packet: Packet) -> Retained {
        if self.unconfirmed.len() >= self.retransmission_capacity {
            warn!(
                sn = packet.sequence_number,
                capacity = self.retransmission_capacity,
                "discarding packet because retransmission queue is full"
            );
            return Retained::Dropped;
        }
        self.unconfirmed.push_back(packet);
        Retained::Stored
    }

    pub fn retransmission_len(&self) -> usize {
        self.unconfirmed.len()
    }

    pub fn is_retransmission_full(&self) -> bool {
        self.unconfirmed.len() >= self.retransmission_capacity
    }

    /// Drop every entry confirmed by `cs_r`, returning how many were removed
    pub fn purge_confirmed(&mut self, cs_r: u32) -> usize {
        let before = self.unconfirmed.len();
        while let Some(front) = self.unconfirmed.front() {
            if !seq_at_or_before(front.sequence_number, cs_r) {
                break;
            }
            self.unconfirmed.pop_front();
        }
        before - self.unconfirmed.len()
    }

    /// Take all unconfirmed packets for replay
    pub fn drain_unconfirmed(&mut self) -> Vec<Packet> {
        self.unconfirmed.drain(..).collect()
    }

    pub fn unconfirmed(&self) -> impl Iterator<Item = &Packet> {
        self.unconfirmed.iter()
    }

    pub fn clear(&mut self) {
        self.send_queue.clear();
        self.unconfirmed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SequenceFields;

    fn data(sn: u32) -> Packet {
        let seq = SequenceFields { sequence_number: sn, ..Default::default() };
        Packet::data(1, 2, seq, vec![vec![sn as u8]])
    }

    #[test]
    fn test_batch_respects_max_packet() {
        let mut queue = RetransmissionQueue::new(10, 10);
        for i in 0..5u8 {
            queue.push_message(vec![i]).unwrap();
        }
        assert_eq!(queue.take_batch(3), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(queue.take_batch(3), vec![vec![3], vec![4]]);
        assert!(queue.take_batch(3).is_empty());
    }

    #[test]
    fn test_full_send_queue_rejects() {
        let mut queue = RetransmissionQueue::new(1, 1);
        queue.push_message(b"a".to_vec()).unwrap();
        assert_eq!(queue.push_message(b"b".to_vec()), Err(b"b".to_vec()));
    }

    #[test]
    fn test_full_retransmission_queue_drops_new_entry() {
        let mut queue = RetransmissionQueue::new(4, 2);
        assert_eq!(queue.record_sent(data(1)), Retained::Stored);
        assert_eq!(queue.record_sent(data(2)), Retained::Stored);
        assert_eq!(queue.record_sent(data(3)), Retained::Dropped);
        let kept: Vec<u32> = queue.unconfirmed().map(|p| p.sequence_number).collect();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn test_purge_removes_confirmed_entries() {
        let mut queue = RetransmissionQueue::new(4, 8);
        for sn in 10..15 {
            queue.record_sent(data(sn));
        }
        assert_eq!(queue.purge_confirmed(12), 3);
        assert!(queue.unconfirmed().all(|p| p.sequence_number > 12));
        assert_eq!(queue.purge_confirmed(12), 0);
    }

    #[test]
    fn test_purge_across_wraparound() {
        let mut queue = RetransmissionQueue::new(4, 8);
        for sn in [u32::MAX - 1, u32::MAX, 0, 1] {
            queue.record_sent(data(sn));
        }
        assert_eq!(queue.purge_confirmed(0), 3);
        assert_eq!(queue.unconfirmed().next().map(|p| p.sequence_number), Some(1));
    }

    #[test]
    fn test_seq_ordering() {
        assert!(seq_at_or_before(5, 5));
        assert!(seq_at_or_before(5, 6));
        assert!(!seq_at_or_before(6, 5));
        assert!(seq_at_or_before(u32::MAX, 0));
    }
}
