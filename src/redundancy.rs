//! Redundancy layer: one logical channel over N physical paths
//!
//! Every safety packet is wrapped in a [`RedundancyPacket`] carrying the
//! channel-wide `seq_tx` and sent over all paths. The receiving
//! [`RedundancyChannel`] turns the union of the path streams back into one
//! ordered, duplicate-free stream:
//!
//! - the expected packet is released at once, followed by any deferred
//!   packets that are now contiguous
//! - packets already released or already deferred are duplicates
//! - packets ahead of the expected one wait in a small defer queue; a full
//!   queue or an entry older than T_seq force-releases the lowest entry,
//!   declaring the gap before it lost
use std::collections::VecDeque;
use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::checksum::SafetyCode;
use crate::config::RedundancyConfig;
use crate::diagnostics::{PathDiagnosticsCollector, TransportDiagnostics};
use crate::packet::RedundancyPacket;

/// Distance ahead of `seq_rx`, in defer queue capacities, that is still accepted
const DEFER_WINDOW_FACTOR: u32 = 10;

/// One physical path to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportChannel {
    pub address: SocketAddr,
    /// Index of the local socket used for this path
    pub socket_index: usize,
    pub connected: bool,
}

#[derive(Debug, Clone)]
struct DeferredPacket {
    sequence_number: u32,
    inner: Vec<u8>,
    received_ms: u64,
}

/// Bounded reorder buffer keyed by redundancy sequence number
#[derive(Debug, Clone)]
pub struct DeferQueue {
    entries: Vec<DeferredPacket>,
    capacity: usize,
}

impl DeferQueue {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity), capacity }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, sequence_number: u32) -> bool {
        self.entries.iter().any(|e| e.sequence_number == sequence_number)
    }

    fn insert(&mut self, sequence_number: u32, inner: Vec<u8>, received_ms: u64) {
        self.entries.push(DeferredPacket { sequence_number, inner, received_ms });
    }

    fn take(&mut self, sequence_number: u32) -> Option<DeferredPacket> {
        let index = self.entries.iter().position(|e| e.sequence_number == sequence_number)?;
        Some(self.entries.swap_remove(index))
    }

    /// Entry closest ahead of `base`
    fn lowest(&self, base: u32) -> Option<&DeferredPacket> {
        self.entries.iter().min_by_key(|e| e.sequence_number.wrapping_sub(base))
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Result of feeding one redundancy packet into a channel
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReceiveOutcome {
    /// Safety packets released to the ready queue
    pub released: usize,
    pub duplicate: bool,
    /// Packets skipped because a gap was declared lost
    pub lost: u32,
    pub diagnostics: Vec<TransportDiagnostics>,
}

/// Aggregation of all paths towards one peer
#[derive(Debug)]
pub struct RedundancyChannel {
    associated_id: u32,
    paths: Vec<TransportChannel>,
    max_paths: usize,
    seq_tx: u32,
    /// Next expected sequence number, unset until the first packet
    seq_rx: Option<u32>,
    defer: DeferQueue,
    ready: VecDeque<Vec<u8>>,
    ready_capacity: usize,
    t_seq: u64,
    diagnostics: PathDiagnosticsCollector,
    safety_code: SafetyCode,
}

impl RedundancyChannel {
    pub fn new(associated_id: u32, max_paths: usize, config: &RedundancyConfig, safety_code: SafetyCode) -> Self {
        Self {
            associated_id,
            paths: Vec::with_capacity(max_paths),
            max_paths,
            seq_tx: 0,
            seq_rx: None,
            defer: DeferQueue::new(config.defer_queue_capacity),
            ready: VecDeque::new(),
            ready_capacity: config.ready_queue_capacity,
            t_seq: config.t_seq,
            diagnostics: PathDiagnosticsCollector::new(config.n_diagnose, config.t_seq),
            safety_code,
        }
    }

    pub fn associated_id(&self) -> u32 {
        self.associated_id
    }

    pub fn paths(&self) -> &[TransportChannel] {
        &self.paths
    }

    pub fn paths_mut(&mut self) -> &mut [TransportChannel] {
        &mut self.paths
    }

    pub fn safety_code(&self) -> &SafetyCode {
        &self.safety_code
    }

    pub fn safety_code_mut(&mut self) -> &mut SafetyCode {
        &mut self.safety_code
    }

    pub fn defer_len(&self) -> usize {
        self.defer.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// The owner should drain the ready queue before feeding more packets
    pub fn needs_drain(&self) -> bool {
        self.defer.is_full() || self.ready.len() >= self.ready_capacity
    }

    /// Bind a remote address as a path if it is new and a slot is free
    pub fn bind_path(&mut self, address: SocketAddr, socket_index: usize) -> bool {
        if self.paths.iter().any(|p| p.address == address) || self.paths.len() >= self.max_paths {
            return false;
        }
        self.paths.push(TransportChannel { address, socket_index, connected: true });
        self.diagnostics.add_path(address);
        debug!(remote_id = self.associated_id, %address, socket_index, "bound transport path");
        true
    }

    /// Wrap an encoded safety packet for transmission, consuming one `seq_tx`
    pub fn wrap(&mut self, inner: Vec<u8>) -> RedundancyPacket {
        let packet = RedundancyPacket { sequence_number: self.seq_tx, inner };
        self.seq_tx = self.seq_tx.wrapping_add(1);
        packet
    }

    fn release(&mut self, inner: Vec<u8>, outcome: &mut ReceiveOutcome) {
        if self.ready.len() >= self.ready_capacity {
            warn!(remote_id = self.associated_id, capacity = self.ready_capacity, "ready queue saturated");
        }
        self.ready.push_back(inner);
        outcome.released += 1;
    }

    /// Release deferred entries that directly follow `seq_rx`
    fn release_contiguous(&mut self, outcome: &mut ReceiveOutcome) {
        while let Some(expected) = self.seq_rx {
            let Some(entry) = self.defer.take(expected) else {
                break;
            };
            self.seq_rx = Some(expected.wrapping_add(1));
            self.release(entry.inner, outcome);
        }
    }

    /// Give up on the gap before the lowest deferred entry
    fn force_release_lowest(&mut self, outcome: &mut ReceiveOutcome) -> bool {
        let Some(base) = self.seq_rx else {
            return false;
        };
        let Some(lowest) = self.defer.lowest(base).map(|e| e.sequence_number) else {
            return false;
        };
        let skipped = lowest.wrapping_sub(base);
        debug!(remote_id = self.associated_id, from = base, to = lowest, "declaring redundancy gap lost");
        outcome.lost += skipped;
        self.seq_rx = Some(lowest);
        self.release_contiguous(outcome);
        true
    }

    /// Feed one decoded redundancy packet received on `path`
    pub fn receive(&mut self, packet: RedundancyPacket, path: SocketAddr, now_ms: u64) -> ReceiveOutcome {
        let mut outcome = ReceiveOutcome::default();
        let seq = packet.sequence_number;
        outcome.diagnostics = self.diagnostics.record(path, seq, now_ms);

        let expected = *self.seq_rx.get_or_insert(seq);
        if seq == expected {
            self.seq_rx = Some(seq.wrapping_add(1));
            self.release(packet.inner, &mut outcome);
            self.release_contiguous(&mut outcome);
            return outcome;
        }

        let ahead = seq.wrapping_sub(expected);
        if (ahead as i32) < 0 || self.defer.contains(seq) {
            outcome.duplicate = true;
            return outcome;
        }
        if ahead > DEFER_WINDOW_FACTOR.saturating_mul(self.defer.capacity.min(u32::MAX as usize) as u32) {
            warn!(remote_id = self.associated_id, seq, expected, "redundancy packet outside defer window, discarding");
            return outcome;
        }

        while self.defer.is_full() {
            if !self.force_release_lowest(&mut outcome) {
                break;
            }
        }
        match self.seq_rx {
            Some(rx) if rx == seq => {
                self.seq_rx = Some(seq.wrapping_add(1));
                self.release(packet.inner, &mut outcome);
                self.release_contiguous(&mut outcome);
            }
            Some(rx) if (seq.wrapping_sub(rx) as i32) < 0 => outcome.duplicate = true,
            _ => self.defer.insert(seq, packet.inner, now_ms),
        }
        outcome
    }

    /// Force-release deferred packets held longer than T_seq
    pub fn flush_expired(&mut self, now_ms: u64) -> ReceiveOutcome {
        let mut outcome = ReceiveOutcome::default();
        loop {
            let expired = match self.seq_rx.and_then(|base| self.defer.lowest(base)) {
                Some(entry) => now_ms.saturating_sub(entry.received_ms) >= self.t_seq,
                None => false,
            };
            if !expired || !self.force_release_lowest(&mut outcome) {
                break;
            }
        }
        outcome
    }

    /// Next in-order safety packet
    pub fn pop_ready(&mut self) -> Option<Vec<u8>> {
        self.ready.pop_front()
    }

    /// Forget the inbound stream; the next packet sets a new baseline
    pub fn reset_receive(&mut self) {
        self.seq_rx = None;
        self.defer.clear();
        self.ready.clear();
        self.diagnostics.reset();
    }

    /// Replace all paths, `endpoints[i]` going through local socket `i`
    pub fn rebind(&mut self, endpoints: &[SocketAddr]) {
        self.paths.clear();
        for (index, endpoint) in endpoints.iter().enumerate() {
            self.bind_path(*endpoint, index);
        }
    }

    /// Drop receive state and paths
    pub fn close(&mut self) {
        for path in &mut self.paths {
            path.connected = false;
        }
        self.defer.clear();
        self.ready.clear();
        self.diagnostics.reset();
    }
}
