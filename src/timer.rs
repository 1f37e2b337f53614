//! Index-stable timer registry
//!
//! Timers live in a [`Slab`] addressed by [`TimerId`]. Every entry is stamped
//! with a generation when it is inserted, so a handle kept after its timer
//! was removed can never reach a timer that later reuses the slab index. All
//! timers are periodic: on expiry they are re-armed `interval` ms after the
//! firing time until disabled or removed.
use slab::Slab;

/// What a timer drives when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Send a heartbeat to the peer
    HeartbeatSend(u32),
    /// Peer silent for longer than T_i
    HeartbeatTimeout(u32),
    /// Client side periodic key exchange
    Rekey(u32),
    /// Handshake did not complete in time
    Handshake(u32),
}

/// Handle to a registered timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    kind: TimerKind,
    interval: u64,
    deadline: u64,
    enabled: bool,
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: Slab<Entry>,
    next_generation: u64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer; an enabled timer first fires at `now + interval`
    pub fn insert(&mut self, kind: TimerKind, interval: u64, now: u64, enabled: bool) -> TimerId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.timers.insert(Entry { generation, kind, interval, deadline: now + interval, enabled });
        TimerId { index, generation }
    }

    fn entry_mut(&mut self, id: TimerId) -> Option<&mut Entry> {
        self.timers.get_mut(id.index).filter(|entry| entry.generation == id.generation)
    }

    fn entry(&self, id: TimerId) -> Option<&Entry> {
        self.timers.get(id.index).filter(|entry| entry.generation == id.generation)
    }

    /// Deregister a timer; stale handles are ignored
    pub fn remove(&mut self, id: TimerId) -> bool {
        if self.entry(id).is_none() {
            return false;
        }
        self.timers.try_remove(id.index).is_some()
    }

    /// Enable and arm the timer at `now + interval`
    pub fn enable(&mut self, id: TimerId, now: u64) {
        if let Some(entry) = self.entry_mut(id) {
            entry.enabled = true;
            entry.deadline = now + entry.interval;
        }
    }

    pub fn disable(&mut self, id: TimerId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.enabled = false;
        }
    }

    /// Push the deadline out to `now + interval`
    pub fn reschedule(&mut self, id: TimerId, now: u64) {
        if let Some(entry) = self.entry_mut(id) {
            entry.deadline = now + entry.interval;
        }
    }

    /// Change the interval and reschedule from `now`
    pub fn set_interval(&mut self, id: TimerId, interval: u64, now: u64) {
        if let Some(entry) = self.entry_mut(id) {
            entry.interval = interval;
            entry.deadline = now + interval;
        }
    }

    pub fn is_enabled(&self, id: TimerId) -> bool {
        self.entry(id).is_some_and(|entry| entry.enabled)
    }

    pub fn deadline(&self, id: TimerId) -> Option<u64> {
        self.entry(id).filter(|entry| entry.enabled).map(|entry| entry.deadline)
    }

    /// Earliest deadline among enabled timers
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.iter().map(|(_, entry)| entry).filter(|entry| entry.enabled).map(|entry| entry.deadline).min()
    }

    /// Collect expired timers in deadline order and re-arm them
    pub fn pop_expired(&mut self, now: u64) -> Vec<(TimerId, TimerKind)> {
        let mut expired: Vec<(u64, TimerId, TimerKind)> = Vec::new();
        for (index, entry) in self.timers.iter_mut() {
            if entry.enabled && entry.deadline <= now {
                expired.push((entry.deadline, TimerId { index, generation: entry.generation }, entry.kind));
                entry.deadline = now + entry.interval.max(1);
            }
        }
        expired.sort_by_key(|(deadline, id, _)| (*deadline, id.index));
        expired.into_iter().map(|(_, id, kind)| (id, kind)).collect()
    }

    /// Number of registered timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_order_and_rearm() {
        let mut timers = TimerRegistry::new();
        let slow = timers.insert(TimerKind::HeartbeatTimeout(1), 50, 0, true);
        let fast = timers.insert(TimerKind::HeartbeatSend(1), 20, 0, true);

        assert!(timers.pop_expired(10).is_empty());
        assert_eq!(timers.pop_expired(60), vec![(fast, TimerKind::HeartbeatSend(1)), (slow, TimerKind::HeartbeatTimeout(1))]);
        assert_eq!(timers.deadline(fast), Some(80));
        assert_eq!(timers.next_deadline(), Some(80));
    }

    #[test]
    fn test_disabled_timer_does_not_fire() {
        let mut timers = TimerRegistry::new();
        let id = timers.insert(TimerKind::Rekey(2), 10, 0, false);
        assert!(timers.pop_expired(100).is_empty());
        timers.enable(id, 100);
        assert_eq!(timers.pop_expired(110).len(), 1);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut timers = TimerRegistry::new();
        let old = timers.insert(TimerKind::Handshake(1), 10, 0, true);
        assert!(timers.remove(old));
        let new = timers.insert(TimerKind::Handshake(2), 10, 0, true);
        assert!(!timers.remove(old));
        timers.disable(old);
        assert!(timers.is_enabled(new));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_set_interval_reschedules() {
        let mut timers = TimerRegistry::new();
        let id = timers.insert(TimerKind::HeartbeatTimeout(1), 750, 0, true);
        timers.set_interval(id, 600, 100);
        assert_eq!(timers.deadline(id), Some(700));
        timers.reschedule(id, 200);
        assert_eq!(timers.deadline(id), Some(800));
    }
}
