//! Connection and transport path diagnostics
//!
//! Two independent collectors live here:
//! - [`ConnectionDiagnosticsCollector`] builds histograms of round-trip
//!   (`t_rtd`) and alive (`t_alive`) times over a window of received
//!   heartbeats and data packets of one safety connection.
//! - [`PathDiagnosticsCollector`] tracks, per physical path of a redundancy
//!   channel, how many packets the path missed and how late it delivered
//!   compared with the fastest path.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// Number of histogram buckets between 0 and T_max
pub const DIAGNOSTIC_INTERVALS: usize = 5;

/// One histogram bucket `[start, end)`; the last bucket is open-ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticInterval {
    pub start: u32,
    pub end: u32,
    pub t_rtd_count: u32,
    pub t_alive_count: u32,
}

/// Snapshot emitted when a connection diagnostics window completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDiagnostics {
    pub intervals: Vec<DiagnosticInterval>,
    pub samples: u32,
}

#[derive(Debug, Clone)]
pub struct ConnectionDiagnosticsCollector {
    intervals: Vec<DiagnosticInterval>,
    window: u32,
    samples: u32,
    last_receive_ms: Option<u64>,
}

impl ConnectionDiagnosticsCollector {
    /// Buckets split `[0, t_max]` evenly; values beyond T_max land in the last bucket
    pub fn new(t_max: u32, window: u32) -> Self {
        let step = (t_max / DIAGNOSTIC_INTERVALS as u32).max(1);
        let intervals = (0..DIAGNOSTIC_INTERVALS as u32)
            .map(|i| DiagnosticInterval {
                start: i * step,
                end: if i + 1 == DIAGNOSTIC_INTERVALS as u32 { u32::MAX } else { (i + 1) * step },
                t_rtd_count: 0,
                t_alive_count: 0,
            })
            .collect();
        Self { intervals, window, samples: 0, last_receive_ms: None }
    }

    fn bucket(&mut self, value: u32) -> Option<&mut DiagnosticInterval> {
        self.intervals.iter_mut().find(|interval| value >= interval.start && value < interval.end)
    }

    /// Record one accepted packet; returns a snapshot when the window is full
    pub fn record(&mut self, t_rtd: u32, now_ms: u64) -> Option<ConnectionDiagnostics> {
        if let Some(interval) = self.bucket(t_rtd) {
            interval.t_rtd_count += 1;
        }
        if let Some(last) = self.last_receive_ms.replace(now_ms) {
            let t_alive = now_ms.saturating_sub(last).min(u32::MAX as u64) as u32;
            if let Some(interval) = self.bucket(t_alive) {
                interval.t_alive_count += 1;
            }
        }
        self.samples += 1;
        if self.window == 0 || self.samples < self.window {
            return None;
        }
        let snapshot = ConnectionDiagnostics { intervals: self.intervals.clone(), samples: self.samples };
        self.reset_window();
        Some(snapshot)
    }

    fn reset_window(&mut self) {
        for interval in &mut self.intervals {
            interval.t_rtd_count = 0;
            interval.t_alive_count = 0;
        }
        self.samples = 0;
    }

    /// Forget everything, including the last receive time
    pub fn reset(&mut self) {
        self.reset_window();
        self.last_receive_ms = None;
    }
}

/// Transport path figures for one diagnostics window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportDiagnostics {
    pub path: SocketAddr,
    /// Window length (ms)
    pub n_diagnose: u32,
    /// Packets seen on other paths but not on this one
    pub n_missed: u32,
    /// Sum of delays behind the first copy (ms)
    pub t_drift: u64,
    /// Sum of squared delays (ms²)
    pub t_drift2: u64,
}

/// Arrival record of one redundancy sequence number
#[derive(Debug, Clone)]
struct Arrival {
    first_seen_ms: u64,
    /// Delay behind the first copy, indexed like `paths`
    delays: Vec<Option<u64>>,
}

/// Per-path statistics of one redundancy channel
///
/// A window lasts `n_diagnose` ms from its start time. When it closes, every
/// sequence number first seen at least `settle_ms` earlier is settled: each
/// path either delivered it (adding its delay to the drift sums) or missed
/// it. Younger sequence numbers carry over into the next window, so a slow
/// path's copy arriving after the boundary is still matched with the first.
#[derive(Debug, Clone)]
pub struct PathDiagnosticsCollector {
    n_diagnose: u32,
    settle_ms: u64,
    window_start_ms: Option<u64>,
    paths: Vec<SocketAddr>,
    in_flight: HashMap<u32, Arrival>,
    /// Sequence numbers settled in the last window; late copies are ignored
    settled: HashSet<u32>,
}

impl PathDiagnosticsCollector {
    pub fn new(n_diagnose: u32, settle_ms: u64) -> Self {
        Self {
            n_diagnose,
            settle_ms,
            window_start_ms: None,
            paths: Vec::new(),
            in_flight: HashMap::new(),
            settled: HashSet::new(),
        }
    }

    pub fn add_path(&mut self, path: SocketAddr) -> usize {
        match self.paths.iter().position(|addr| *addr == path) {
            Some(index) => index,
            None => {
                self.paths.push(path);
                self.paths.len() - 1
            }
        }
    }

    /// Record the arrival of `seq` on `path`; returns a report when the window closes
    pub fn record(&mut self, path: SocketAddr, seq: u32, now_ms: u64) -> Vec<TransportDiagnostics> {
        let index = self.add_path(path);
        let start = *self.window_start_ms.get_or_insert(now_ms);

        if !self.settled.contains(&seq) {
            let path_count = self.paths.len();
            let arrival =
                self.in_flight.entry(seq).or_insert_with(|| Arrival { first_seen_ms: now_ms, delays: Vec::new() });
            if arrival.delays.len() < path_count {
                arrival.delays.resize(path_count, None);
            }
            if arrival.delays[index].is_none() {
                arrival.delays[index] = Some(now_ms.saturating_sub(arrival.first_seen_ms));
            }
        }

        if now_ms.saturating_sub(start) < self.n_diagnose as u64 {
            return Vec::new();
        }
        self.close_window(now_ms)
    }

    fn close_window(&mut self, now_ms: u64) -> Vec<TransportDiagnostics> {
        let mut report: Vec<TransportDiagnostics> = self
            .paths
            .iter()
            .map(|path| TransportDiagnostics {
                path: *path,
                n_diagnose: self.n_diagnose,
                n_missed: 0,
                t_drift: 0,
                t_drift2: 0,
            })
            .collect();

        let settle_ms = self.settle_ms;
        let mut settled = HashSet::new();
        self.in_flight.retain(|seq, arrival| {
            if now_ms.saturating_sub(arrival.first_seen_ms) < settle_ms {
                return true;
            }
            for (index, record) in report.iter_mut().enumerate() {
                match arrival.delays.get(index).copied().flatten() {
                    Some(delay) => {
                        record.t_drift += delay;
                        record.t_drift2 += delay * delay;
                    }
                    None => record.n_missed += 1,
                }
            }
            settled.insert(*seq);
            false
        });
        self.settled = settled;
        self.window_start_ms = Some(now_ms);
        report
    }

    pub fn reset(&mut self) {
        self.window_start_ms = None;
        self.in_flight.clear();
        self.settled.clear();
    }
}
