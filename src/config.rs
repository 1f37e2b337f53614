//! Protocol configuration
//!
//! Values are plain data; parsing configuration files is left to the
//! embedding application. [`RastaConfigBuilder`] offers a fluent interface and
//! validates the combination on `build()`.
use std::net::SocketAddr;

use crate::checksum::{Checksum, RedundancyCheckCode, SafetyCodeType};
use crate::codec::{MAX_PACKET_LEN, REDUNDANCY_HEADER_LEN, SAFETY_HEADER_LEN};
use crate::errors::{RastaError, Result};

/// Largest defer queue; packets are accepted up to ten capacities ahead
pub const MAX_DEFER_QUEUE_CAPACITY: usize = 1 << 16;

/// Safety layer timing, queue and window parameters
#[derive(Debug, Clone)]
pub struct SendingConfig {
    /// Maximum accepted age of a confirmed timestamp (T_max, ms)
    pub t_max: u32,
    /// Heartbeat interval (T_h, ms)
    pub t_h: u32,
    /// Receive buffer size announced in ConnReq/ConnResp (N_SENDMAX)
    pub send_max: u16,
    /// Maximum application messages bundled into one Data packet
    pub max_packet: usize,
    /// Accepted distance of a received sequence number ahead of `sn_r`
    pub sn_window: u32,
    /// Capacity of the sent-but-unconfirmed packet queue
    pub retransmission_queue_capacity: usize,
    /// Capacity of the pending outbound application message queue
    pub send_queue_capacity: usize,
    /// Capacity of the received application message buffer
    pub receive_queue_capacity: usize,
    /// Largest single application message in bytes
    pub max_message_size: usize,
    /// Fixed initial sequence number; random when `None`
    pub initial_sequence_number: Option<u32>,
    /// Heartbeats per connection diagnostics window
    pub diag_window: u32,
    /// Interval for bundling queued messages into Data packets (ms)
    pub send_tick_ms: u64,
    /// Give up on a handshake after this long (ms), 0 disables
    pub handshake_timeout_ms: u64,
}

impl Default for SendingConfig {
    fn default() -> Self {
        Self {
            t_max: crate::DEFAULT_T_MAX_MS,
            t_h: crate::DEFAULT_T_H_MS,
            send_max: 20,
            max_packet: 3,
            sn_window: 200,
            retransmission_queue_capacity: 100,
            send_queue_capacity: 100,
            receive_queue_capacity: 100,
            max_message_size: crate::MAX_MESSAGE_SIZE,
            initial_sequence_number: None,
            diag_window: 5000,
            send_tick_ms: 10,
            handshake_timeout_ms: 2000,
        }
    }
}

/// Redundancy layer parameters
#[derive(Debug, Clone)]
pub struct RedundancyConfig {
    /// Local transport endpoints, one socket per physical path
    pub local_endpoints: Vec<SocketAddr>,
    /// Maximum time a packet is held back waiting for a gap (T_seq, ms)
    pub t_seq: u64,
    /// Length of a path diagnostics window in ms (N_diagnose)
    pub n_diagnose: u32,
    /// Capacity of the defer (reorder) queue
    pub defer_queue_capacity: usize,
    /// Capacity of the in-order ready queue handed to the safety layer
    pub ready_queue_capacity: usize,
    /// Check code appended to redundancy packets
    pub check_code: RedundancyCheckCode,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            local_endpoints: Vec::new(),
            t_seq: 100,
            n_diagnose: 200,
            defer_queue_capacity: 4,
            ready_queue_capacity: 128,
            check_code: RedundancyCheckCode::Crc32,
        }
    }
}

/// Key exchange mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KexMode {
    #[default]
    None,
    /// Session keys derived from a pre-shared key and fresh nonces
    PreSharedKey,
}

/// Key exchange parameters
#[derive(Debug, Clone)]
pub struct KexConfig {
    pub mode: KexMode,
    pub psk: Vec<u8>,
    /// Rekeying interval (ms), 0 disables rekeying
    pub rekeying_interval_ms: u64,
    /// Tolerance before a server treats a rekey as missed (ms)
    pub allowed_delay_ms: u64,
}

impl Default for KexConfig {
    fn default() -> Self {
        Self {
            mode: KexMode::None,
            psk: Vec::new(),
            rekeying_interval_ms: 0,
            allowed_delay_ms: crate::REKEYING_ALLOWED_DELAY_MS,
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct RastaConfig {
    /// RaSTA id of this node
    pub local_id: u32,
    /// Protocol version announced during the handshake
    pub version: [u8; 4],
    /// Remote versions accepted in addition to our own
    pub accepted_versions: Vec<[u8; 4]>,
    pub sending: SendingConfig,
    pub redundancy: RedundancyConfig,
    pub safety_code: SafetyCodeType,
    pub safety_key: Vec<u8>,
    pub kex: KexConfig,
}

impl RastaConfig {
    /// Check internal consistency of the configuration
    pub fn validate(&self) -> Result<()> {
        let s = &self.sending;
        if s.t_h == 0 || s.t_h >= s.t_max {
            return Err(RastaError::InvalidConfig(format!(
                "heartbeat interval {} ms must be non-zero and below T_max {} ms",
                s.t_h, s.t_max
            )));
        }
        if s.max_packet == 0 {
            return Err(RastaError::InvalidConfig("max_packet must be at least 1".to_string()));
        }
        if s.sn_window == 0 {
            return Err(RastaError::InvalidConfig("sn_window must be at least 1".to_string()));
        }
        if s.send_queue_capacity == 0 || s.receive_queue_capacity == 0 {
            return Err(RastaError::InvalidConfig("queue capacities must be non-zero".to_string()));
        }
        if s.max_message_size == 0 {
            return Err(RastaError::InvalidConfig("max_message_size must be at least 1".to_string()));
        }
        let datagram = self.max_datagram_len();
        if datagram > MAX_PACKET_LEN {
            return Err(RastaError::InvalidConfig(format!(
                "{} messages of {} bytes need a {} byte datagram, maximum {}",
                s.max_packet, s.max_message_size, datagram, MAX_PACKET_LEN
            )));
        }
        let r = &self.redundancy;
        if r.defer_queue_capacity == 0 || r.ready_queue_capacity == 0 {
            return Err(RastaError::InvalidConfig("redundancy queue capacities must be non-zero".to_string()));
        }
        if r.defer_queue_capacity > MAX_DEFER_QUEUE_CAPACITY {
            return Err(RastaError::InvalidConfig(format!(
                "defer queue capacity {} above {}",
                r.defer_queue_capacity, MAX_DEFER_QUEUE_CAPACITY
            )));
        }
        if r.n_diagnose == 0 {
            return Err(RastaError::InvalidConfig("n_diagnose must be at least 1".to_string()));
        }
        if self.safety_key.len() > self.safety_code.max_key_len() {
            return Err(RastaError::InvalidKeyLength(self.safety_key.len()));
        }
        if self.kex.mode == KexMode::PreSharedKey && self.kex.psk.is_empty() {
            return Err(RastaError::InvalidConfig("key exchange requires a pre-shared key".to_string()));
        }
        if self.kex.psk.len() > crate::kex::MAX_PSK_LEN {
            return Err(RastaError::InvalidKeyLength(self.kex.psk.len()));
        }
        if self.kex.mode == KexMode::None && self.kex.rekeying_interval_ms != 0 {
            return Err(RastaError::InvalidConfig("rekeying requires a key exchange mode".to_string()));
        }
        Ok(())
    }

    /// Redundancy datagram carrying a full Data packet
    pub fn max_datagram_len(&self) -> usize {
        let s = &self.sending;
        let messages = s.max_packet.saturating_mul(s.max_message_size.saturating_add(2));
        REDUNDANCY_HEADER_LEN
            .saturating_add(SAFETY_HEADER_LEN)
            .saturating_add(messages)
            .saturating_add(self.safety_code.code_len())
            .saturating_add(self.redundancy.check_code.code_len())
    }

    /// Whether a remote protocol version may be used
    pub fn version_accepted(&self, version: &[u8; 4]) -> bool {
        *version == self.version || self.accepted_versions.contains(version)
    }
}

/// Fluent builder for [`RastaConfig`]
pub struct RastaConfigBuilder {
    config: RastaConfig,
}

impl RastaConfigBuilder {
    /// Create a builder with protocol defaults for the given local id
    pub fn new(local_id: u32) -> Self {
        Self {
            config: RastaConfig {
                local_id,
                version: *crate::RASTA_VERSION,
                accepted_versions: Vec::new(),
                sending: SendingConfig::default(),
                redundancy: RedundancyConfig::default(),
                safety_code: SafetyCodeType::default(),
                safety_key: Vec::new(),
                kex: KexConfig::default(),
            },
        }
    }

    pub fn with_heartbeat(mut self, t_h: u32, t_max: u32) -> Self {
        self.config.sending.t_h = t_h;
        self.config.sending.t_max = t_max;
        self
    }

    pub fn with_send_max(mut self, send_max: u16) -> Self {
        self.config.sending.send_max = send_max;
        self
    }

    pub fn with_max_packet(mut self, max_packet: usize) -> Self {
        self.config.sending.max_packet = max_packet;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.config.sending.max_message_size = size;
        self
    }

    pub fn with_sn_window(mut self, window: u32) -> Self {
        self.config.sending.sn_window = window;
        self
    }

    pub fn with_queue_capacities(mut self, send: usize, retransmission: usize, receive: usize) -> Self {
        self.config.sending.send_queue_capacity = send;
        self.config.sending.retransmission_queue_capacity = retransmission;
        self.config.sending.receive_queue_capacity = receive;
        self
    }

    pub fn with_initial_sequence_number(mut self, sn: u32) -> Self {
        self.config.sending.initial_sequence_number = Some(sn);
        self
    }

    pub fn with_diag_window(mut self, window: u32) -> Self {
        self.config.sending.diag_window = window;
        self
    }

    pub fn with_handshake_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.sending.handshake_timeout_ms = timeout_ms;
        self
    }

    pub fn with_local_endpoints(mut self, endpoints: Vec<SocketAddr>) -> Self {
        self.config.redundancy.local_endpoints = endpoints;
        self
    }

    pub fn with_t_seq(mut self, t_seq: u64) -> Self {
        self.config.redundancy.t_seq = t_seq;
        self
    }

    pub fn with_n_diagnose(mut self, n_diagnose: u32) -> Self {
        self.config.redundancy.n_diagnose = n_diagnose;
        self
    }

    pub fn with_defer_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.redundancy.defer_queue_capacity = capacity;
        self
    }

    pub fn with_redundancy_check_code(mut self, check_code: RedundancyCheckCode) -> Self {
        self.config.redundancy.check_code = check_code;
        self
    }

    pub fn with_safety_code(mut self, kind: SafetyCodeType, key: &[u8]) -> Self {
        self.config.safety_code = kind;
        self.config.safety_key = key.to_vec();
        self
    }

    pub fn with_accepted_version(mut self, version: [u8; 4]) -> Self {
        self.config.accepted_versions.push(version);
        self
    }

    pub fn with_key_exchange(mut self, psk: &[u8], rekeying_interval_ms: u64) -> Self {
        self.config.kex.mode = KexMode::PreSharedKey;
        self.config.kex.psk = psk.to_vec();
        self.config.kex.rekeying_interval_ms = rekeying_interval_ms;
        self
    }

    pub fn with_rekeying_allowed_delay_ms(mut self, delay_ms: u64) -> Self {
        self.config.kex.allowed_delay_ms = delay_ms;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<RastaConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
