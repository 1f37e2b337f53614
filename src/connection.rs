//! Safety and retransmission layer state machine
//!
//! A [`Connection`] holds the protocol state towards one remote RaSTA id. It
//! performs no I/O and reads no clock: every entry point takes the current
//! time and returns the list of [`Effect`]s the engine has to carry out
//! (packets to send, timers to move, notifications to raise). Effects must be
//! applied in order; a session key installed after a send must not protect
//! that send.
//!
//! ```text
//! Closed ─connect→ Start ─ConnResp→ Up ⇄ RetrReq → RetrRun → Up
//! Down ─ConnReq→ Start ─Heartbeat→ Up
//!                        └─(PSK)→ KexReq/KexResp → KexAuth → Up
//! any ─fatal error / DiscReq / timeout→ Closed
//! ```
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::clock::wire_timestamp;
use crate::config::{KexMode, RastaConfig};
use crate::diagnostics::ConnectionDiagnosticsCollector;
use crate::errors::{RastaError, Result};
use crate::kex::KeyExchange;
use crate::notification::Notification;
use crate::packet::{ConnectionData, DecodedPacket, DisconnectReason, Packet, PacketType, Payload, SequenceFields};
use crate::queues::RetransmissionQueue;

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    /// Server side, waiting for a connection request
    Down,
    /// Handshake in progress
    Start,
    /// Server waiting for the client's KexRequest
    KexReq,
    /// Client waiting for the server's KexResponse
    KexResp,
    /// Server waiting for the client's KexAuth
    KexAuth,
    Up,
    /// Gap detected, retransmission requested
    RetrReq,
    /// Receiving retransmitted data
    RetrRun,
}

impl ConnectionState {
    /// Heartbeats flow and the peer timeout is enforced
    pub fn is_established(self) -> bool {
        matches!(self, Self::Up | Self::RetrReq | Self::RetrRun)
    }

    fn is_key_exchange(self) -> bool {
        matches!(self, Self::KexReq | Self::KexResp | Self::KexAuth)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "Closed",
            Self::Down => "Down",
            Self::Start => "Start",
            Self::KexReq => "KexReq",
            Self::KexResp => "KexResp",
            Self::KexAuth => "KexAuth",
            Self::Up => "Up",
            Self::RetrReq => "RetrReq",
            Self::RetrRun => "RetrRun",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Per-connection error counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    /// Check code or length mismatch
    pub safety: u32,
    /// Sender or receiver id mismatch
    pub address: u32,
    /// Sequence number out of range
    pub sn: u32,
    /// Confirmed sequence number invalid
    pub cs: u32,
    /// Unknown packet type
    pub packet_type: u32,
}

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(Packet),
    Notify(Notification),
    /// Enable the heartbeat send timer and the peer timeout timer
    ArmTimers { t_i: u32 },
    /// Restart the peer timeout with a new interval
    RescheduleTimeout { t_i: u32 },
    /// Postpone the next heartbeat by T_h
    RescheduleHeartbeat,
    DisarmTimers,
    ArmHandshakeTimer,
    ArmRekeyTimer,
    /// Tear down the peer's redundancy channel
    RemoveChannel,
    /// Rotate the safety code key of the peer's redundancy channel
    InstallSessionKey(Vec<u8>),
}

pub type Effects = Vec<Effect>;

/// Read-only view of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_id: u32,
    pub role: Role,
    pub state: ConnectionState,
    pub sn_t: u32,
    pub sn_r: u32,
    pub cs_t: u32,
    pub cs_r: u32,
    pub t_i: u32,
    pub errors: ErrorCounters,
    pub send_queue_len: usize,
    pub retransmission_queue_len: usize,
    pub received_len: usize,
    /// N_SENDMAX announced by the peer
    pub remote_send_max: u16,
}

/// Protocol state towards one peer
#[derive(Debug)]
pub struct Connection {
    config: Arc<RastaConfig>,
    my_id: u32,
    remote_id: u32,
    role: Role,
    state: ConnectionState,
    sn_t: u32,
    sn_r: u32,
    sn_i: u32,
    cs_t: u32,
    cs_r: u32,
    ts_r: u32,
    cts_r: u32,
    t_i: u32,
    errors: ErrorCounters,
    hb_locked: bool,
    remote_send_max: u16,
    queues: RetransmissionQueue,
    received: VecDeque<Vec<u8>>,
    diagnostics: ConnectionDiagnosticsCollector,
    kex: Option<KeyExchange>,
    kex_completed: bool,
    last_key_exchange_ms: Option<u64>,
}

impl Connection {
    fn key_exchange(config: &RastaConfig, role: Role, remote_id: u32) -> Result<Option<KeyExchange>> {
        match config.kex.mode {
            KexMode::None => Ok(None),
            KexMode::PreSharedKey => {
                let (client, server) = match role {
                    Role::Client => (config.local_id, remote_id),
                    Role::Server => (remote_id, config.local_id),
                };
                KeyExchange::new(&config.kex.psk, client, server).map(Some)
            }
        }
    }

    fn new(config: Arc<RastaConfig>, remote_id: u32, role: Role, initial_sn: u32) -> Result<Self> {
        let s = &config.sending;
        let kex = Self::key_exchange(&config, role, remote_id)?;
        Ok(Self {
            my_id: config.local_id,
            remote_id,
            role,
            state: match role {
                Role::Client => ConnectionState::Closed,
                Role::Server => ConnectionState::Down,
            },
            sn_t: initial_sn,
            sn_r: 0,
            sn_i: initial_sn,
            cs_t: 0,
            cs_r: 0,
            ts_r: 0,
            cts_r: 0,
            t_i: s.t_max,
            errors: ErrorCounters::default(),
            hb_locked: true,
            remote_send_max: 0,
            queues: RetransmissionQueue::new(s.send_queue_capacity, s.retransmission_queue_capacity),
            received: VecDeque::new(),
            diagnostics: ConnectionDiagnosticsCollector::new(s.t_max, s.diag_window),
            kex,
            kex_completed: false,
            last_key_exchange_ms: None,
            config,
        })
    }

    /// Connection that will actively connect to `remote_id`
    pub fn client(config: Arc<RastaConfig>, remote_id: u32, initial_sn: u32) -> Result<Self> {
        Self::new(config, remote_id, Role::Client, initial_sn)
    }

    /// Connection waiting in `Down` for a connection request
    pub fn server(config: Arc<RastaConfig>, remote_id: u32, initial_sn: u32) -> Result<Self> {
        Self::new(config, remote_id, Role::Server, initial_sn)
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn errors(&self) -> ErrorCounters {
        self.errors
    }

    pub fn t_i(&self) -> u32 {
        self.t_i
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            remote_id: self.remote_id,
            role: self.role,
            state: self.state,
            sn_t: self.sn_t,
            sn_r: self.sn_r,
            cs_t: self.cs_t,
            cs_r: self.cs_r,
            t_i: self.t_i,
            errors: self.errors,
            send_queue_len: self.queues.send_queue_len(),
            retransmission_queue_len: self.queues.retransmission_len(),
            received_len: self.received.len(),
            remote_send_max: self.remote_send_max,
        }
    }

    fn local_connection_data(&self) -> ConnectionData {
        ConnectionData { version: self.config.version, send_max: self.config.sending.send_max }
    }

    /// Sequence fields for the next outbound packet; consumes one sequence number
    fn next_seq(&mut self, now_ms: u64) -> SequenceFields {
        let seq = SequenceFields {
            sequence_number: self.sn_t,
            confirmed_sequence_number: self.cs_t,
            timestamp: wire_timestamp(now_ms),
            confirmed_timestamp: self.ts_r,
        };
        self.sn_t = self.sn_t.wrapping_add(1);
        seq
    }

    fn set_state(&mut self, new: ConnectionState, reason: Option<DisconnectReason>, fx: &mut Effects) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        debug!(remote_id = self.remote_id, %old, %new, "connection state changed");
        fx.push(Effect::Notify(Notification::ConnectionStateChanged {
            remote_id: self.remote_id,
            old,
            new,
            reason,
        }));
    }

    fn reset(&mut self) {
        self.queues.clear();
        self.hb_locked = true;
        self.t_i = self.config.sending.t_max;
        self.diagnostics.reset();
        self.kex_completed = false;
        self.last_key_exchange_ms = None;
    }

    /// Send a disconnection request, close and drop the redundancy channel;
    /// connections not yet past `Down` are only reset
    fn close(&mut self, reason: DisconnectReason, details: u16, now_ms: u64, fx: &mut Effects) {
        if matches!(self.state, ConnectionState::Down | ConnectionState::Closed) {
            self.reset();
            return;
        }
        info!(remote_id = self.remote_id, %reason, details, state = %self.state, "closing connection");
        let seq = self.next_seq(now_ms);
        fx.push(Effect::Send(Packet::disconnection_request(self.remote_id, self.my_id, seq, reason, details)));
        fx.push(Effect::DisarmTimers);
        fx.push(Effect::RemoveChannel);
        self.set_state(ConnectionState::Closed, Some(reason), fx);
        self.reset();
    }

    fn send_heartbeat(&mut self, now_ms: u64, fx: &mut Effects) {
        let seq = self.next_seq(now_ms);
        fx.push(Effect::Send(Packet::heartbeat(self.remote_id, self.my_id, seq)));
    }

    fn send_retransmission_request(&mut self, now_ms: u64, fx: &mut Effects) {
        let seq = self.next_seq(now_ms);
        fx.push(Effect::Send(Packet::retransmission_request(self.remote_id, self.my_id, seq)));
    }

    fn send_retransmission_response(&mut self, now_ms: u64, fx: &mut Effects) {
        let seq = self.next_seq(now_ms);
        fx.push(Effect::Send(Packet::retransmission_response(self.remote_id, self.my_id, seq)));
    }

    /// Replay every unconfirmed Data packet as RetrData under fresh sequence
    /// numbers, then close the burst with a heartbeat
    fn retransmit(&mut self, now_ms: u64, fx: &mut Effects) {
        let pending = self.queues.drain_unconfirmed();
        debug!(remote_id = self.remote_id, count = pending.len(), "retransmitting unconfirmed packets");
        for old in pending {
            let messages = match old.payload {
                Payload::Messages(messages) => messages,
                _ => continue,
            };
            let seq = self.next_seq(now_ms);
            let packet = Packet::retransmitted_data(self.remote_id, self.my_id, seq, messages);
            self.queues.record_sent(packet.clone());
            fx.push(Effect::Send(packet));
        }
        self.send_heartbeat(now_ms, fx);
    }

    // --- sequence checks -------------------------------------------------

    fn sn_in_seq(&self, packet: &Packet) -> bool {
        packet.sequence_number == self.sn_r
    }

    fn cts_in_seq(&self, packet: &Packet) -> bool {
        match packet.packet_type {
            PacketType::Heartbeat | PacketType::Data | PacketType::RetrData => {
                let delta = packet.confirmed_timestamp.wrapping_sub(self.cts_r);
                (delta as i32) >= 0 && delta < self.t_i
            }
            _ => true,
        }
    }

    fn sn_range_valid(&self, packet: &Packet) -> bool {
        match packet.packet_type {
            PacketType::ConnReq | PacketType::ConnResp | PacketType::RetrResp => true,
            _ => packet.sequence_number.wrapping_sub(self.sn_r) <= self.config.sending.sn_window,
        }
    }

    fn cs_valid(&self, packet: &Packet) -> bool {
        let cs = packet.confirmed_sequence_number;
        match packet.packet_type {
            PacketType::ConnReq => cs == 0,
            PacketType::ConnResp => cs == self.sn_i,
            _ => cs.wrapping_sub(self.cs_r) < self.sn_t.wrapping_sub(self.cs_r),
        }
    }

    fn message_authentic(&self, packet: &Packet) -> bool {
        packet.sender_id == self.remote_id && packet.receiver_id == self.my_id
    }

    fn rekeying_skipped(&self, now_ms: u64) -> bool {
        if self.role != Role::Server || self.state == ConnectionState::KexReq {
            return false;
        }
        let interval = self.config.kex.rekeying_interval_ms;
        match self.last_key_exchange_ms {
            Some(last) if interval > 0 => now_ms.saturating_sub(last) > interval + self.config.kex.allowed_delay_ms,
            _ => false,
        }
    }

    /// Handshake packet validation: check code, ids and confirmed sequence
    fn handshake_packet_valid(&self, decoded: &DecodedPacket) -> bool {
        decoded.checksum_correct && self.message_authentic(&decoded.packet) && self.cs_valid(&decoded.packet)
    }

    /// Adopt the peer's sequence state from an accepted packet
    fn accept_sequence(&mut self, packet: &Packet) {
        self.sn_r = packet.sequence_number.wrapping_add(1);
        self.cs_t = packet.sequence_number;
        self.cs_r = packet.confirmed_sequence_number;
        self.ts_r = packet.timestamp;
        self.queues.purge_confirmed(self.cs_r);
    }

    fn update_timeout(&mut self, packet: &Packet, now_ms: u64, fx: &mut Effects) -> u32 {
        let t_rtd = wire_timestamp(now_ms).wrapping_add(1).wrapping_sub(packet.confirmed_timestamp);
        self.t_i = self.config.sending.t_max.saturating_sub(t_rtd).max(1);
        fx.push(Effect::RescheduleTimeout { t_i: self.t_i });
        t_rtd
    }

    fn deliver(&mut self, packet: &Packet, fx: &mut Effects) {
        let capacity = self.config.sending.receive_queue_capacity;
        let mut delivered = 0;
        for message in packet.messages() {
            if self.received.len() >= capacity {
                warn!(remote_id = self.remote_id, capacity, "receive buffer full, dropping message");
                continue;
            }
            self.received.push_back(message.clone());
            delivered += 1;
        }
        if delivered > 0 {
            fx.push(Effect::Notify(Notification::DataReceived { remote_id: self.remote_id, messages: delivered }));
        }
    }

    fn mark_up(&mut self, fx: &mut Effects) {
        self.set_state(ConnectionState::Up, None, fx);
        fx.push(Effect::Notify(Notification::HandshakeComplete { remote_id: self.remote_id }));
    }

    // --- public entry points ---------------------------------------------

    /// Client: send the connection request
    pub fn connect(&mut self, now_ms: u64) -> Effects {
        let mut fx = Effects::new();
        self.reset();
        self.sn_i = self.sn_t;
        self.cs_t = 0;
        self.cts_r = wire_timestamp(now_ms);
        let packet = Packet::connection_request(
            self.remote_id,
            self.my_id,
            self.sn_t,
            wire_timestamp(now_ms),
            self.local_connection_data(),
        );
        self.sn_t = self.sn_t.wrapping_add(1);
        debug!(remote_id = self.remote_id, sn_i = self.sn_i, "sending connection request");
        fx.push(Effect::Send(packet));
        fx.push(Effect::ArmHandshakeTimer);
        self.set_state(ConnectionState::Start, None, &mut fx);
        fx
    }

    fn reject(&mut self, packet: &Packet, reason: DisconnectReason, now_ms: u64, fx: &mut Effects) {
        let seq = SequenceFields {
            sequence_number: self.sn_t,
            confirmed_sequence_number: packet.sequence_number,
            timestamp: wire_timestamp(now_ms),
            confirmed_timestamp: packet.timestamp,
        };
        fx.push(Effect::Send(Packet::disconnection_request(self.remote_id, self.my_id, seq, reason, 0)));
        fx.push(Effect::RemoveChannel);
        self.set_state(ConnectionState::Closed, Some(reason), fx);
        self.reset();
    }

    /// Server: process a connection request
    ///
    /// A connection in `Down` or `Closed` is (re)initialised as a server; in
    /// any other state the request is a protocol violation.
    pub fn handle_connection_request(&mut self, decoded: &DecodedPacket, initial_sn: u32, now_ms: u64) -> Effects {
        let mut fx = Effects::new();
        let packet = &decoded.packet;
        if !matches!(self.state, ConnectionState::Down | ConnectionState::Closed) {
            warn!(remote_id = self.remote_id, state = %self.state, "connection request in invalid state");
            self.close(DisconnectReason::UnexpectedType, 0, now_ms, &mut fx);
            return fx;
        }

        if self.role != Role::Server {
            self.role = Role::Server;
            // psk length was validated with the configuration
            self.kex = Self::key_exchange(&self.config, Role::Server, self.remote_id).ok().flatten();
        }
        self.state = ConnectionState::Down;
        self.reset();
        self.sn_t = initial_sn;
        self.sn_i = initial_sn;

        if !self.handshake_packet_valid(decoded) {
            warn!(remote_id = self.remote_id, "invalid connection request");
            self.reject(packet, DisconnectReason::ProtocolError, now_ms, &mut fx);
            return fx;
        }
        let Some(data) = packet.connection_data() else {
            self.reject(packet, DisconnectReason::ProtocolError, now_ms, &mut fx);
            return fx;
        };
        // same or lower version: the client decides
        if !(data.version <= self.config.version || self.config.version_accepted(&data.version)) {
            info!(remote_id = self.remote_id, version = ?data.version, "incompatible client version");
            self.reject(packet, DisconnectReason::IncompatibleVersion, now_ms, &mut fx);
            return fx;
        }

        self.sn_r = packet.sequence_number.wrapping_add(1);
        self.cs_t = packet.sequence_number;
        self.cs_r = self.sn_i.wrapping_sub(1);
        self.ts_r = packet.timestamp;
        self.cts_r = wire_timestamp(now_ms);
        self.remote_send_max = data.send_max;
        self.t_i = self.config.sending.t_max;

        let seq = self.next_seq(now_ms);
        let response = Packet::connection_response(self.remote_id, self.my_id, seq, self.local_connection_data());
        debug!(remote_id = self.remote_id, sn = seq.sequence_number, "sending connection response");
        self.set_state(ConnectionState::Start, None, &mut fx);
        fx.push(Effect::ArmHandshakeTimer);
        fx.push(Effect::Send(response));
        fx
    }

    /// Client: process a connection response
    pub fn handle_connection_response(&mut self, decoded: &DecodedPacket, now_ms: u64) -> Effects {
        let mut fx = Effects::new();
        let packet = &decoded.packet;
        if !self.handshake_packet_valid(decoded) {
            warn!(remote_id = self.remote_id, "invalid connection response");
            self.close(DisconnectReason::ProtocolError, 0, now_ms, &mut fx);
            return fx;
        }
        if self.state != ConnectionState::Start || self.role != Role::Client {
            warn!(remote_id = self.remote_id, state = %self.state, role = ?self.role, "unexpected connection response");
            self.close(DisconnectReason::UnexpectedType, 0, now_ms, &mut fx);
            return fx;
        }
        let version_ok = packet.connection_data().is_some_and(|data| self.config.version_accepted(&data.version));
        if !version_ok {
            info!(remote_id = self.remote_id, "server version not acceptable");
            self.close(DisconnectReason::IncompatibleVersion, 0, now_ms, &mut fx);
            return fx;
        }

        self.sn_r = packet.sequence_number.wrapping_add(1);
        self.cs_t = packet.sequence_number;
        self.cs_r = packet.confirmed_sequence_number;
        self.ts_r = packet.timestamp;
        self.remote_send_max = packet.connection_data().map_or(0, |data| data.send_max);

        self.send_heartbeat(now_ms, &mut fx);
        match self.kex.as_mut() {
            Some(kex) => {
                let body = kex.start();
                self.last_key_exchange_ms = Some(now_ms);
                let seq = self.next_seq(now_ms);
                fx.push(Effect::Send(Packet::kex(PacketType::KexRequest, self.remote_id, self.my_id, seq, body)));
                self.set_state(ConnectionState::KexResp, None, &mut fx);
            }
            None => self.mark_up(&mut fx),
        }
        self.hb_locked = false;
        fx.push(Effect::ArmTimers { t_i: self.t_i });
        fx
    }

    /// Process any packet other than ConnReq and ConnResp
    ///
    /// Runs the validity gates in order, each discarding the packet and
    /// counting the error: check code, ids, sequence range, confirmed
    /// sequence, then the rekeying deadline.
    pub fn handle_packet(&mut self, decoded: &DecodedPacket, now_ms: u64) -> Effects {
        let mut fx = Effects::new();
        let packet = &decoded.packet;
        let remote_id = self.remote_id;

        if !decoded.checksum_correct {
            error!(remote_id, packet_type = %packet.packet_type, "received packet checksum incorrect");
            self.errors.safety += 1;
            return fx;
        }
        if !self.message_authentic(packet) {
            error!(remote_id, sender = packet.sender_id, receiver = packet.receiver_id, "received packet invalid sender/receiver");
            self.errors.address += 1;
            return fx;
        }
        if !self.sn_range_valid(packet) {
            error!(remote_id, sn = packet.sequence_number, sn_r = self.sn_r, "received packet sn range invalid");
            self.errors.sn += 1;
            return fx;
        }
        if !self.cs_valid(packet) {
            error!(remote_id, cs = packet.confirmed_sequence_number, cs_r = self.cs_r, sn_t = self.sn_t, "received packet cs invalid");
            self.errors.cs += 1;
            return fx;
        }
        if self.rekeying_skipped(now_ms) {
            error!(remote_id, "did not receive key exchange request for rekeying in time");
            self.close(DisconnectReason::Timeout, 0, now_ms, &mut fx);
            return fx;
        }

        match packet.packet_type {
            PacketType::Heartbeat => self.on_heartbeat(packet, now_ms, &mut fx),
            PacketType::Data => self.on_data(packet, now_ms, &mut fx),
            PacketType::RetrReq => self.on_retransmission_request(packet, now_ms, &mut fx),
            PacketType::RetrResp => self.on_retransmission_response(packet, now_ms, &mut fx),
            PacketType::RetrData => self.on_retransmitted_data(packet, now_ms, &mut fx),
            PacketType::DiscReq => self.on_disconnection_request(packet, &mut fx),
            PacketType::KexRequest => self.on_kex_request(packet, now_ms, &mut fx),
            PacketType::KexResponse => self.on_kex_response(packet, now_ms, &mut fx),
            PacketType::KexAuth => self.on_kex_auth(packet, now_ms, &mut fx),
            PacketType::ConnReq | PacketType::ConnResp | PacketType::Unknown(_) => {
                error!(remote_id, packet_type = %packet.packet_type, "received unexpected packet type");
                self.errors.packet_type += 1;
            }
        }
        fx
    }

    fn on_heartbeat(&mut self, packet: &Packet, now_ms: u64, fx: &mut Effects) {
        let remote_id = self.remote_id;
        if self.state == ConnectionState::Start {
            if self.role == Role::Client {
                self.close(DisconnectReason::UnexpectedType, 0, now_ms, fx);
            } else if !self.sn_in_seq(packet) {
                info!(remote_id, "handshake heartbeat sn not in sequence");
                self.close(DisconnectReason::SeqError, 0, now_ms, fx);
            } else if !self.cts_in_seq(packet) {
                debug!(remote_id, "handshake heartbeat cts not in sequence");
                self.close(DisconnectReason::ProtocolError, 0, now_ms, fx);
            } else {
                debug!(remote_id, "heartbeat is valid, connection successful");
                self.accept_sequence(packet);
                self.cts_r = packet.confirmed_timestamp;
                if self.kex.is_some() {
                    self.set_state(ConnectionState::KexReq, None, fx);
                } else {
                    self.mark_up(fx);
                }
                self.hb_locked = false;
                fx.push(Effect::ArmTimers { t_i: self.t_i });
            }
            return;
        }

        if self.sn_in_seq(packet) {
            if !(matches!(self.state, ConnectionState::Up | ConnectionState::RetrRun) || self.state.is_key_exchange()) {
                return;
            }
            if !self.cts_in_seq(packet) {
                debug!(remote_id, cts = packet.confirmed_timestamp, cts_r = self.cts_r, "heartbeat cts not in sequence");
                self.close(DisconnectReason::Timeout, 0, now_ms, fx);
                return;
            }
            let t_rtd = self.update_timeout(packet, now_ms, fx);
            if let Some(diagnostics) = self.diagnostics.record(t_rtd, now_ms) {
                fx.push(Effect::Notify(Notification::ConnectionDiagnostics { remote_id, diagnostics }));
            }
            self.accept_sequence(packet);
            self.cts_r = packet.confirmed_timestamp;
            if self.state == ConnectionState::RetrRun {
                self.set_state(ConnectionState::Up, None, fx);
            }
        } else if matches!(self.state, ConnectionState::Up | ConnectionState::RetrRun) {
            info!(remote_id, sn = packet.sequence_number, sn_r = self.sn_r, "heartbeat sn not in sequence, requesting retransmission");
            self.send_retransmission_request(now_ms, fx);
            self.set_state(ConnectionState::RetrReq, None, fx);
        }
    }

    fn on_data(&mut self, packet: &Packet, now_ms: u64, fx: &mut Effects) {
        let remote_id = self.remote_id;
        if self.sn_in_seq(packet) {
            match self.state {
                ConnectionState::Start | ConnectionState::KexReq | ConnectionState::KexResp | ConnectionState::KexAuth => {
                    self.close(DisconnectReason::UnexpectedType, 0, now_ms, fx);
                }
                ConnectionState::Up | ConnectionState::RetrRun => {
                    if !self.cts_in_seq(packet) {
                        info!(remote_id, "data cts not in sequence");
                        self.errors.cs += 1;
                        self.close(DisconnectReason::ProtocolError, 0, now_ms, fx);
                        return;
                    }
                    self.deliver(packet, fx);
                    self.update_timeout(packet, now_ms, fx);
                    self.accept_sequence(packet);
                    self.cts_r = packet.confirmed_timestamp;
                }
                _ => {}
            }
            return;
        }
        match self.state {
            ConnectionState::Start => self.close(DisconnectReason::UnexpectedType, 0, now_ms, fx),
            ConnectionState::Up | ConnectionState::RetrRun => {
                self.errors.sn += 1;
                info!(remote_id, sn = packet.sequence_number, sn_r = self.sn_r, "data sn not in sequence, requesting retransmission");
                self.send_retransmission_request(now_ms, fx);
                self.set_state(ConnectionState::RetrReq, None, fx);
            }
            ConnectionState::RetrReq => {
                debug!(remote_id, "data ignored while waiting for retransmission response");
            }
            _ => {}
        }
    }

    fn on_retransmission_request(&mut self, packet: &Packet, now_ms: u64, fx: &mut Effects) {
        info!(remote_id = self.remote_id, "received retransmission request");
        if self.sn_in_seq(packet) {
            if self.state == ConnectionState::RetrRun {
                warn!(remote_id = self.remote_id, "retransmission request during retransmission, closing");
                self.close(DisconnectReason::RetrFailed, 0, now_ms, fx);
                return;
            }
            self.accept_sequence(packet);
            self.send_retransmission_response(now_ms, fx);
            self.retransmit(now_ms, fx);
        } else {
            // gap on our side too: answer, replay, then ask for our own replay
            self.cs_r = packet.confirmed_sequence_number;
            self.queues.purge_confirmed(self.cs_r);
            self.send_retransmission_response(now_ms, fx);
            self.retransmit(now_ms, fx);
            self.send_retransmission_request(now_ms, fx);
            self.set_state(ConnectionState::RetrReq, None, fx);
        }
    }

    fn on_retransmission_response(&mut self, packet: &Packet, now_ms: u64, fx: &mut Effects) {
        if self.state != ConnectionState::RetrReq {
            error!(remote_id = self.remote_id, state = %self.state, "received retransmission response outside RetrReq");
            self.close(DisconnectReason::UnexpectedType, 0, now_ms, fx);
            return;
        }
        info!(remote_id = self.remote_id, "starting receive of retransmitted data");
        self.accept_sequence(packet);
        self.cts_r = packet.confirmed_timestamp;
        self.set_state(ConnectionState::RetrRun, None, fx);
    }

    fn on_retransmitted_data(&mut self, packet: &Packet, now_ms: u64, fx: &mut Effects) {
        if self.sn_in_seq(packet) {
            match self.state {
                ConnectionState::Up => self.close(DisconnectReason::UnexpectedType, 0, now_ms, fx),
                ConnectionState::RetrRun => {
                    if !self.cts_in_seq(packet) {
                        self.close(DisconnectReason::ProtocolError, 0, now_ms, fx);
                        return;
                    }
                    debug!(remote_id = self.remote_id, sn = packet.sequence_number, "adding retransmitted messages to buffer");
                    self.deliver(packet, fx);
                    self.accept_sequence(packet);
                }
                _ => {}
            }
            return;
        }
        debug!(remote_id = self.remote_id, sn = packet.sequence_number, sn_r = self.sn_r, "retransmitted data sn not in sequence");
        match self.state {
            ConnectionState::Up => self.close(DisconnectReason::UnexpectedType, 0, now_ms, fx),
            ConnectionState::RetrRun => {
                self.send_retransmission_request(now_ms, fx);
                self.set_state(ConnectionState::RetrReq, None, fx);
            }
            _ => {}
        }
    }

    fn on_disconnection_request(&mut self, packet: &Packet, fx: &mut Effects) {
        let data = packet.disconnection_data();
        let reason = data.map_or(DisconnectReason::Unknown(u16::MAX), |d| d.reason);
        let details = data.map_or(0, |d| d.details);
        info!(remote_id = self.remote_id, %reason, details, "received disconnection request");

        fx.push(Effect::DisarmTimers);
        self.set_state(ConnectionState::Closed, Some(reason), fx);
        self.reset();
        fx.push(Effect::RemoveChannel);
        fx.push(Effect::Notify(Notification::DisconnectRequested { remote_id: self.remote_id, reason, details }));
    }

    fn kex_body(packet: &Packet) -> &[u8] {
        match &packet.payload {
            Payload::Kex(body) | Payload::Raw(body) => body,
            _ => &[],
        }
    }

    fn on_kex_request(&mut self, packet: &Packet, now_ms: u64, fx: &mut Effects) {
        let allowed = self.role == Role::Server
            && matches!(self.state, ConnectionState::KexReq | ConnectionState::Up)
            && self.sn_in_seq(packet);
        let Some(kex) = self.kex.as_mut().filter(|_| allowed) else {
            self.close(DisconnectReason::UnexpectedType, 0, now_ms, fx);
            return;
        };
        match kex.respond(Self::kex_body(packet)) {
            Ok((body, key)) => {
                self.accept_sequence(packet);
                self.last_key_exchange_ms = Some(now_ms);
                let seq = self.next_seq(now_ms);
                fx.push(Effect::Send(Packet::kex(PacketType::KexResponse, self.remote_id, self.my_id, seq, body)));
                fx.push(Effect::InstallSessionKey(key));
                self.set_state(ConnectionState::KexAuth, None, fx);
            }
            Err(failure) => {
                warn!(remote_id = self.remote_id, ?failure, "key exchange request rejected");
                self.close(DisconnectReason::ProtocolError, 0, now_ms, fx);
            }
        }
    }

    fn on_kex_response(&mut self, packet: &Packet, now_ms: u64, fx: &mut Effects) {
        let allowed = self.role == Role::Client && self.state == ConnectionState::KexResp && self.sn_in_seq(packet);
        let Some(kex) = self.kex.as_mut().filter(|_| allowed) else {
            self.close(DisconnectReason::UnexpectedType, 0, now_ms, fx);
            return;
        };
        match kex.authenticate(Self::kex_body(packet)) {
            Ok((auth, key)) => {
                self.accept_sequence(packet);
                fx.push(Effect::InstallSessionKey(key));
                let seq = self.next_seq(now_ms);
                fx.push(Effect::Send(Packet::kex(PacketType::KexAuth, self.remote_id, self.my_id, seq, auth)));
                self.complete_key_exchange(fx);
            }
            Err(failure) => {
                warn!(remote_id = self.remote_id, ?failure, "key exchange response rejected");
                self.close(DisconnectReason::ProtocolError, 0, now_ms, fx);
            }
        }
    }

    fn on_kex_auth(&mut self, packet: &Packet, now_ms: u64, fx: &mut Effects) {
        let allowed = self.role == Role::Server && self.state == ConnectionState::KexAuth && self.sn_in_seq(packet);
        let Some(kex) = self.kex.as_mut().filter(|_| allowed) else {
            self.close(DisconnectReason::UnexpectedType, 0, now_ms, fx);
            return;
        };
        match kex.verify(Self::kex_body(packet)) {
            Ok(()) => {
                self.accept_sequence(packet);
                self.complete_key_exchange(fx);
            }
            Err(failure) => {
                warn!(remote_id = self.remote_id, ?failure, "key exchange authentication rejected");
                self.close(DisconnectReason::ProtocolError, 0, now_ms, fx);
            }
        }
    }

    fn complete_key_exchange(&mut self, fx: &mut Effects) {
        if self.kex_completed {
            info!(remote_id = self.remote_id, "session key renewed");
            self.set_state(ConnectionState::Up, None, fx);
            return;
        }
        self.kex_completed = true;
        self.mark_up(fx);
        if self.role == Role::Client && self.config.kex.rekeying_interval_ms > 0 {
            fx.push(Effect::ArmRekeyTimer);
        }
    }

    /// Heartbeat send timer fired
    pub fn heartbeat_tick(&mut self, now_ms: u64) -> Effects {
        let mut fx = Effects::new();
        if !self.hb_locked && self.state.is_established() {
            self.send_heartbeat(now_ms, &mut fx);
            debug!(remote_id = self.remote_id, "heartbeat sent");
        }
        fx
    }

    /// Peer timeout timer (T_i) fired
    pub fn heartbeat_timeout(&mut self, now_ms: u64) -> Effects {
        let mut fx = Effects::new();
        if self.hb_locked || !self.state.is_established() {
            return fx;
        }
        debug!(remote_id = self.remote_id, t_i = self.t_i, "T_i expired, disconnecting");
        fx.push(Effect::Notify(Notification::HeartbeatTimeout { remote_id: self.remote_id }));
        self.close(DisconnectReason::Timeout, 0, now_ms, &mut fx);
        fx
    }

    /// Handshake timer fired; closes a connection that never came up
    pub fn handshake_timeout(&mut self, now_ms: u64) -> Effects {
        let mut fx = Effects::new();
        if self.state == ConnectionState::Start || self.state.is_key_exchange() {
            warn!(remote_id = self.remote_id, state = %self.state, "handshake timed out");
            self.close(DisconnectReason::Timeout, 0, now_ms, &mut fx);
        }
        fx
    }

    /// Client rekeying timer fired
    pub fn rekey_tick(&mut self, now_ms: u64) -> Effects {
        let mut fx = Effects::new();
        if self.role != Role::Client || self.state != ConnectionState::Up {
            return fx;
        }
        if let Some(kex) = self.kex.as_mut() {
            info!(remote_id = self.remote_id, now_ms, "rekeying");
            let body = kex.start();
            self.last_key_exchange_ms = Some(now_ms);
            let seq = self.next_seq(now_ms);
            fx.push(Effect::Send(Packet::kex(PacketType::KexRequest, self.remote_id, self.my_id, seq, body)));
            self.set_state(ConnectionState::KexResp, None, &mut fx);
        }
        fx
    }

    /// Bundle queued application messages into one Data packet
    pub fn send_tick(&mut self, now_ms: u64) -> Effects {
        let mut fx = Effects::new();
        if !self.state.is_established() || self.queues.send_queue_len() == 0 {
            return fx;
        }
        let messages = self.queues.take_batch(self.config.sending.max_packet);
        debug!(remote_id = self.remote_id, count = messages.len(), "sending application messages from queue");
        let seq = self.next_seq(now_ms);
        let packet = Packet::data(self.remote_id, self.my_id, seq, messages);
        self.queues.record_sent(packet.clone());
        fx.push(Effect::Send(packet));
        fx.push(Effect::RescheduleHeartbeat);
        fx
    }

    /// Queue an application message for the next send tick
    pub fn push_message(&mut self, message: Vec<u8>) -> Result<()> {
        let max = self.config.sending.max_message_size;
        if message.len() > max {
            return Err(RastaError::MessageTooLarge { size: message.len(), max });
        }
        if !self.state.is_established() && !self.state.is_key_exchange() {
            return Err(RastaError::NotConnected { remote_id: self.remote_id, state: self.state });
        }
        self.queues.push_message(message).map_err(|_| RastaError::SendQueueFull {
            remote_id: self.remote_id,
            capacity: self.queues.send_capacity(),
        })
    }

    /// Next received application message
    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        self.received.pop_front()
    }

    /// User-initiated disconnect
    pub fn disconnect(&mut self, reason: DisconnectReason, details: u16, now_ms: u64) -> Effects {
        let mut fx = Effects::new();
        self.close(reason, details, now_ms, &mut fx);
        fx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RastaConfigBuilder;

    const CLIENT: u32 = 0x61;
    const SERVER: u32 = 0x60;

    fn config(id: u32) -> Arc<RastaConfig> {
        Arc::new(RastaConfigBuilder::new(id).build().unwrap())
    }

    fn sent(fx: &Effects) -> Vec<Packet> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Send(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn ok(packet: Packet) -> DecodedPacket {
        DecodedPacket { packet, checksum_correct: true }
    }

    /// Client and server after the three-way handshake at t = 1000
    fn established() -> (Connection, Connection) {
        let mut client = Connection::client(config(CLIENT), SERVER, 100).unwrap();
        let mut server = Connection::server(config(SERVER), CLIENT, 0).unwrap();

        let conn_req = sent(&client.connect(1000)).remove(0);
        let conn_resp = sent(&server.handle_connection_request(&ok(conn_req), 0, 1000)).remove(0);
        let hb = sent(&client.handle_connection_response(&ok(conn_resp), 1000)).remove(0);
        server.handle_packet(&ok(hb), 1000);
        (client, server)
    }

    #[test]
    fn test_handshake_scenario() {
        let mut client = Connection::client(config(CLIENT), SERVER, 100).unwrap();
        let mut server = Connection::server(config(SERVER), CLIENT, 0).unwrap();

        let conn_req = sent(&client.connect(1000)).remove(0);
        assert_eq!(conn_req.packet_type, PacketType::ConnReq);
        assert_eq!(conn_req.sequence_number, 100);
        assert_eq!(client.state(), ConnectionState::Start);

        let conn_resp = sent(&server.handle_connection_request(&ok(conn_req), 0, 1001)).remove(0);
        assert_eq!(conn_resp.sequence_number, 0);
        assert_eq!(conn_resp.confirmed_sequence_number, 100);
        assert_eq!(server.state(), ConnectionState::Start);

        let fx = client.handle_connection_response(&ok(conn_resp), 1002);
        let hb = sent(&fx).remove(0);
        assert_eq!(hb.packet_type, PacketType::Heartbeat);
        assert_eq!(hb.sequence_number, 101);
        assert_eq!(hb.confirmed_sequence_number, 0);
        assert_eq!(client.state(), ConnectionState::Up);
        assert!(fx.contains(&Effect::Notify(Notification::HandshakeComplete { remote_id: SERVER })));

        let fx = server.handle_packet(&ok(hb), 1003);
        assert_eq!(server.state(), ConnectionState::Up);
        assert!(fx.iter().any(|e| matches!(e, Effect::ArmTimers { .. })));
        assert_eq!(server.info().sn_r, 102);
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let mut client = Connection::client(config(CLIENT), SERVER, 1).unwrap();
        let mut server = Connection::server(config(SERVER), CLIENT, 0).unwrap();
        let mut conn_req = sent(&client.connect(0)).remove(0);
        conn_req.payload = Payload::Connection(ConnectionData { version: *b"0404", send_max: 20 });

        let fx = server.handle_connection_request(&ok(conn_req), 0, 0);
        let disc = sent(&fx).remove(0);
        assert_eq!(disc.packet_type, PacketType::DiscReq);
        assert_eq!(disc.disconnection_data().map(|d| d.reason), Some(DisconnectReason::IncompatibleVersion));
        assert_eq!(server.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_gates_count_errors() {
        let (_, mut server) = established();
        let seq = SequenceFields { sequence_number: 102, confirmed_sequence_number: 0, timestamp: 1000, confirmed_timestamp: 1000 };

        let corrupt = DecodedPacket { packet: Packet::heartbeat(SERVER, CLIENT, seq), checksum_correct: false };
        server.handle_packet(&corrupt, 1000);
        assert_eq!(server.errors().safety, 1);

        server.handle_packet(&ok(Packet::heartbeat(SERVER, 0x99, seq)), 1000);
        assert_eq!(server.errors().address, 1);

        let far = SequenceFields { sequence_number: 102 + 1000, ..seq };
        server.handle_packet(&ok(Packet::heartbeat(SERVER, CLIENT, far)), 1000);
        assert_eq!(server.errors().sn, 1);

        let bad_cs = SequenceFields { confirmed_sequence_number: 50, ..seq };
        server.handle_packet(&ok(Packet::heartbeat(SERVER, CLIENT, bad_cs)), 1000);
        assert_eq!(server.errors().cs, 1);

        server.handle_packet(&ok(Packet::new(PacketType::Unknown(1), SERVER, CLIENT, seq, Payload::None)), 1000);
        assert_eq!(server.errors().packet_type, 1);
        assert_eq!(server.info().sn_r, 102);
        assert_eq!(server.state(), ConnectionState::Up);
    }

    #[test]
    fn test_data_gap_requests_retransmission() {
        let (mut client, mut server) = established();
        let mut data = Vec::new();
        for i in 0..3u8 {
            client.push_message(vec![i]).unwrap();
            data.push(sent(&client.send_tick(1010 + 10 * i as u64)).remove(0));
        }
        let third = data.pop().unwrap();
        let first = data.remove(0);

        server.handle_packet(&ok(first), 1011);
        assert_eq!(server.pop_message(), Some(vec![0]));

        let fx = server.handle_packet(&ok(third), 1031);
        let retr_req = sent(&fx).remove(0);
        assert_eq!(retr_req.packet_type, PacketType::RetrReq);
        assert_eq!(server.state(), ConnectionState::RetrReq);
        assert_eq!(server.errors().sn, 1);
        assert!(server.pop_message().is_none());

        let replay = sent(&client.handle_packet(&ok(retr_req), 1040));
        let types: Vec<PacketType> = replay.iter().map(|p| p.packet_type).collect();
        assert_eq!(
            types,
            vec![PacketType::RetrResp, PacketType::RetrData, PacketType::RetrData, PacketType::Heartbeat]
        );
        assert_eq!(client.info().retransmission_queue_len, 2);

        for packet in replay {
            server.handle_packet(&ok(packet), 1041);
        }
        assert_eq!(server.state(), ConnectionState::Up);
        assert_eq!(server.pop_message(), Some(vec![1]));
        assert_eq!(server.pop_message(), Some(vec![2]));
    }

    #[test]
    fn test_replayed_packet_is_ignored() {
        let (mut client, mut server) = established();
        client.push_message(b"once".to_vec()).unwrap();
        let data = sent(&client.send_tick(1010)).remove(0);

        server.handle_packet(&ok(data.clone()), 1011);
        let before = server.info();
        let fx = server.handle_packet(&ok(data), 1012);

        assert!(fx.is_empty());
        assert_eq!(server.info().sn_r, before.sn_r);
        assert_eq!(server.pop_message(), Some(b"once".to_vec()));
        assert!(server.pop_message().is_none());
    }

    #[test]
    fn test_heartbeat_purges_confirmed_packets() {
        let (mut client, mut server) = established();
        client.push_message(b"x".to_vec()).unwrap();
        let data = sent(&client.send_tick(1010)).remove(0);
        assert_eq!(client.info().retransmission_queue_len, 1);

        server.handle_packet(&ok(data), 1011);
        let hb = sent(&server.heartbeat_tick(1020)).remove(0);
        client.handle_packet(&ok(hb), 1021);
        assert_eq!(client.info().retransmission_queue_len, 0);
    }

    #[test]
    fn test_timeout_closes_with_reason() {
        let (mut client, _) = established();
        let fx = client.heartbeat_timeout(2000);
        assert_eq!(client.state(), ConnectionState::Closed);
        let disc = sent(&fx).remove(0);
        assert_eq!(disc.disconnection_data().map(|d| d.reason), Some(DisconnectReason::Timeout));
        assert!(fx.contains(&Effect::Notify(Notification::HeartbeatTimeout { remote_id: SERVER })));
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::Notify(Notification::ConnectionStateChanged { new: ConnectionState::Closed, reason: Some(DisconnectReason::Timeout), .. })
        )));
    }

    #[test]
    fn test_disconnection_request_removes_channel() {
        let (mut client, mut server) = established();
        let local = client.disconnect(DisconnectReason::UserRequest, 7, 1010);
        let send_at = local.iter().position(|e| matches!(e, Effect::Send(_))).unwrap();
        let remove_at = local.iter().position(|e| *e == Effect::RemoveChannel).unwrap();
        assert!(send_at < remove_at);

        let disc = sent(&local).remove(0);
        let fx = server.handle_packet(&ok(disc), 1011);
        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(fx.contains(&Effect::RemoveChannel));
        assert!(fx.contains(&Effect::Notify(Notification::DisconnectRequested {
            remote_id: CLIENT,
            reason: DisconnectReason::UserRequest,
            details: 7,
        })));
    }

    #[test]
    fn test_send_rejected_when_not_up() {
        let mut client = Connection::client(config(CLIENT), SERVER, 1).unwrap();
        assert!(matches!(client.push_message(b"hi".to_vec()), Err(RastaError::NotConnected { .. })));
    }

    #[test]
    fn test_key_exchange_handshake() {
        let kex_config = |id| Arc::new(RastaConfigBuilder::new(id).with_key_exchange(b"psk", 0).build().unwrap());
        let mut client = Connection::client(kex_config(CLIENT), SERVER, 10).unwrap();
        let mut server = Connection::server(kex_config(SERVER), CLIENT, 20).unwrap();

        let conn_req = sent(&client.connect(0)).remove(0);
        let conn_resp = sent(&server.handle_connection_request(&ok(conn_req), 20, 1)).remove(0);
        let mut out = sent(&client.handle_connection_response(&ok(conn_resp), 2));
        assert_eq!(client.state(), ConnectionState::KexResp);
        let kex_request = out.pop().unwrap();
        let hb = out.pop().unwrap();

        server.handle_packet(&ok(hb), 3);
        assert_eq!(server.state(), ConnectionState::KexReq);
        let fx = server.handle_packet(&ok(kex_request), 3);
        assert_eq!(server.state(), ConnectionState::KexAuth);
        let server_key = fx.iter().find_map(|e| match e {
            Effect::InstallSessionKey(k) => Some(k.clone()),
            _ => None,
        });

        let kex_response = sent(&fx).remove(0);
        let fx = client.handle_packet(&ok(kex_response), 4);
        assert_eq!(client.state(), ConnectionState::Up);
        assert!(fx.contains(&Effect::InstallSessionKey(server_key.unwrap())));

        let auth = sent(&fx).remove(0);
        server.handle_packet(&ok(auth), 5);
        assert_eq!(server.state(), ConnectionState::Up);
    }

    fn session_key(fx: &Effects) -> Option<Vec<u8>> {
        fx.iter().find_map(|e| match e {
            Effect::InstallSessionKey(k) => Some(k.clone()),
            _ => None,
        })
    }

    /// Key exchange finished at t = 5, server's last exchange at t = 3
    fn rekeying_pair(rekeying_interval_ms: u64) -> (Connection, Connection, Vec<u8>) {
        let kex_config = |id| {
            Arc::new(
                RastaConfigBuilder::new(id)
                    .with_key_exchange(b"psk", rekeying_interval_ms)
                    .with_rekeying_allowed_delay_ms(100)
                    .build()
                    .unwrap(),
            )
        };
        let mut client = Connection::client(kex_config(CLIENT), SERVER, 10).unwrap();
        let mut server = Connection::server(kex_config(SERVER), CLIENT, 20).unwrap();

        let conn_req = sent(&client.connect(0)).remove(0);
        let conn_resp = sent(&server.handle_connection_request(&ok(conn_req), 20, 1)).remove(0);
        let mut out = sent(&client.handle_connection_response(&ok(conn_resp), 2));
        let kex_request = out.pop().unwrap();
        server.handle_packet(&ok(out.pop().unwrap()), 3);
        let fx = server.handle_packet(&ok(kex_request), 3);
        let key = session_key(&fx).unwrap();

        let fx = client.handle_packet(&ok(sent(&fx).remove(0)), 4);
        assert_eq!(fx.contains(&Effect::ArmRekeyTimer), rekeying_interval_ms > 0);
        server.handle_packet(&ok(sent(&fx).remove(0)), 5);
        assert_eq!(client.state(), ConnectionState::Up);
        assert_eq!(server.state(), ConnectionState::Up);
        (client, server, key)
    }

    #[test]
    fn test_rekey_renews_session_key() {
        let (mut client, mut server, first_key) = rekeying_pair(1000);

        let fx = client.rekey_tick(500);
        assert_eq!(client.state(), ConnectionState::KexResp);
        let request = sent(&fx).remove(0);
        assert_eq!(request.packet_type, PacketType::KexRequest);

        let fx = server.handle_packet(&ok(request), 501);
        assert_eq!(server.state(), ConnectionState::KexAuth);
        let renewed = session_key(&fx).unwrap();
        assert_ne!(renewed, first_key);

        let fx = client.handle_packet(&ok(sent(&fx).remove(0)), 502);
        assert_eq!(client.state(), ConnectionState::Up);
        assert_eq!(session_key(&fx), Some(renewed));
        assert!(!fx.iter().any(|e| matches!(e, Effect::Notify(Notification::HandshakeComplete { .. }))));

        let auth = sent(&fx).remove(0);
        assert_eq!(auth.packet_type, PacketType::KexAuth);
        server.handle_packet(&ok(auth), 503);
        assert_eq!(server.state(), ConnectionState::Up);

        // deadline moves with the renewed exchange
        assert!(!server.rekeying_skipped(1500));
        assert!(server.rekeying_skipped(1602));
    }

    #[test]
    fn test_rekey_tick_ignored_outside_up() {
        let (_, mut server, _) = rekeying_pair(1000);
        assert!(server.rekey_tick(500).is_empty());

        let mut idle = Connection::client(config(CLIENT), SERVER, 1).unwrap();
        assert!(idle.rekey_tick(500).is_empty());
        assert_eq!(idle.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_server_closes_when_rekey_missed() {
        let (mut client, mut server, _) = rekeying_pair(1000);
        assert!(!server.rekeying_skipped(1103));

        let hb = sent(&client.heartbeat_tick(1200)).remove(0);
        let fx = server.handle_packet(&ok(hb), 1200);
        assert_eq!(server.state(), ConnectionState::Closed);
        let disc = sent(&fx).remove(0);
        assert_eq!(disc.disconnection_data().map(|d| d.reason), Some(DisconnectReason::Timeout));
        assert!(fx.contains(&Effect::RemoveChannel));
    }

    #[test]
    fn test_no_rekey_deadline_without_interval() {
        let (mut client, mut server, _) = rekeying_pair(0);
        let hb = sent(&client.heartbeat_tick(100_000)).remove(0);
        assert!(!server.rekeying_skipped(100_000));
        server.handle_packet(&ok(hb), 100_000);
        assert_ne!(server.state(), ConnectionState::Closed);
    }

    /// Server in RetrRun after a lost Data packet; returns the client's replay
    /// with the RetrResp already processed
    fn retransmission_run() -> (Connection, Connection, Vec<Packet>) {
        let (mut client, mut server) = established();
        let mut data = Vec::new();
        for i in 0..3u8 {
            client.push_message(vec![i]).unwrap();
            data.push(sent(&client.send_tick(1010 + 10 * i as u64)).remove(0));
        }
        server.handle_packet(&ok(data.remove(0)), 1011);
        let retr_req = sent(&server.handle_packet(&ok(data.pop().unwrap()), 1031)).remove(0);

        let mut replay = sent(&client.handle_packet(&ok(retr_req), 1040));
        server.handle_packet(&ok(replay.remove(0)), 1041);
        assert_eq!(server.state(), ConnectionState::RetrRun);
        (client, server, replay)
    }

    #[test]
    fn test_data_delivered_during_retransmission_run() {
        let (_, mut server, replay) = retransmission_run();
        let mut replay = replay.into_iter();
        assert_eq!(server.pop_message(), Some(vec![0]));

        let mut first = replay.next().unwrap();
        first.packet_type = PacketType::Data;
        let fx = server.handle_packet(&ok(first), 1042);
        assert!(fx.contains(&Effect::Notify(Notification::DataReceived { remote_id: CLIENT, messages: 1 })));
        assert_eq!(server.state(), ConnectionState::RetrRun);
        assert_eq!(server.pop_message(), Some(vec![1]));

        for packet in replay {
            server.handle_packet(&ok(packet), 1043);
        }
        assert_eq!(server.state(), ConnectionState::Up);
        assert_eq!(server.pop_message(), Some(vec![2]));
    }

    #[test]
    fn test_retransmission_request_during_run_fails() {
        let (_, mut server, replay) = retransmission_run();
        let expected = server.info();
        let seq = SequenceFields {
            sequence_number: expected.sn_r,
            confirmed_sequence_number: expected.cs_r,
            ..replay[0].sequence_fields()
        };

        let fx = server.handle_packet(&ok(Packet::retransmission_request(SERVER, CLIENT, seq)), 1042);
        assert_eq!(server.state(), ConnectionState::Closed);
        let disc = sent(&fx).remove(0);
        assert_eq!(disc.disconnection_data().map(|d| d.reason), Some(DisconnectReason::RetrFailed));
    }

    #[test]
    fn test_sequence_counters_monotonic_across_wrap() {
        let mut client = Connection::client(config(CLIENT), SERVER, u32::MAX - 5).unwrap();
        let mut server = Connection::server(config(SERVER), CLIENT, u32::MAX - 3).unwrap();
        let conn_req = sent(&client.connect(1000)).remove(0);
        let conn_resp = sent(&server.handle_connection_request(&ok(conn_req), u32::MAX - 3, 1000)).remove(0);
        let hb = sent(&client.handle_connection_response(&ok(conn_resp), 1000)).remove(0);
        server.handle_packet(&ok(hb), 1000);
        assert_eq!(server.state(), ConnectionState::Up);

        let advanced = |old: u32, new: u32| (new.wrapping_sub(old) as i32) >= 0;
        let mut server_view = server.info();
        let mut client_view = client.info();
        for round in 0..20u8 {
            let now = 1010 + 10 * round as u64;
            client.push_message(vec![round]).unwrap();
            let data = sent(&client.send_tick(now)).remove(0);
            server.handle_packet(&ok(data), now + 1);
            assert_eq!(server.pop_message(), Some(vec![round]));

            let hb = sent(&server.heartbeat_tick(now + 2)).remove(0);
            client.handle_packet(&ok(hb), now + 3);

            let (s, c) = (server.info(), client.info());
            assert!(advanced(server_view.sn_r, s.sn_r) && advanced(server_view.cs_r, s.cs_r));
            assert!(advanced(client_view.sn_r, c.sn_r) && advanced(client_view.cs_r, c.cs_r));
            server_view = s;
            client_view = c;
        }
        assert_eq!(server.state(), ConnectionState::Up);
        assert_eq!(client.state(), ConnectionState::Up);
        assert!(server_view.sn_r < 100 && client_view.sn_r < 100);
        assert_eq!(client_view.retransmission_queue_len, 0);
        assert_eq!(server.errors(), ErrorCounters::default());
    }
}
