//! Protocol engine: connections, timers and the redundancy multiplexer
//!
//! The engine is the single owner of all protocol state. It is driven from
//! outside by two calls:
//!
//! - [`Engine::handle_datagram`] for every datagram read from a local socket
//! - [`Engine::poll`] periodically (at least every send tick) to fire timers,
//!   release stale deferred packets and flush queued application messages
//!
//! Nothing blocks and nothing is read from the network here, so the same
//! engine runs under the tokio [`crate::node::RastaNode`] and under a manual
//! clock in tests.
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::codec::split_datagram;
use crate::config::RastaConfig;
use crate::connection::{Connection, ConnectionInfo, ConnectionState, Effect, Effects, Role};
use crate::errors::{RastaError, Result};
use crate::mux::RedundancyMultiplexer;
use crate::notification::{Notification, NotificationKind, Notifier};
use crate::packet::{DecodedPacket, DisconnectReason, PacketType};
use crate::redundancy::RedundancyChannel;
use crate::timer::{TimerId, TimerKind, TimerRegistry};
use crate::transport::DatagramSocket;

/// Undelivered notifications kept for polling
const NOTIFICATION_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct PeerTimers {
    heartbeat: TimerId,
    timeout: TimerId,
    handshake: TimerId,
    rekey: TimerId,
}

impl PeerTimers {
    fn register(timers: &mut TimerRegistry, remote_id: u32, config: &RastaConfig, now: u64) -> Self {
        let s = &config.sending;
        Self {
            heartbeat: timers.insert(TimerKind::HeartbeatSend(remote_id), s.t_h as u64, now, false),
            timeout: timers.insert(TimerKind::HeartbeatTimeout(remote_id), s.t_max as u64, now, false),
            handshake: timers.insert(TimerKind::Handshake(remote_id), s.handshake_timeout_ms, now, false),
            // the client renews the key every half interval
            rekey: timers.insert(TimerKind::Rekey(remote_id), (config.kex.rekeying_interval_ms / 2).max(1), now, false),
        }
    }

    fn disarm(&self, timers: &mut TimerRegistry) {
        for id in [self.heartbeat, self.timeout, self.handshake, self.rekey] {
            timers.disable(id);
        }
    }

    fn remove(&self, timers: &mut TimerRegistry) {
        for id in [self.heartbeat, self.timeout, self.handshake, self.rekey] {
            timers.remove(id);
        }
    }
}

#[derive(Debug)]
struct Peer {
    connection: Connection,
    timers: PeerTimers,
}

pub struct Engine<S, C> {
    config: Arc<RastaConfig>,
    clock: C,
    mux: RedundancyMultiplexer<S>,
    peers: BTreeMap<u32, Peer>,
    timers: TimerRegistry,
    notifier: Notifier,
    /// Server-side connections that came up and were not yet accepted
    accepted: VecDeque<u32>,
    closed: bool,
}

impl<S: DatagramSocket, C: Clock> Engine<S, C> {
    /// Validate the configuration and take ownership of the local sockets
    ///
    /// Socket `i` carries path `i` to every peer.
    pub fn init(config: RastaConfig, clock: C, sockets: Vec<S>) -> Result<Self> {
        config.validate()?;
        if sockets.is_empty() {
            return Err(RastaError::InvalidConfig("at least one local socket is required".to_string()));
        }
        let endpoints = config.redundancy.local_endpoints.len();
        if endpoints != 0 && endpoints != sockets.len() {
            return Err(RastaError::EndpointMismatch { given: sockets.len(), local: endpoints });
        }
        info!(local_id = config.local_id, paths = sockets.len(), "engine initialised");
        Ok(Self {
            mux: RedundancyMultiplexer::new(&config, sockets),
            config: Arc::new(config),
            clock,
            peers: BTreeMap::new(),
            timers: TimerRegistry::new(),
            notifier: Notifier::new(NOTIFICATION_QUEUE_CAPACITY),
            accepted: VecDeque::new(),
            closed: false,
        })
    }

    pub fn local_id(&self) -> u32 {
        self.config.local_id
    }

    pub fn config(&self) -> &RastaConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn mux(&self) -> &RedundancyMultiplexer<S> {
        &self.mux
    }

    pub fn channel(&self, remote_id: u32) -> Option<&RedundancyChannel> {
        self.mux.get_channel(remote_id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RastaError::Closed);
        }
        Ok(())
    }

    fn initial_sequence_number(&self) -> u32 {
        self.config.sending.initial_sequence_number.unwrap_or_else(rand::random)
    }

    /// Open a connection to `remote_id` reachable at `endpoints`
    ///
    /// `endpoints[i]` is reached through local socket `i`. Completion is
    /// reported through the handshake-complete notification.
    pub fn connect(&mut self, remote_id: u32, endpoints: &[SocketAddr]) -> Result<()> {
        self.ensure_open()?;
        if let Some(peer) = self.peers.get(&remote_id) {
            if !matches!(peer.connection.state(), ConnectionState::Closed | ConnectionState::Down) {
                return Err(RastaError::ConnectionExists(remote_id));
            }
        }
        self.mux.add_channel(remote_id, endpoints)?;

        let now = self.clock.now_ms();
        let connection = Connection::client(Arc::clone(&self.config), remote_id, self.initial_sequence_number())?;
        match self.peers.get_mut(&remote_id) {
            Some(peer) => {
                peer.timers.disarm(&mut self.timers);
                peer.connection = connection;
            }
            None => {
                let timers = PeerTimers::register(&mut self.timers, remote_id, &self.config, now);
                self.peers.insert(remote_id, Peer { connection, timers });
            }
        }
        info!(remote_id, ?endpoints, "connecting");
        let effects = match self.peers.get_mut(&remote_id) {
            Some(peer) => peer.connection.connect(now),
            None => Effects::new(),
        };
        self.apply(remote_id, effects, now);
        Ok(())
    }

    /// Next server-side connection that completed its handshake
    pub fn accept(&mut self) -> Option<u32> {
        while let Some(remote_id) = self.accepted.pop_front() {
            let up = self.peers.get(&remote_id).is_some_and(|p| p.connection.state().is_established());
            if up {
                return Some(remote_id);
            }
        }
        None
    }

    /// Queue an application message; it leaves on the next poll
    pub fn send(&mut self, remote_id: u32, message: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let peer = self.peers.get_mut(&remote_id).ok_or(RastaError::UnknownConnection(remote_id))?;
        peer.connection.push_message(message)
    }

    /// Next received application message from `remote_id`
    pub fn recv(&mut self, remote_id: u32) -> Result<Option<Vec<u8>>> {
        let peer = self.peers.get_mut(&remote_id).ok_or(RastaError::UnknownConnection(remote_id))?;
        Ok(peer.connection.pop_message())
    }

    /// Close the connection to `remote_id` with a user request
    pub fn disconnect(&mut self, remote_id: u32) -> Result<()> {
        self.disconnect_with(remote_id, DisconnectReason::UserRequest, 0)
    }

    pub fn disconnect_with(&mut self, remote_id: u32, reason: DisconnectReason, details: u16) -> Result<()> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let peer = self.peers.get_mut(&remote_id).ok_or(RastaError::UnknownConnection(remote_id))?;
        let effects = peer.connection.disconnect(reason, details, now);
        self.apply(remote_id, effects, now);
        Ok(())
    }

    /// Disconnect every peer, drop all timers and close the sockets
    pub fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        let now = self.clock.now_ms();
        let ids: Vec<u32> = self.peers.keys().copied().collect();
        for remote_id in ids {
            if let Some(peer) = self.peers.get_mut(&remote_id) {
                let effects = peer.connection.disconnect(DisconnectReason::UserRequest, 0, now);
                self.apply(remote_id, effects, now);
            }
        }
        for peer in self.peers.values() {
            peer.timers.remove(&mut self.timers);
        }
        self.peers.clear();
        self.accepted.clear();
        self.mux.close();
        self.closed = true;
        info!(local_id = self.config.local_id, "engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Snapshot of the connection to `remote_id`
    pub fn connection(&self, remote_id: u32) -> Option<ConnectionInfo> {
        self.peers.get(&remote_id).map(|p| p.connection.info())
    }

    pub fn connection_ids(&self) -> Vec<u32> {
        self.peers.keys().copied().collect()
    }

    /// Process one datagram read from local socket `socket_index`
    pub fn handle_datagram(&mut self, socket_index: usize, from: SocketAddr, datagram: &[u8]) {
        if self.closed {
            return;
        }
        let now = self.clock.now_ms();
        let frames = match split_datagram(datagram) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(%from, error = %e, "discarding malformed datagram");
                return;
            }
        };
        for frame in frames {
            let Some(envelope) = self.mux.decode_envelope(frame) else {
                continue;
            };
            let sender_id = envelope.sender_id;
            if self.mux.update_redundancy_channels(sender_id, socket_index, from) {
                self.notifier.emit(Notification::NewConnection { remote_id: sender_id, address: from });
            }
            if self.mux.needs_drain(sender_id) {
                self.process_ready(now);
            }
            let outcome = self.mux.deliver(envelope, from, now);
            if outcome.lost > 0 {
                debug!(remote_id = sender_id, lost = outcome.lost, "redundancy packets declared lost");
            }
            for diagnostics in outcome.diagnostics {
                self.notifier.emit(Notification::DiagnosticsAvailable { remote_id: sender_id, diagnostics });
            }
        }
        self.process_ready(now);
    }

    /// Fire due timers, release stale deferred packets and flush send queues
    ///
    /// Returns the next timer deadline.
    pub fn poll(&mut self) -> Option<u64> {
        if self.closed {
            return None;
        }
        let now = self.clock.now_ms();
        for (id, kind) in self.timers.pop_expired(now) {
            // an earlier timer in this batch may have closed the connection
            if self.timers.is_enabled(id) {
                self.fire(id, kind, now);
            }
        }
        if self.mux.flush_expired(now) > 0 {
            self.process_ready(now);
        }
        let ids: Vec<u32> = self.peers.keys().copied().collect();
        for remote_id in ids {
            if let Some(peer) = self.peers.get_mut(&remote_id) {
                let effects = peer.connection.send_tick(now);
                self.apply(remote_id, effects, now);
            }
        }
        self.timers.next_deadline()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    fn fire(&mut self, id: TimerId, kind: TimerKind, now: u64) {
        let remote_id = match kind {
            TimerKind::HeartbeatSend(r) | TimerKind::HeartbeatTimeout(r) | TimerKind::Rekey(r) | TimerKind::Handshake(r) => r,
        };
        let Some(peer) = self.peers.get_mut(&remote_id) else {
            self.timers.remove(id);
            return;
        };
        let effects = match kind {
            TimerKind::HeartbeatSend(_) => peer.connection.heartbeat_tick(now),
            TimerKind::HeartbeatTimeout(_) => peer.connection.heartbeat_timeout(now),
            TimerKind::Rekey(_) => peer.connection.rekey_tick(now),
            TimerKind::Handshake(_) => {
                self.timers.disable(id);
                peer.connection.handshake_timeout(now)
            }
        };
        self.apply(remote_id, effects, now);
    }

    fn process_ready(&mut self, now: u64) {
        while let Some(decoded) = self.mux.try_retrieve_all() {
            self.process_packet(decoded, now);
        }
    }

    fn process_packet(&mut self, decoded: DecodedPacket, now: u64) {
        let remote_id = decoded.packet.sender_id;
        let packet_type = decoded.packet.packet_type;
        debug!(remote_id, %packet_type, sn = decoded.packet.sequence_number, "received packet");

        if packet_type == PacketType::ConnReq {
            let is_new = !self.peers.contains_key(&remote_id);
            if is_new {
                let connection = match Connection::server(Arc::clone(&self.config), remote_id, 0) {
                    Ok(connection) => connection,
                    Err(e) => {
                        error!(remote_id, error = %e, "could not create connection");
                        return;
                    }
                };
                let timers = PeerTimers::register(&mut self.timers, remote_id, &self.config, now);
                self.peers.insert(remote_id, Peer { connection, timers });
                info!(remote_id, "new incoming connection");
            }
            let initial_sn = self.initial_sequence_number();
            let effects = match self.peers.get_mut(&remote_id) {
                Some(peer) => peer.connection.handle_connection_request(&decoded, initial_sn, now),
                None => return,
            };
            self.apply(remote_id, effects, now);

            let rejected = self.peers.get(&remote_id).is_some_and(|p| p.connection.state() == ConnectionState::Closed);
            if is_new && rejected {
                if let Some(peer) = self.peers.remove(&remote_id) {
                    peer.timers.remove(&mut self.timers);
                }
                self.mux.remove_channel(remote_id);
                debug!(remote_id, "rejected connection request, peer dropped");
            }
            return;
        }

        let Some(peer) = self.peers.get_mut(&remote_id) else {
            warn!(remote_id, %packet_type, "packet from unknown connection, discarding");
            self.mux.remove_channel(remote_id);
            return;
        };
        let effects = if packet_type == PacketType::ConnResp {
            peer.connection.handle_connection_response(&decoded, now)
        } else {
            peer.connection.handle_packet(&decoded, now)
        };
        self.apply(remote_id, effects, now);
    }

    /// Carry out connection effects in order
    fn apply(&mut self, remote_id: u32, effects: Effects, now: u64) {
        let Some(timers) = self.peers.get(&remote_id).map(|p| p.timers) else {
            return;
        };
        for effect in effects {
            match effect {
                Effect::Send(packet) => {
                    self.mux.send(&packet);
                }
                Effect::Notify(notification) => {
                    if let Notification::HandshakeComplete { .. } = notification {
                        self.timers.disable(timers.handshake);
                        let server = self.peers.get(&remote_id).is_some_and(|p| p.connection.role() == Role::Server);
                        if server {
                            self.accepted.push_back(remote_id);
                        }
                    }
                    self.notifier.emit(notification);
                }
                Effect::ArmTimers { t_i } => {
                    self.timers.enable(timers.heartbeat, now);
                    self.timers.set_interval(timers.timeout, t_i as u64, now);
                    self.timers.enable(timers.timeout, now);
                }
                Effect::RescheduleTimeout { t_i } => self.timers.set_interval(timers.timeout, t_i as u64, now),
                Effect::RescheduleHeartbeat => self.timers.reschedule(timers.heartbeat, now),
                Effect::DisarmTimers => timers.disarm(&mut self.timers),
                Effect::ArmHandshakeTimer => {
                    if self.config.sending.handshake_timeout_ms > 0 {
                        self.timers.enable(timers.handshake, now);
                    }
                }
                Effect::ArmRekeyTimer => {
                    if self.config.kex.rekeying_interval_ms > 0 {
                        self.timers.enable(timers.rekey, now);
                    }
                }
                Effect::RemoveChannel => {
                    self.mux.remove_channel(remote_id);
                }
                Effect::InstallSessionKey(key) => {
                    if let Err(e) = self.mux.install_session_key(remote_id, &key) {
                        error!(remote_id, error = %e, "could not install session key");
                    }
                }
            }
        }
    }

    // --- notifications ---------------------------------------------------

    fn register<F>(&mut self, kind: NotificationKind, handler: F)
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        self.notifier.register(kind, Box::new(handler));
    }

    pub fn on_connection_state_change<F: FnMut(&Notification) + Send + 'static>(&mut self, handler: F) {
        self.register(NotificationKind::ConnectionStateChanged, handler);
    }

    pub fn on_handshake_complete<F: FnMut(&Notification) + Send + 'static>(&mut self, handler: F) {
        self.register(NotificationKind::HandshakeComplete, handler);
    }

    pub fn on_receive<F: FnMut(&Notification) + Send + 'static>(&mut self, handler: F) {
        self.register(NotificationKind::DataReceived, handler);
    }

    pub fn on_heartbeat_timeout<F: FnMut(&Notification) + Send + 'static>(&mut self, handler: F) {
        self.register(NotificationKind::HeartbeatTimeout, handler);
    }

    pub fn on_diagnostics_available<F: FnMut(&Notification) + Send + 'static>(&mut self, handler: F) {
        self.register(NotificationKind::DiagnosticsAvailable, handler);
    }

    pub fn on_connection_diagnostics<F: FnMut(&Notification) + Send + 'static>(&mut self, handler: F) {
        self.register(NotificationKind::ConnectionDiagnostics, handler);
    }

    pub fn on_new_connection<F: FnMut(&Notification) + Send + 'static>(&mut self, handler: F) {
        self.register(NotificationKind::NewConnection, handler);
    }

    pub fn on_disconnect_request<F: FnMut(&Notification) + Send + 'static>(&mut self, handler: F) {
        self.register(NotificationKind::DisconnectRequested, handler);
    }

    pub fn poll_notification(&mut self) -> Option<Notification> {
        self.notifier.poll()
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.notifier.drain()
    }
}

impl<S, C> std::fmt::Debug for Engine<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("local_id", &self.config.local_id)
            .field("peers", &self.peers.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RastaConfigBuilder;
    use std::io;
    use std::sync::{Arc, Mutex};

    type Outbox = Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>;

    struct MemorySocket {
        addr: SocketAddr,
        outbox: Outbox,
    }

    impl DatagramSocket for MemorySocket {
        fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.outbox.lock().unwrap().push((target, buf.to_vec()));
            Ok(buf.len())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.addr)
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn engine(id: u32, port: u16, clock: &ManualClock) -> (Engine<MemorySocket, ManualClock>, Outbox) {
        let outbox = Outbox::default();
        let config = RastaConfigBuilder::new(id).with_initial_sequence_number(0).build().unwrap();
        let socket = MemorySocket { addr: addr(port), outbox: outbox.clone() };
        (Engine::init(config, clock.clone(), vec![socket]).unwrap(), outbox)
    }

    /// Hand everything in `outbox` to `to`, as received from `from`
    fn pump(outbox: &Outbox, to: &mut Engine<MemorySocket, ManualClock>, from: SocketAddr) -> usize {
        let datagrams: Vec<_> = outbox.lock().unwrap().drain(..).collect();
        for (_, datagram) in &datagrams {
            to.handle_datagram(0, from, datagram);
        }
        datagrams.len()
    }

    #[test]
    fn test_init_requires_socket() {
        let config = RastaConfigBuilder::new(1).build().unwrap();
        let result = Engine::<MemorySocket, _>::init(config, ManualClock::new(0), Vec::new());
        assert!(matches!(result, Err(RastaError::InvalidConfig(_))));
    }

    #[test]
    fn test_handshake_and_accept() {
        let clock = ManualClock::new(1000);
        let (mut client, client_out) = engine(0x61, 1, &clock);
        let (mut server, server_out) = engine(0x60, 2, &clock);

        client.connect(0x60, &[addr(2)]).unwrap();
        assert_eq!(pump(&client_out, &mut server, addr(1)), 1);
        assert_eq!(pump(&server_out, &mut client, addr(2)), 1);
        assert_eq!(client.connection(0x60).unwrap().state, ConnectionState::Up);
        assert_eq!(server.accept(), None);

        assert_eq!(pump(&client_out, &mut server, addr(1)), 1);
        assert_eq!(server.connection(0x61).unwrap().state, ConnectionState::Up);
        assert_eq!(server.accept(), Some(0x61));
        assert!(server
            .drain_notifications()
            .iter()
            .any(|n| matches!(n, Notification::NewConnection { remote_id: 0x61, .. })));
    }

    #[test]
    fn test_connect_twice_rejected() {
        let clock = ManualClock::new(0);
        let (mut client, _) = engine(0x61, 1, &clock);
        client.connect(0x60, &[addr(2)]).unwrap();
        assert!(matches!(client.connect(0x60, &[addr(2)]), Err(RastaError::ConnectionExists(0x60))));
        assert!(matches!(client.connect(0x70, &[addr(2), addr(3)]), Err(RastaError::EndpointMismatch { .. })));
    }

    #[test]
    fn test_handshake_timeout_closes() {
        let clock = ManualClock::new(0);
        let (mut client, _) = engine(0x61, 1, &clock);
        client.connect(0x60, &[addr(2)]).unwrap();

        clock.advance(1999);
        client.poll();
        assert_eq!(client.connection(0x60).unwrap().state, ConnectionState::Start);

        clock.advance(1);
        client.poll();
        assert_eq!(client.connection(0x60).unwrap().state, ConnectionState::Closed);
    }

    #[test]
    fn test_operations_after_cleanup() {
        let clock = ManualClock::new(0);
        let (mut client, _) = engine(0x61, 1, &clock);
        client.cleanup();
        assert!(client.is_closed());
        assert!(matches!(client.connect(0x60, &[addr(2)]), Err(RastaError::Closed)));
        assert!(matches!(client.send(0x60, vec![1]), Err(RastaError::Closed)));
        assert_eq!(client.poll(), None);
    }
}
