//! Redundancy multiplexer
//!
//! Owns the local sockets and one [`RedundancyChannel`] per known peer.
//! Outbound safety packets are routed by receiver id and fanned out over all
//! paths of the channel. Inbound datagrams are split into envelopes, checked,
//! attributed to a channel by the inner sender id (creating the channel on
//! first contact) and reordered there. In-order safety packets are then
//! fetched with [`RedundancyMultiplexer::try_retrieve_all`].
use std::net::SocketAddr;

use tracing::{debug, error, info, warn};

use crate::checksum::SafetyCode;
use crate::codec::{decode_packet, decode_redundancy_packet, encode_packet, encode_redundancy_packet, peek_sender_id};
use crate::config::RastaConfig;
use crate::errors::{RastaError, Result};
use crate::packet::{DecodedPacket, Packet, RedundancyPacket};
use crate::redundancy::{ReceiveOutcome, RedundancyChannel};
use crate::transport::DatagramSocket;

/// Envelope that passed the redundancy check code
#[derive(Debug)]
pub struct Envelope {
    pub sender_id: u32,
    pub packet: RedundancyPacket,
}

pub struct RedundancyMultiplexer<S> {
    local_id: u32,
    sockets: Vec<S>,
    channels: Vec<RedundancyChannel>,
    config: RastaConfig,
    /// Channel to look at first in `try_retrieve_all`
    next_retrieve: usize,
}

impl<S: DatagramSocket> RedundancyMultiplexer<S> {
    pub fn new(config: &RastaConfig, sockets: Vec<S>) -> Self {
        Self { local_id: config.local_id, sockets, channels: Vec::new(), config: config.clone(), next_retrieve: 0 }
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter().filter_map(|s| s.local_addr().ok()).collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn get_channel(&self, remote_id: u32) -> Option<&RedundancyChannel> {
        self.channels.iter().find(|c| c.associated_id() == remote_id)
    }

    pub fn get_channel_mut(&mut self, remote_id: u32) -> Option<&mut RedundancyChannel> {
        self.channels.iter_mut().find(|c| c.associated_id() == remote_id)
    }

    fn new_channel(&self, remote_id: u32) -> Result<RedundancyChannel> {
        let code = SafetyCode::new(self.config.safety_code, &self.config.safety_key)?;
        Ok(RedundancyChannel::new(remote_id, self.sockets.len(), &self.config.redundancy, code))
    }

    /// Create the channel to `remote_id`, or restart an existing one
    ///
    /// `endpoints[i]` is reached through local socket `i`. A restarted
    /// channel is re-addressed and takes its receive baseline from the next
    /// inbound packet.
    pub fn add_channel(&mut self, remote_id: u32, endpoints: &[SocketAddr]) -> Result<()> {
        if endpoints.len() != self.sockets.len() {
            return Err(RastaError::EndpointMismatch { given: endpoints.len(), local: self.sockets.len() });
        }
        match self.get_channel_mut(remote_id) {
            Some(channel) => {
                channel.reset_receive();
                debug!(remote_id, "redundancy channel restarted");
            }
            None => {
                let channel = self.new_channel(remote_id)?;
                self.channels.push(channel);
            }
        }
        if let Some(channel) = self.get_channel_mut(remote_id) {
            channel.rebind(endpoints);
        }
        Ok(())
    }

    /// Close every path of a channel on its local socket
    fn close_paths(sockets: &[S], channel: &mut RedundancyChannel) {
        for path in channel.paths() {
            let Some(socket) = sockets.get(path.socket_index) else {
                continue;
            };
            if let Err(e) = socket.close_path(path.address) {
                warn!(remote_id = channel.associated_id(), address = %path.address, error = %e, "closing path failed");
            }
        }
        channel.close();
    }

    pub fn remove_channel(&mut self, remote_id: u32) -> bool {
        let Some(index) = self.channels.iter().position(|c| c.associated_id() == remote_id) else {
            return false;
        };
        let mut channel = self.channels.remove(index);
        Self::close_paths(&self.sockets, &mut channel);
        debug!(remote_id, "redundancy channel removed");
        true
    }

    /// Rotate the safety code key used towards `remote_id`
    pub fn install_session_key(&mut self, remote_id: u32, key: &[u8]) -> Result<()> {
        let channel = self.get_channel_mut(remote_id).ok_or(RastaError::UnknownConnection(remote_id))?;
        channel.safety_code_mut().rotate_key(key)
    }

    /// Send a safety packet over every path to its receiver
    ///
    /// Returns the number of paths the datagram was handed to. An unknown
    /// receiver is logged and ignored.
    pub fn send(&mut self, packet: &Packet) -> usize {
        let check_code = self.config.redundancy.check_code;
        let remote_id = packet.receiver_id;
        let Some(channel) = self.channels.iter_mut().find(|c| c.associated_id() == remote_id) else {
            warn!(remote_id, packet_type = %packet.packet_type, "no redundancy channel for receiver, dropping");
            return 0;
        };

        let inner = match encode_packet(packet, channel.safety_code()) {
            Ok(inner) => inner,
            Err(e) => {
                error!(remote_id, packet_type = %packet.packet_type, error = %e, "could not encode packet");
                return 0;
            }
        };
        let envelope = channel.wrap(inner);
        let datagram = match encode_redundancy_packet(&envelope, &check_code) {
            Ok(datagram) => datagram,
            Err(e) => {
                error!(remote_id, seq = envelope.sequence_number, error = %e, "could not encode redundancy packet");
                return 0;
            }
        };

        let mut delivered = 0;
        for path in channel.paths_mut() {
            let Some(socket) = self.sockets.get(path.socket_index) else {
                continue;
            };
            if !path.connected {
                match socket.redial(path.address) {
                    Ok(()) => {
                        info!(remote_id, address = %path.address, "transport path redialed");
                        path.connected = true;
                    }
                    Err(e) => {
                        debug!(remote_id, address = %path.address, error = %e, "redial failed");
                        continue;
                    }
                }
            }
            match socket.send_to(&datagram, path.address) {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(remote_id, address = %path.address, error = %e, "send failed, marking path disconnected");
                    path.connected = false;
                }
            }
        }
        delivered
    }

    /// Check one envelope from a datagram and find its sender
    pub fn decode_envelope(&self, frame: &[u8]) -> Option<Envelope> {
        let decoded = match decode_redundancy_packet(frame, &self.config.redundancy.check_code) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "malformed redundancy packet");
                return None;
            }
        };
        if !decoded.checksum_correct {
            warn!(seq = decoded.packet.sequence_number, "redundancy check code incorrect, discarding");
            return None;
        }
        let Some(sender_id) = peek_sender_id(&decoded.packet.inner) else {
            warn!(len = decoded.packet.inner.len(), "redundancy packet without safety header");
            return None;
        };
        Some(Envelope { sender_id, packet: decoded.packet })
    }

    /// Make sure a channel exists for `sender_id` with `from` bound as a path
    ///
    /// Returns true when the channel was created by this call.
    pub fn update_redundancy_channels(&mut self, sender_id: u32, socket_index: usize, from: SocketAddr) -> bool {
        if let Some(channel) = self.get_channel_mut(sender_id) {
            channel.bind_path(from, socket_index);
            return false;
        }
        match self.new_channel(sender_id) {
            Ok(mut channel) => {
                channel.bind_path(from, socket_index);
                self.channels.push(channel);
                info!(remote_id = sender_id, address = %from, "discovered new redundancy channel");
                true
            }
            Err(e) => {
                error!(remote_id = sender_id, error = %e, "could not create redundancy channel");
                false
            }
        }
    }

    /// Whether the channel towards `remote_id` must be drained first
    pub fn needs_drain(&self, remote_id: u32) -> bool {
        self.get_channel(remote_id).is_some_and(|c| c.needs_drain())
    }

    /// Feed an envelope into its channel
    pub fn deliver(&mut self, envelope: Envelope, from: SocketAddr, now_ms: u64) -> ReceiveOutcome {
        match self.get_channel_mut(envelope.sender_id) {
            Some(channel) => channel.receive(envelope.packet, from, now_ms),
            None => ReceiveOutcome::default(),
        }
    }

    /// Release deferred packets older than T_seq on every channel
    pub fn flush_expired(&mut self, now_ms: u64) -> usize {
        self.channels.iter_mut().map(|c| c.flush_expired(now_ms).released).sum()
    }

    /// Next in-order safety packet from any channel
    ///
    /// Channels are visited round robin. Packets that fail to decode are
    /// logged and skipped.
    pub fn try_retrieve_all(&mut self) -> Option<DecodedPacket> {
        let count = self.channels.len();
        for offset in 0..count {
            let index = (self.next_retrieve + offset) % count;
            let channel = &mut self.channels[index];
            while let Some(inner) = channel.pop_ready() {
                match decode_packet(&inner, channel.safety_code()) {
                    Ok(decoded) => {
                        self.next_retrieve = (index + 1) % count;
                        return Some(decoded);
                    }
                    Err(e) => warn!(remote_id = channel.associated_id(), error = %e, "undecodable safety packet"),
                }
            }
        }
        None
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Close all channels and sockets
    pub fn close(&mut self) {
        for mut channel in self.channels.drain(..) {
            Self::close_paths(&self.sockets, &mut channel);
        }
        for socket in &self.sockets {
            socket.close();
        }
    }
}

impl<S> std::fmt::Debug for RedundancyMultiplexer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedundancyMultiplexer")
            .field("local_id", &self.local_id)
            .field("sockets", &self.sockets.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}
