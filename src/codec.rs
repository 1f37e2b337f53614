//! Wire codec for safety and redundancy packets
//!
//! All integers are little-endian and fixed width.
//!
//! Safety packet:
//! `[2B length][2B type][4B receiver][4B sender][4B sn][4B cs][4B ts][4B cts][payload][safety code]`
//!
//! Redundancy packet:
//! `[2B length][2B reserved][4B seq_tx][safety packet][check code]`
//!
//! Both length fields count the whole packet including the trailing code.
use crate::checksum::Checksum;
use crate::errors::{DecodeError, RastaError};
use crate::packet::{
    ConnectionData, DecodedPacket, DecodedRedundancyPacket, DisconnectReason, DisconnectionData, Packet,
    PacketType, Payload, RedundancyPacket,
};

/// Fixed safety packet header length
pub const SAFETY_HEADER_LEN: usize = 28;

/// Fixed redundancy packet header length
pub const REDUNDANCY_HEADER_LEN: usize = 8;

/// Largest packet a 16-bit length field can describe
pub const MAX_PACKET_LEN: usize = u16::MAX as usize;

/// Handshake payload: version, N_SENDMAX, reserved
const CONNECTION_PAYLOAD_LEN: usize = 4 + 2 + 8;

const DISCONNECTION_PAYLOAD_LEN: usize = 4;

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn encode_payload(payload: &Payload, out: &mut Vec<u8>) {
    match payload {
        Payload::None => {}
        Payload::Connection(data) => {
            out.extend_from_slice(&data.version);
            out.extend_from_slice(&data.send_max.to_le_bytes());
            out.extend_from_slice(&[0u8; 8]);
        }
        Payload::Messages(messages) => {
            for message in messages {
                out.extend_from_slice(&(message.len() as u16).to_le_bytes());
                out.extend_from_slice(message);
            }
        }
        Payload::Disconnection(data) => {
            out.extend_from_slice(&data.details.to_le_bytes());
            out.extend_from_slice(&data.reason.code().to_le_bytes());
        }
        Payload::Kex(body) | Payload::Raw(body) => out.extend_from_slice(body),
    }
}

/// Encoded size of a safety packet
pub fn encoded_len(packet: &Packet, code: &dyn Checksum) -> usize {
    let payload = match &packet.payload {
        Payload::None => 0,
        Payload::Connection(_) => CONNECTION_PAYLOAD_LEN,
        Payload::Messages(messages) => messages.iter().map(|m| 2 + m.len()).sum(),
        Payload::Disconnection(_) => DISCONNECTION_PAYLOAD_LEN,
        Payload::Kex(body) | Payload::Raw(body) => body.len(),
    };
    SAFETY_HEADER_LEN + payload + code.code_len()
}

/// Serialize a safety packet and append its safety code
pub fn encode_packet(packet: &Packet, code: &dyn Checksum) -> crate::errors::Result<Vec<u8>> {
    let total = encoded_len(packet, code);
    if total > MAX_PACKET_LEN {
        return Err(RastaError::PacketTooLarge { size: total, max: MAX_PACKET_LEN });
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_le_bytes());
    out.extend_from_slice(&packet.packet_type.code().to_le_bytes());
    out.extend_from_slice(&packet.receiver_id.to_le_bytes());
    out.extend_from_slice(&packet.sender_id.to_le_bytes());
    out.extend_from_slice(&packet.sequence_number.to_le_bytes());
    out.extend_from_slice(&packet.confirmed_sequence_number.to_le_bytes());
    out.extend_from_slice(&packet.timestamp.to_le_bytes());
    out.extend_from_slice(&packet.confirmed_timestamp.to_le_bytes());
    encode_payload(&packet.payload, &mut out);
    let digest = code.digest(&out);
    out.extend_from_slice(&digest);
    Ok(out)
}

fn decode_messages(body: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError> {
    let mut messages = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        if body.len() - offset < 2 {
            return Err(DecodeError::InvalidPayload { packet_type: "Data", reason: "dangling length prefix" });
        }
        let len = read_u16(body, offset) as usize;
        offset += 2;
        if body.len() - offset < len {
            return Err(DecodeError::InvalidPayload { packet_type: "Data", reason: "message exceeds packet" });
        }
        messages.push(body[offset..offset + len].to_vec());
        offset += len;
    }
    if messages.is_empty() {
        return Err(DecodeError::InvalidPayload { packet_type: "Data", reason: "no application message" });
    }
    Ok(messages)
}

fn decode_payload(packet_type: PacketType, body: &[u8]) -> Result<Payload, DecodeError> {
    match packet_type {
        PacketType::ConnReq | PacketType::ConnResp => {
            if body.len() != CONNECTION_PAYLOAD_LEN {
                return Err(DecodeError::InvalidPayload {
                    packet_type: packet_type.name(),
                    reason: "handshake payload has wrong size",
                });
            }
            let version = [body[0], body[1], body[2], body[3]];
            Ok(Payload::Connection(ConnectionData { version, send_max: read_u16(body, 4) }))
        }
        PacketType::Data | PacketType::RetrData => decode_messages(body).map(Payload::Messages),
        PacketType::DiscReq => {
            if body.len() != DISCONNECTION_PAYLOAD_LEN {
                return Err(DecodeError::InvalidPayload {
                    packet_type: "DiscReq",
                    reason: "disconnection payload has wrong size",
                });
            }
            Ok(Payload::Disconnection(DisconnectionData {
                details: read_u16(body, 0),
                reason: DisconnectReason::from_code(read_u16(body, 2)),
            }))
        }
        PacketType::Heartbeat | PacketType::RetrReq | PacketType::RetrResp => {
            if body.is_empty() {
                Ok(Payload::None)
            } else {
                Err(DecodeError::InvalidPayload { packet_type: packet_type.name(), reason: "unexpected payload" })
            }
        }
        PacketType::KexRequest | PacketType::KexResponse | PacketType::KexAuth => Ok(Payload::Kex(body.to_vec())),
        PacketType::Unknown(_) => Ok(Payload::Raw(body.to_vec())),
    }
}

/// Parse a safety packet and verify its safety code
///
/// Only a buffer too short for the header is a hard error. A length field or
/// check code that disagrees with the buffer still returns the parsed packet
/// with `checksum_correct = false`, so the receiver can attribute the error to
/// a connection. A malformed payload is an error only when the check code
/// vouches for it; otherwise the body is kept as [`Payload::Raw`].
pub fn decode_packet(bytes: &[u8], code: &dyn Checksum) -> Result<DecodedPacket, DecodeError> {
    let min_len = SAFETY_HEADER_LEN + code.code_len();
    if bytes.len() < min_len {
        return Err(DecodeError::Truncated { required: min_len, available: bytes.len() });
    }
    let declared = read_u16(bytes, 0) as usize;
    let length_intact = declared == bytes.len();
    let frame = if length_intact { bytes } else { &bytes[..declared.clamp(min_len, bytes.len())] };

    let split = frame.len() - code.code_len();
    let (content, digest) = frame.split_at(split);
    let checksum_correct = length_intact && code.verify(content, digest);

    let packet_type = PacketType::from_code(read_u16(content, 2));
    let body = &content[SAFETY_HEADER_LEN..];
    let payload = match decode_payload(packet_type, body) {
        Ok(payload) => payload,
        Err(err) if checksum_correct => return Err(err),
        Err(_) => Payload::Raw(body.to_vec()),
    };

    Ok(DecodedPacket {
        packet: Packet {
            packet_type,
            receiver_id: read_u32(content, 4),
            sender_id: read_u32(content, 8),
            sequence_number: read_u32(content, 12),
            confirmed_sequence_number: read_u32(content, 16),
            timestamp: read_u32(content, 20),
            confirmed_timestamp: read_u32(content, 24),
            payload,
        },
        checksum_correct,
    })
}

/// Peek at the sender id of an encoded safety packet
pub fn peek_sender_id(bytes: &[u8]) -> Option<u32> {
    (bytes.len() >= SAFETY_HEADER_LEN).then(|| read_u32(bytes, 8))
}

/// Serialize a redundancy envelope and append its check code
pub fn encode_redundancy_packet(packet: &RedundancyPacket, code: &dyn Checksum) -> crate::errors::Result<Vec<u8>> {
    let total = REDUNDANCY_HEADER_LEN + packet.inner.len() + code.code_len();
    if total > MAX_PACKET_LEN {
        return Err(RastaError::PacketTooLarge { size: total, max: MAX_PACKET_LEN });
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&packet.sequence_number.to_le_bytes());
    out.extend_from_slice(&packet.inner);
    let digest = code.digest(&out);
    out.extend_from_slice(&digest);
    Ok(out)
}

/// Parse a redundancy envelope and verify its check code
pub fn decode_redundancy_packet(bytes: &[u8], code: &dyn Checksum) -> Result<DecodedRedundancyPacket, DecodeError> {
    let min_len = REDUNDANCY_HEADER_LEN + code.code_len();
    if bytes.len() < min_len {
        return Err(DecodeError::Truncated { required: min_len, available: bytes.len() });
    }
    let declared = read_u16(bytes, 0) as usize;
    let length_intact = declared == bytes.len();
    let frame = if length_intact { bytes } else { &bytes[..declared.clamp(min_len, bytes.len())] };

    let split = frame.len() - code.code_len();
    let (content, digest) = frame.split_at(split);
    Ok(DecodedRedundancyPacket {
        packet: RedundancyPacket {
            sequence_number: read_u32(content, 4),
            inner: content[REDUNDANCY_HEADER_LEN..].to_vec(),
        },
        checksum_correct: length_intact && code.verify(content, digest),
    })
}

/// Split a datagram into the redundancy packets it carries
///
/// Several envelopes may be concatenated in one datagram; each is delimited by
/// its own length field.
pub fn split_datagram(datagram: &[u8]) -> Result<Vec<&[u8]>, DecodeError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < datagram.len() {
        let remaining = datagram.len() - offset;
        if remaining < REDUNDANCY_HEADER_LEN {
            return Err(DecodeError::Truncated { required: REDUNDANCY_HEADER_LEN, available: remaining });
        }
        let len = read_u16(datagram, offset) as usize;
        if len < REDUNDANCY_HEADER_LEN || len > remaining {
            return Err(DecodeError::LengthMismatch { declared: len, available: remaining });
        }
        frames.push(&datagram[offset..offset + len]);
        offset += len;
    }
    Ok(frames)
}
