//! Safety and redundancy layer packet structures
//!
//! A [`Packet`] is the in-memory form of a safety layer PDU. It never stores
//! its check code: the code is computed when encoding and verified when
//! decoding, which yields a [`DecodedPacket`] carrying the verdict.
use std::fmt;

/// Safety layer packet types with their wire codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    ConnReq,
    ConnResp,
    RetrReq,
    RetrResp,
    DiscReq,
    Heartbeat,
    Data,
    RetrData,
    KexRequest,
    KexResponse,
    KexAuth,
    /// Type code not known to this implementation
    Unknown(u16),
}

impl PacketType {
    pub fn from_code(code: u16) -> Self {
        match code {
            6200 => Self::ConnReq,
            6201 => Self::ConnResp,
            6212 => Self::RetrReq,
            6213 => Self::RetrResp,
            6216 => Self::DiscReq,
            6220 => Self::Heartbeat,
            6240 => Self::Data,
            6241 => Self::RetrData,
            6250 => Self::KexRequest,
            6251 => Self::KexResponse,
            6252 => Self::KexAuth,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::ConnReq => 6200,
            Self::ConnResp => 6201,
            Self::RetrReq => 6212,
            Self::RetrResp => 6213,
            Self::DiscReq => 6216,
            Self::Heartbeat => 6220,
            Self::Data => 6240,
            Self::RetrData => 6241,
            Self::KexRequest => 6250,
            Self::KexResponse => 6251,
            Self::KexAuth => 6252,
            Self::Unknown(code) => code,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ConnReq => "ConnReq",
            Self::ConnResp => "ConnResp",
            Self::RetrReq => "RetrReq",
            Self::RetrResp => "RetrResp",
            Self::DiscReq => "DiscReq",
            Self::Heartbeat => "Heartbeat",
            Self::Data => "Data",
            Self::RetrData => "RetrData",
            Self::KexRequest => "KexRequest",
            Self::KexResponse => "KexResponse",
            Self::KexAuth => "KexAuth",
            Self::Unknown(_) => "Unknown",
        }
    }

    /// ConnReq and ConnResp precede sequence establishment
    pub fn is_connection_setup(self) -> bool {
        matches!(self, Self::ConnReq | Self::ConnResp)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "Unknown({})", code),
            other => f.write_str(other.name()),
        }
    }
}

/// Reason carried by a disconnection request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    UserRequest,
    NotInUse,
    UnexpectedType,
    SeqError,
    Timeout,
    ServiceNotAllowed,
    IncompatibleVersion,
    RetrFailed,
    ProtocolError,
    Unknown(u16),
}

impl DisconnectReason {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::UserRequest,
            1 => Self::NotInUse,
            2 => Self::UnexpectedType,
            3 => Self::SeqError,
            4 => Self::Timeout,
            5 => Self::ServiceNotAllowed,
            6 => Self::IncompatibleVersion,
            7 => Self::RetrFailed,
            8 => Self::ProtocolError,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::UserRequest => 0,
            Self::NotInUse => 1,
            Self::UnexpectedType => 2,
            Self::SeqError => 3,
            Self::Timeout => 4,
            Self::ServiceNotAllowed => 5,
            Self::IncompatibleVersion => 6,
            Self::RetrFailed => 7,
            Self::ProtocolError => 8,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Handshake payload of ConnReq and ConnResp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionData {
    pub version: [u8; 4],
    /// Receive buffer size of the sender (N_SENDMAX)
    pub send_max: u16,
}

/// Payload of a disconnection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionData {
    pub reason: DisconnectReason,
    pub details: u16,
}

/// Type-specific packet payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Heartbeat, RetrReq and RetrResp carry nothing
    None,
    Connection(ConnectionData),
    /// One or more application messages (Data, RetrData)
    Messages(Vec<Vec<u8>>),
    Disconnection(DisconnectionData),
    /// Key exchange material, interpreted by the kex module
    Kex(Vec<u8>),
    /// Bytes that could not be interpreted (unknown type or corrupt packet)
    Raw(Vec<u8>),
}

/// Sequence and timestamp fields shared by every safety packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceFields {
    pub sequence_number: u32,
    pub confirmed_sequence_number: u32,
    pub timestamp: u32,
    pub confirmed_timestamp: u32,
}

/// Safety layer packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub receiver_id: u32,
    pub sender_id: u32,
    pub sequence_number: u32,
    pub confirmed_sequence_number: u32,
    pub timestamp: u32,
    pub confirmed_timestamp: u32,
    pub payload: Payload,
}

impl Packet {
    pub fn new(
        packet_type: PacketType,
        receiver_id: u32,
        sender_id: u32,
        seq: SequenceFields,
        payload: Payload,
    ) -> Self {
        Self {
            packet_type,
            receiver_id,
            sender_id,
            sequence_number: seq.sequence_number,
            confirmed_sequence_number: seq.confirmed_sequence_number,
            timestamp: seq.timestamp,
            confirmed_timestamp: seq.confirmed_timestamp,
            payload,
        }
    }

    /// Connection request; confirmed fields are zero by definition
    pub fn connection_request(
        receiver_id: u32,
        sender_id: u32,
        sequence_number: u32,
        timestamp: u32,
        data: ConnectionData,
    ) -> Self {
        let seq = SequenceFields { sequence_number, timestamp, ..Default::default() };
        Self::new(PacketType::ConnReq, receiver_id, sender_id, seq, Payload::Connection(data))
    }

    pub fn connection_response(receiver_id: u32, sender_id: u32, seq: SequenceFields, data: ConnectionData) -> Self {
        Self::new(PacketType::ConnResp, receiver_id, sender_id, seq, Payload::Connection(data))
    }

    pub fn heartbeat(receiver_id: u32, sender_id: u32, seq: SequenceFields) -> Self {
        Self::new(PacketType::Heartbeat, receiver_id, sender_id, seq, Payload::None)
    }

    pub fn data(receiver_id: u32, sender_id: u32, seq: SequenceFields, messages: Vec<Vec<u8>>) -> Self {
        Self::new(PacketType::Data, receiver_id, sender_id, seq, Payload::Messages(messages))
    }

    pub fn retransmitted_data(receiver_id: u32, sender_id: u32, seq: SequenceFields, messages: Vec<Vec<u8>>) -> Self {
        Self::new(PacketType::RetrData, receiver_id, sender_id, seq, Payload::Messages(messages))
    }

    pub fn retransmission_request(receiver_id: u32, sender_id: u32, seq: SequenceFields) -> Self {
        Self::new(PacketType::RetrReq, receiver_id, sender_id, seq, Payload::None)
    }

    pub fn retransmission_response(receiver_id: u32, sender_id: u32, seq: SequenceFields) -> Self {
        Self::new(PacketType::RetrResp, receiver_id, sender_id, seq, Payload::None)
    }

    pub fn disconnection_request(
        receiver_id: u32,
        sender_id: u32,
        seq: SequenceFields,
        reason: DisconnectReason,
        details: u16,
    ) -> Self {
        let data = DisconnectionData { reason, details };
        Self::new(PacketType::DiscReq, receiver_id, sender_id, seq, Payload::Disconnection(data))
    }

    pub fn kex(packet_type: PacketType, receiver_id: u32, sender_id: u32, seq: SequenceFields, body: Vec<u8>) -> Self {
        Self::new(packet_type, receiver_id, sender_id, seq, Payload::Kex(body))
    }

    pub fn sequence_fields(&self) -> SequenceFields {
        SequenceFields {
            sequence_number: self.sequence_number,
            confirmed_sequence_number: self.confirmed_sequence_number,
            timestamp: self.timestamp,
            confirmed_timestamp: self.confirmed_timestamp,
        }
    }

    pub fn connection_data(&self) -> Option<ConnectionData> {
        match &self.payload {
            Payload::Connection(data) => Some(*data),
            _ => None,
        }
    }

    pub fn disconnection_data(&self) -> Option<DisconnectionData> {
        match &self.payload {
            Payload::Disconnection(data) => Some(*data),
            _ => None,
        }
    }

    pub fn messages(&self) -> &[Vec<u8>] {
        match &self.payload {
            Payload::Messages(messages) => messages,
            _ => &[],
        }
    }
}

/// Result of decoding a safety packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub packet: Packet,
    /// False when the check code or the length field did not match
    pub checksum_correct: bool,
}

/// Redundancy layer envelope around an encoded safety packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundancyPacket {
    /// Channel-wide transmit counter (seq_tx)
    pub sequence_number: u32,
    /// Encoded safety packet including its safety code
    pub inner: Vec<u8>,
}

/// Result of decoding a redundancy envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRedundancyPacket {
    pub packet: RedundancyPacket,
    pub checksum_correct: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_codes() {
        for ty in [
            PacketType::ConnReq,
            PacketType::ConnResp,
            PacketType::RetrReq,
            PacketType::RetrResp,
            PacketType::DiscReq,
            PacketType::Heartbeat,
            PacketType::Data,
            PacketType::RetrData,
            PacketType::KexRequest,
            PacketType::KexResponse,
            PacketType::KexAuth,
        ] {
            assert_eq!(PacketType::from_code(ty.code()), ty);
        }
        assert_eq!(PacketType::from_code(1), PacketType::Unknown(1));
    }

    #[test]
    fn test_disconnect_reason_codes() {
        assert_eq!(DisconnectReason::from_code(4), DisconnectReason::Timeout);
        assert_eq!(DisconnectReason::RetrFailed.code(), 7);
        assert_eq!(DisconnectReason::from_code(99), DisconnectReason::Unknown(99));
    }

    #[test]
    fn test_connection_request_has_zero_confirmations() {
        let data = ConnectionData { version: *b"0303", send_max: 20 };
        let packet = Packet::connection_request(2, 1, 100, 5000, data);
        assert_eq!(packet.confirmed_sequence_number, 0);
        assert_eq!(packet.confirmed_timestamp, 0);
        assert_eq!(packet.connection_data(), Some(data));
        assert!(packet.messages().is_empty());
    }
}
