//! RaSTA core - safety and retransmission protocol over redundant UDP paths
//!
//! Layers, leaf first:
//!
//! - [`codec`] and [`checksum`]: wire format of safety and redundancy packets
//! - [`queues`]: send and retransmission queues of one connection
//! - [`connection`]: the per-peer safety/retransmission state machine
//! - [`redundancy`] and [`mux`]: ordered, deduplicated delivery over N paths
//! - [`engine`]: timers, dispatch and notifications around the layers above
//! - [`node`]: tokio sockets and tasks driving an engine
//!
//! The library logs through `tracing` and installs no subscriber.

pub mod checksum;
pub mod clock;
pub mod codec;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod engine;
pub mod errors;
pub mod kex;
pub mod mux;
pub mod node;
pub mod notification;
pub mod packet;
pub mod queues;
pub mod redundancy;
pub mod timer;
pub mod transport;

pub use checksum::{Checksum, RedundancyCheckCode, SafetyCode, SafetyCodeType};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KexMode, RastaConfig, RastaConfigBuilder};
pub use connection::{ConnectionInfo, ConnectionState, Role};
pub use engine::Engine;
pub use errors::{DecodeError, RastaError, Result};
pub use node::RastaNode;
pub use notification::{Notification, NotificationKind};
pub use packet::{DisconnectReason, Packet, PacketType};
pub use transport::{DatagramSocket, UdpTransport};

/// Protocol version announced in connection requests and responses
pub const RASTA_VERSION: &[u8; 4] = b"0303";

/// Default maximum age of a confirmed timestamp (T_max) in milliseconds
pub const DEFAULT_T_MAX_MS: u32 = 750;

/// Default heartbeat interval (T_h) in milliseconds
pub const DEFAULT_T_H_MS: u32 = 300;

/// Largest application message carried in a Data packet
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Grace period before a server treats a rekey as missed
pub const REKEYING_ALLOWED_DELAY_MS: u64 = 500;
