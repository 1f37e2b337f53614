//! Typed notifications raised by the protocol engine
//!
//! The engine never calls back into user code while it holds connection
//! state borrowed. Instead every event becomes a [`Notification`]: registered
//! handlers for its kind run once the triggering packet or timer has been
//! fully processed, and the notification is then queued for polling.
use std::collections::VecDeque;
use std::net::SocketAddr;

use tracing::warn;

use crate::connection::ConnectionState;
use crate::diagnostics::{ConnectionDiagnostics, TransportDiagnostics};
use crate::packet::DisconnectReason;

/// Event raised by a connection or the redundancy layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ConnectionStateChanged {
        remote_id: u32,
        old: ConnectionState,
        new: ConnectionState,
        /// Set when the change is a disconnection
        reason: Option<DisconnectReason>,
    },
    HandshakeComplete { remote_id: u32 },
    HeartbeatTimeout { remote_id: u32 },
    /// Application messages are waiting in the receive buffer
    DataReceived { remote_id: u32, messages: usize },
    DisconnectRequested { remote_id: u32, reason: DisconnectReason, details: u16 },
    DiagnosticsAvailable { remote_id: u32, diagnostics: TransportDiagnostics },
    NewConnection { remote_id: u32, address: SocketAddr },
    ConnectionDiagnostics { remote_id: u32, diagnostics: ConnectionDiagnostics },
}

/// Discriminant of a [`Notification`], used to register handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    ConnectionStateChanged,
    HandshakeComplete,
    HeartbeatTimeout,
    DataReceived,
    DisconnectRequested,
    DiagnosticsAvailable,
    NewConnection,
    ConnectionDiagnostics,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::ConnectionStateChanged { .. } => NotificationKind::ConnectionStateChanged,
            Self::HandshakeComplete { .. } => NotificationKind::HandshakeComplete,
            Self::HeartbeatTimeout { .. } => NotificationKind::HeartbeatTimeout,
            Self::DataReceived { .. } => NotificationKind::DataReceived,
            Self::DisconnectRequested { .. } => NotificationKind::DisconnectRequested,
            Self::DiagnosticsAvailable { .. } => NotificationKind::DiagnosticsAvailable,
            Self::NewConnection { .. } => NotificationKind::NewConnection,
            Self::ConnectionDiagnostics { .. } => NotificationKind::ConnectionDiagnostics,
        }
    }

    pub fn remote_id(&self) -> u32 {
        match self {
            Self::ConnectionStateChanged { remote_id, .. }
            | Self::HandshakeComplete { remote_id }
            | Self::HeartbeatTimeout { remote_id }
            | Self::DataReceived { remote_id, .. }
            | Self::DisconnectRequested { remote_id, .. }
            | Self::DiagnosticsAvailable { remote_id, .. }
            | Self::NewConnection { remote_id, .. }
            | Self::ConnectionDiagnostics { remote_id, .. } => *remote_id,
        }
    }
}

/// Notification handler
pub type Handler = Box<dyn FnMut(&Notification) + Send>;

/// Handler registry plus a bounded queue of undelivered notifications
pub struct Notifier {
    handlers: Vec<(NotificationKind, Handler)>,
    pending: VecDeque<Notification>,
    capacity: usize,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Self { handlers: Vec::new(), pending: VecDeque::new(), capacity }
    }

    pub fn register(&mut self, kind: NotificationKind, handler: Handler) {
        self.handlers.push((kind, handler));
    }

    /// Run matching handlers and queue the notification for polling
    pub fn emit(&mut self, notification: Notification) {
        let kind = notification.kind();
        for (_, handler) in self.handlers.iter_mut().filter(|(k, _)| *k == kind) {
            handler(&notification);
        }
        if self.pending.len() >= self.capacity {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(kind = ?dropped.kind(), remote_id = dropped.remote_id(), "notification queue full, dropping oldest");
            }
        }
        self.pending.push_back(notification);
    }

    pub fn poll(&mut self) -> Option<Notification> {
        self.pending.pop_front()
    }

    pub fn drain(&mut self) -> Vec<Notification> {
        self.pending.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("handlers", &self.handlers.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
