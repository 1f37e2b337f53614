//! Async RaSTA node on tokio
//!
//! [`RastaNode`] binds one UDP socket per configured local endpoint and runs
//! the [`Engine`] behind a mutex. One reader task per socket forwards
//! datagrams into an mpsc channel; a single driver task feeds them to the
//! engine and polls it on every send tick. Callers waiting in `accept`,
//! `connect` or `recv` are woken after each driver step.
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::SystemClock;
use crate::config::RastaConfig;
use crate::connection::ConnectionState;
use crate::engine::Engine;
use crate::errors::{RastaError, Result};
use crate::transport::UdpTransport;

/// Largest datagram a reader accepts
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Datagrams buffered between readers and the driver
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

const READ_BACKOFF_MIN: Duration = Duration::from_millis(10);
const READ_BACKOFF_MAX: Duration = Duration::from_secs(1);

pub type UdpEngine = Engine<UdpTransport, SystemClock>;

#[derive(Debug)]
struct Inbound {
    socket_index: usize,
    from: SocketAddr,
    data: Vec<u8>,
}

pub struct RastaNode {
    engine: Arc<Mutex<UdpEngine>>,
    events: Arc<Notify>,
    receivers: Vec<Arc<UdpSocket>>,
    local_addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    tick: Duration,
}

impl RastaNode {
    /// Bind every local endpoint of the configuration
    pub async fn bind(config: RastaConfig) -> Result<Self> {
        config.validate()?;
        if config.redundancy.local_endpoints.is_empty() {
            return Err(RastaError::InvalidConfig("no local endpoints configured".to_string()));
        }
        let mut transports = Vec::with_capacity(config.redundancy.local_endpoints.len());
        let mut local_addrs = Vec::with_capacity(transports.capacity());
        for endpoint in &config.redundancy.local_endpoints {
            let transport = UdpTransport::bind(*endpoint).await?;
            local_addrs.push(transport.receiver().local_addr()?);
            transports.push(transport);
        }
        info!(local_id = config.local_id, ?local_addrs, "bound local endpoints");

        let receivers = transports.iter().map(UdpTransport::receiver).collect();
        let tick = Duration::from_millis(config.sending.send_tick_ms.max(1));
        let engine = Engine::init(config, SystemClock::new(), transports)?;
        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            events: Arc::new(Notify::new()),
            receivers,
            local_addrs,
            tasks: Vec::new(),
            tick,
        })
    }

    /// Actual addresses of the local sockets
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Start reading from the sockets and driving the engine
    ///
    /// Calling it again is a no-op.
    pub fn listen(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        for (socket_index, socket) in self.receivers.iter().enumerate() {
            self.tasks.push(tokio::spawn(read_socket(socket_index, Arc::clone(socket), tx.clone())));
        }
        self.tasks.push(tokio::spawn(drive(Arc::clone(&self.engine), Arc::clone(&self.events), rx, self.tick)));
        debug!(sockets = self.receivers.len(), "listening");
    }

    /// Run `f` with exclusive access to the engine
    ///
    /// Used to register notification handlers and to inspect connections.
    pub async fn with_engine<R>(&self, f: impl FnOnce(&mut UdpEngine) -> R) -> R {
        let mut engine = self.engine.lock().await;
        f(&mut engine)
    }

    /// Wait until the driver has made progress or a tick passed
    async fn wait_for_event(&self) {
        let _ = tokio::time::timeout(self.tick, self.events.notified()).await;
    }

    /// Connect and wait for the handshake to finish
    pub async fn connect(&mut self, remote_id: u32, endpoints: &[SocketAddr]) -> Result<()> {
        self.listen();
        self.engine.lock().await.connect(remote_id, endpoints)?;
        loop {
            let state = {
                let engine = self.engine.lock().await;
                engine.connection(remote_id).map(|info| info.state)
            };
            match state {
                Some(ConnectionState::Up) => return Ok(()),
                Some(ConnectionState::Closed) | None => {
                    return Err(RastaError::NotConnected { remote_id, state: ConnectionState::Closed })
                }
                Some(_) => self.wait_for_event().await,
            }
        }
    }

    /// Wait for the next incoming connection to come up
    pub async fn accept(&mut self) -> Result<u32> {
        self.listen();
        loop {
            {
                let mut engine = self.engine.lock().await;
                if engine.is_closed() {
                    return Err(RastaError::Closed);
                }
                if let Some(remote_id) = engine.accept() {
                    return Ok(remote_id);
                }
            }
            self.wait_for_event().await;
        }
    }

    pub async fn send(&self, remote_id: u32, message: &[u8]) -> Result<()> {
        self.engine.lock().await.send(remote_id, message.to_vec())
    }

    /// Wait for the next message from `remote_id`
    ///
    /// Fails once the connection is closed and nothing is left to read.
    pub async fn recv(&self, remote_id: u32) -> Result<Vec<u8>> {
        loop {
            {
                let mut engine = self.engine.lock().await;
                if let Some(message) = engine.recv(remote_id)? {
                    return Ok(message);
                }
                if let Some(info) = engine.connection(remote_id) {
                    if matches!(info.state, ConnectionState::Closed | ConnectionState::Down) {
                        return Err(RastaError::NotConnected { remote_id, state: info.state });
                    }
                }
            }
            self.wait_for_event().await;
        }
    }

    pub async fn disconnect(&self, remote_id: u32) -> Result<()> {
        self.engine.lock().await.disconnect(remote_id)
    }

    /// Disconnect all peers and stop the background tasks
    pub async fn cleanup(&mut self) {
        self.engine.lock().await.cleanup();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.events.notify_waiters();
    }
}

impl Drop for RastaNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RastaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RastaNode")
            .field("local_addrs", &self.local_addrs)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// Errors a UDP socket reports for a single datagram or peer
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Exponential pause between failing reads
#[derive(Debug)]
struct ReadBackoff {
    current: Duration,
}

impl ReadBackoff {
    fn new() -> Self {
        Self { current: READ_BACKOFF_MIN }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(READ_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.current = READ_BACKOFF_MIN;
    }
}

async fn read_socket(socket_index: usize, socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut backoff = ReadBackoff::new();
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                backoff.reset();
                let inbound = Inbound { socket_index, from, data: buf[..len].to_vec() };
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
            Err(e) if is_transient(&e) => {
                let delay = backoff.next_delay();
                warn!(socket_index, error = %e, ?delay, "receive failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(socket_index, error = %e, "receive failed, stopping reader");
                break;
            }
        }
    }
}

async fn drive(engine: Arc<Mutex<UdpEngine>>, events: Arc<Notify>, mut rx: mpsc::Receiver<Inbound>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            inbound = rx.recv() => {
                let Some(inbound) = inbound else {
                    break;
                };
                engine.lock().await.handle_datagram(inbound.socket_index, inbound.from, &inbound.data);
            }
            _ = interval.tick() => {
                let mut engine = engine.lock().await;
                if engine.is_closed() {
                    break;
                }
                engine.poll();
            }
        }
        events.notify_waiters();
    }
    debug!("driver stopped");
}
