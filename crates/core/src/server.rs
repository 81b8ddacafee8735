//! The server: listen socket, mount registry, RTP port allocator, and
//! session ID generator, bundled into one value handed to every
//! connection handler.

use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::mount::MountRegistry;
use crate::session::SessionIdGen;
use crate::transport::tcp;
use crate::transport::udp::UdpTransport;

/// Callback invoked when a mount goes live (RECORD) or is removed
/// (teardown/disconnect). Arguments: mount path, mounted flag.
pub type MountUpdateFn = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// A validated, bound RTP/RTCP socket pair from the allocator.
pub struct AllocatedPair {
    pub rtp_port: u16,
    pub rtp_socket: UdpSocket,
    pub rtcp_socket: UdpSocket,
}

impl AllocatedPair {
    /// RTCP always rides the odd port directly above RTP.
    pub fn rtcp_port(&self) -> u16 {
        self.rtp_port + 1
    }
}

/// Monotonic RTP port-pair allocator over a configured range.
///
/// Grants are validated by actually binding both sockets, so a port held
/// by a live listener can never be handed out twice; the cursor wraps to
/// the start of the range when it runs off the end.
#[derive(Clone)]
pub struct PortAllocator {
    bind_ip: IpAddr,
    start: u16,
    max: u16,
    cursor: Arc<Mutex<u16>>,
}

/// Bind attempts per allocation before the owning SETUP fails with 500.
const MAX_BIND_ATTEMPTS: usize = 16;

impl PortAllocator {
    pub fn new(bind_ip: IpAddr, min: u16, max: u16) -> Self {
        // RTP ports are even (RFC 3550 §11); round an odd minimum up.
        let start = min + (min & 1);
        Self {
            bind_ip,
            start,
            max,
            cursor: Arc::new(Mutex::new(start)),
        }
    }

    /// Grant the next free even/odd port pair, binding both sockets.
    pub fn allocate_pair(&self) -> Result<AllocatedPair> {
        let mut cursor = self.cursor.lock();
        for _ in 0..MAX_BIND_ATTEMPTS {
            let port = *cursor;
            if port > self.max.saturating_sub(1) {
                *cursor = self.start;
                continue;
            }
            *cursor = match port.checked_add(2) {
                Some(next) => next,
                None => self.start,
            };

            match (
                UdpSocket::bind((self.bind_ip, port)),
                UdpSocket::bind((self.bind_ip, port + 1)),
            ) {
                (Ok(rtp_socket), Ok(rtcp_socket)) => {
                    tracing::trace!(rtp_port = port, rtcp_port = port + 1, "allocated port pair");
                    return Ok(AllocatedPair {
                        rtp_port: port,
                        rtp_socket,
                        rtcp_socket,
                    });
                }
                _ => {
                    tracing::debug!(port, "port pair unavailable, advancing");
                }
            }
        }
        tracing::error!(
            min = self.start,
            max = self.max,
            "no bindable RTP port pair found"
        );
        Err(RelayError::ResourceExhausted)
    }
}

/// Everything a connection handler needs, constructed once per
/// [`Server::start`] and shared by reference. No hidden statics.
pub struct ServerContext {
    pub config: Config,
    pub registry: MountRegistry,
    pub ports: PortAllocator,
    pub session_ids: SessionIdGen,
    /// Shared egress socket for UDP delivery from interleaved sources.
    pub egress: UdpTransport,
    pub active_connections: AtomicUsize,
    pub on_mount_update: Option<MountUpdateFn>,
}

/// The RTSP relay server.
///
/// Owns the mount registry and accept thread. Connection handling is
/// delegated to [`crate::transport::tcp`], RTP ingress and fan-out to
/// [`crate::transport::udp`].
///
/// ```no_run
/// use rtsp_relay::{Config, Server};
///
/// let mut server = Server::new(Config::default());
/// server.start().unwrap();
/// // ... publishers ANNOUNCE, clients PLAY ...
/// server.stop();
/// ```
pub struct Server {
    config: Config,
    registry: MountRegistry,
    session_ids: SessionIdGen,
    on_mount_update: Option<MountUpdateFn>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: MountRegistry::new(),
            session_ids: SessionIdGen::new(),
            on_mount_update: None,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            accept_thread: None,
        }
    }

    /// Register a callback for mount/unmount events.
    ///
    /// Must be called before [`start`](Self::start).
    pub fn on_mount_update<F>(&mut self, callback: F)
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.on_mount_update = Some(Arc::new(callback));
    }

    /// Bind the listen socket and start accepting connections.
    ///
    /// Configuration problems surface as [`RelayError::Config`]; a listen
    /// socket that cannot be bound surfaces as [`RelayError::Io`] so the
    /// caller can distinguish the two at exit-code time.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }
        self.config.validate()?;
        let bind_ip = self.config.listen_ip()?;

        let listener = TcpListener::bind(self.config.bind_addr())?;
        listener.set_nonblocking(true)?;
        self.local_addr = listener.local_addr().ok();

        let context = Arc::new(ServerContext {
            config: self.config.clone(),
            registry: self.registry.clone(),
            ports: PortAllocator::new(bind_ip, self.config.rtp_port_min, self.config.rtp_port_max),
            session_ids: self.session_ids.clone(),
            egress: UdpTransport::bind()?,
            active_connections: AtomicUsize::new(0),
            on_mount_update: self.on_mount_update.clone(),
        });

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        tracing::info!(addr = %self.config.bind_addr(), "RTSP relay listening");

        self.accept_thread = Some(thread::spawn(move || {
            tcp::accept_loop(listener, context, running);
        }));

        Ok(())
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    /// Existing connections drain on their own threads.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Actual listen address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The mount registry (for inspection by embedders).
    pub fn mounts(&self) -> &MountRegistry {
        &self.registry
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_allocator(min: u16, max: u16) -> PortAllocator {
        PortAllocator::new("127.0.0.1".parse().unwrap(), min, max)
    }

    #[test]
    fn allocated_ports_are_even_adjacent_pairs() {
        let ports = local_allocator(25600, 25620);
        let pair = ports.allocate_pair().unwrap();
        assert_eq!(pair.rtp_port % 2, 0);
        assert_eq!(pair.rtcp_port(), pair.rtp_port + 1);
    }

    #[test]
    fn cursor_advances_by_two() {
        let ports = local_allocator(25630, 25650);
        let first = ports.allocate_pair().unwrap();
        let second = ports.allocate_pair().unwrap();
        assert_eq!(second.rtp_port, first.rtp_port + 2);
    }

    #[test]
    fn odd_minimum_rounds_up() {
        let ports = local_allocator(25661, 25680);
        let pair = ports.allocate_pair().unwrap();
        assert_eq!(pair.rtp_port, 25662);
    }

    #[test]
    fn occupied_pair_is_skipped() {
        let blocker = UdpSocket::bind("127.0.0.1:25690").unwrap();
        let ports = local_allocator(25690, 25710);
        let pair = ports.allocate_pair().unwrap();
        assert_eq!(pair.rtp_port, 25692);
        drop(blocker);
    }

    #[test]
    fn held_allocations_are_not_reissued() {
        let ports = local_allocator(25720, 25740);
        let first = ports.allocate_pair().unwrap();
        let second = ports.allocate_pair().unwrap();
        assert_ne!(first.rtp_port, second.rtp_port);
    }

    #[test]
    fn full_range_exhausts() {
        // Occupy the whole (tiny) range so every bind attempt fails.
        let _blockers: Vec<UdpSocket> = (25750..=25753)
            .map(|p| UdpSocket::bind(("127.0.0.1", p)).unwrap())
            .collect();
        let ports = local_allocator(25750, 25753);
        assert!(matches!(
            ports.allocate_pair(),
            Err(RelayError::ResourceExhausted)
        ));
    }

    #[test]
    fn start_rejects_invalid_config() {
        let mut config = Config::default();
        config.rtp_port_min = 30000;
        config.rtp_port_max = 20000;
        let mut server = Server::new(config);
        assert!(matches!(server.start(), Err(RelayError::Config(_))));
    }

    #[test]
    fn start_and_stop() {
        let mut config = Config::default();
        config.listen_address = "127.0.0.1".to_string();
        config.listen_port = 18561;
        let mut server = Server::new(config);
        server.start().expect("server start");
        assert!(server.is_running());
        assert_eq!(server.local_addr().unwrap().port(), 18561);
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn double_start_is_rejected() {
        let mut config = Config::default();
        config.listen_address = "127.0.0.1".to_string();
        config.listen_port = 18562;
        let mut server = Server::new(config);
        server.start().expect("server start");
        assert!(matches!(server.start(), Err(RelayError::AlreadyRunning)));
        server.stop();
    }
}
