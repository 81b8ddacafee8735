//! RTSP control-plane transport: the accept loop and the per-connection
//! state machine.
//!
//! Every accepted socket runs on its own thread. A connection starts
//! role-agnostic; ANNOUNCE promotes it to a source, DESCRIBE or a
//! subscribing SETUP to a client. Requests are served strictly in order,
//! and all writes to the socket (responses and interleaved frames) are
//! serialized through the connection's [`PeerHandle`].

use std::collections::HashMap;
use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{ParseErrorKind, RelayError};
use crate::mount::{self, Mount, Subscriber, SubscriberTransport};
use crate::protocol::{Message, MessageReader, RtspRequest, RtspResponse, INTERLEAVED_SENTINEL};
use crate::server::ServerContext;
use crate::session::{transport as transport_header, ConnState, Role, TransportHeader, TransportSpec};
use crate::transport::udp::{broadcast, PacketKind, RtpListener};

/// Write half of a connection, shared with the streams it subscribes to.
///
/// Subscribers hold this behind a `Weak`; broadcasts upgrade it, check
/// the playing gate, and write frames under the same mutex that guards
/// RTSP responses, so a frame can never split a response (or vice versa).
pub struct PeerHandle {
    writer: Mutex<TcpStream>,
    playing: AtomicBool,
}

impl PeerHandle {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            writer: Mutex::new(stream),
            playing: AtomicBool::new(false),
        }
    }

    /// Whether the owning connection is in the Playing state.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    /// Write one interleaved frame: `$` + channel + length + payload
    /// (RFC 2326 §10.12).
    pub fn write_interleaved(&self, channel: u8, payload: &[u8]) -> io::Result<()> {
        let Ok(length) = u16::try_from(payload.len()) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload exceeds interleaved frame limit",
            ));
        };
        let header = [
            INTERLEAVED_SENTINEL,
            channel,
            (length >> 8) as u8,
            (length & 0xff) as u8,
        ];
        let mut writer = self.writer.lock();
        writer.write_all(&header)?;
        writer.write_all(payload)
    }

    fn write_response(&self, response: &RtspResponse) -> io::Result<()> {
        self.writer.lock().write_all(response.serialize().as_bytes())
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
/// Connections beyond `max_connections` are dropped at accept.
pub fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let active = ctx.active_connections.load(Ordering::SeqCst);
                if active >= ctx.config.max_connections {
                    tracing::warn!(%peer_addr, active, "connection limit reached, dropping");
                    continue;
                }
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let timeout = Duration::from_secs(ctx.config.read_timeout_seconds);
                if stream.set_read_timeout(Some(timeout)).is_err()
                    || stream.set_write_timeout(Some(timeout)).is_err()
                {
                    continue;
                }
                ctx.active_connections.fetch_add(1, Ordering::SeqCst);
                let ctx = ctx.clone();
                let r = running.clone();
                thread::spawn(move || {
                    Connection::handle(stream, ctx.clone(), r);
                    ctx.active_connections.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP connection with its own lifecycle.
struct Connection {
    reader: MessageReader<BufReader<TcpStream>>,
    peer: Arc<PeerHandle>,
    peer_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    role: Role,
    state: ConnState,
    session_id: Option<String>,
    /// The mount this connection published (source role only). Held
    /// strongly for the source's lifetime; the registry entry is removed
    /// on teardown.
    mount: Option<Arc<Mount>>,
    /// Interleaved ingress: RTP channel ID -> stream index, fixed at SETUP.
    channels: HashMap<u8, usize>,
    /// UDP ingress listeners owned by a recording source.
    listeners: Vec<RtpListener>,
    /// Mounts this connection subscribed to (client role only).
    subscribed: Vec<Arc<Mount>>,
    cleaned_up: bool,
    closing: bool,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    pub fn handle(stream: TcpStream, ctx: Arc<ServerContext>, running: Arc<AtomicBool>) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "peer connected");

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };

        let mut conn = Connection {
            reader: MessageReader::new(BufReader::new(reader_stream)),
            peer: Arc::new(PeerHandle::new(stream)),
            peer_addr,
            ctx,
            role: Role::Unknown,
            state: ConnState::Init,
            session_id: None,
            mount: None,
            channels: HashMap::new(),
            listeners: Vec::new(),
            subscribed: Vec::new(),
            cleaned_up: false,
            closing: false,
        };

        let reason = conn.run(&running);
        conn.cleanup();

        tracing::info!(%peer_addr, reason, "peer disconnected");
    }

    /// RTSP message loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        while running.load(Ordering::SeqCst) {
            match self.reader.read_message() {
                Ok(Message::Request(request)) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        "request"
                    );

                    let response = self.dispatch(&request);

                    tracing::debug!(
                        peer = %self.peer_addr,
                        status = response.status_code,
                        "response"
                    );

                    if self.peer.write_response(&response).is_err() {
                        return "write error";
                    }
                    if self.closing {
                        return "teardown";
                    }
                }
                Ok(Message::Interleaved { channel, payload }) => {
                    self.on_frame(channel, &payload);
                }
                Err(RelayError::PeerClosed) => return "connection closed by peer",
                Err(RelayError::PeerReset) => return "peer reset mid-message",
                Err(RelayError::ProtocolViolation {
                    kind: ParseErrorKind::UnexpectedInterleaved,
                }) => {
                    // Binary data on a connection that never negotiated it;
                    // the stream cannot be re-synchronized.
                    let response = RtspResponse::bad_request().add_header("CSeq", "0");
                    let _ = self.peer.write_response(&response);
                    return "unexpected interleaved data";
                }
                Err(e @ (RelayError::ProtocolViolation { .. } | RelayError::UnsupportedVersion(_))) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "protocol error");
                    let response = RtspResponse::bad_request().add_header("CSeq", "0");
                    if self.peer.write_response(&response).is_err() {
                        return "write error";
                    }
                }
                Err(RelayError::Io(ref e))
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return "read timeout";
                }
                Err(RelayError::Io(_)) => return "read error",
                Err(_) => return "connection error",
            }
        }
        "server shutting down"
    }

    /// Method dispatch table (§ RFC 2326 Appendix A). Any method/state
    /// combination not in the table answers 455; unknown methods 501.
    fn dispatch(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(cseq) = request.cseq().map(str::to_string) else {
            tracing::warn!(peer = %self.peer_addr, method = %request.method, "request without CSeq");
            return RtspResponse::bad_request().add_header("CSeq", "0");
        };

        // A presented session ID must match the one this connection was
        // assigned (RFC 2326 §12.37).
        if let Some(presented) = request.session() {
            if self.session_id.as_deref() != Some(presented) {
                tracing::warn!(peer = %self.peer_addr, presented, "unknown session");
                return RtspResponse::session_not_found().add_header("CSeq", &cseq);
            }
        }

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(&cseq),
            "ANNOUNCE" => self.handle_announce(&cseq, request),
            "DESCRIBE" => self.handle_describe(&cseq, request),
            "SETUP" => self.handle_setup(&cseq, request),
            "RECORD" => self.handle_record(&cseq, request),
            "PLAY" => self.handle_play(&cseq),
            "PAUSE" => self.handle_pause(&cseq),
            "TEARDOWN" => self.handle_teardown(&cseq),
            "GET_PARAMETER" | "SET_PARAMETER" => self.finish(RtspResponse::ok(), &cseq),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented().add_header("CSeq", &cseq)
            }
        }
    }

    /// Append CSeq and, once a session exists, the Session header.
    fn finish(&self, response: RtspResponse, cseq: &str) -> RtspResponse {
        let response = response.add_header("CSeq", cseq);
        match &self.session_id {
            Some(id) => response.add_header("Session", id),
            None => response,
        }
    }

    fn method_not_valid(&self, method: &str, cseq: &str) -> RtspResponse {
        tracing::warn!(
            peer = %self.peer_addr,
            method,
            role = ?self.role,
            state = self.state.name(),
            "method not valid in this state"
        );
        self.finish(RtspResponse::method_not_valid(), cseq)
    }

    fn ensure_session(&mut self) -> String {
        if let Some(id) = &self.session_id {
            return id.clone();
        }
        let id = self.ctx.session_ids.next();
        tracing::debug!(peer = %self.peer_addr, session_id = %id, "session assigned");
        self.session_id = Some(id.clone());
        id
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        // Sources need ANNOUNCE/RECORD advertised; a connection already
        // demoted to client gets the plain set.
        let public = if self.role == Role::Client {
            "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER"
        } else {
            "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, RECORD, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER"
        };
        self.finish(RtspResponse::ok().add_header("Public", public), cseq)
    }

    fn handle_announce(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        if self.role != Role::Unknown || self.state != ConnState::Init {
            return self.method_not_valid("ANNOUNCE", cseq);
        }

        let sdp = match String::from_utf8(request.body.clone()) {
            Ok(sdp) if !sdp.is_empty() => sdp,
            _ => {
                tracing::warn!(peer = %self.peer_addr, "ANNOUNCE without usable SDP body");
                return self.finish(RtspResponse::bad_request(), cseq);
            }
        };
        if !sdp.lines().any(|l| l.starts_with("m=")) {
            tracing::warn!(peer = %self.peer_addr, "ANNOUNCE SDP has no media sections");
            return self.finish(RtspResponse::bad_request(), cseq);
        }

        let path = mount::normalize_path(&request.uri);
        match self.ctx.registry.create(&path, sdp) {
            Ok(created) => {
                tracing::info!(peer = %self.peer_addr, path, "stream announced");
                self.role = Role::Source;
                self.mount = Some(created);
                self.finish(RtspResponse::ok(), cseq)
            }
            Err(RelayError::AlreadyExists(_)) => {
                tracing::warn!(peer = %self.peer_addr, path, "ANNOUNCE for occupied path");
                self.finish(RtspResponse::forbidden(), cseq)
            }
            Err(e) => {
                tracing::error!(peer = %self.peer_addr, error = %e, "mount creation failed");
                self.finish(RtspResponse::internal_error(), cseq)
            }
        }
    }

    fn handle_describe(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let path = mount::normalize_path(&request.uri);
        match self.ctx.registry.lookup(&path) {
            Some(target) if target.is_mounted() => {
                if self.role == Role::Unknown {
                    self.role = Role::Client;
                }
                let response = RtspResponse::ok()
                    .add_header("Content-Type", "application/sdp")
                    .add_header("Content-Base", &request.uri)
                    .with_body(target.sdp().to_string());
                self.finish(response, cseq)
            }
            _ => {
                tracing::debug!(peer = %self.peer_addr, path, "DESCRIBE for unknown stream");
                self.finish(RtspResponse::not_found(), cseq)
            }
        }
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        if !matches!(self.state, ConnState::Init | ConnState::Ready) {
            return self.method_not_valid("SETUP", cseq);
        }
        match self.role {
            Role::Source => self.setup_source(cseq, request),
            Role::Client | Role::Unknown => self.setup_client(cseq, request),
        }
    }

    fn setup_source(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(owned) = self.mount.clone() else {
            return self.method_not_valid("SETUP", cseq);
        };
        let Some(transport) = parse_transport(request) else {
            tracing::warn!(peer = %self.peer_addr, "SETUP with missing or invalid Transport");
            return self.finish(RtspResponse::bad_request(), cseq);
        };

        let path = mount::normalize_path(&request.uri);
        let (mount_path, index) = mount::split_stream_target(&path);
        if mount_path != owned.path() {
            return self.finish(RtspResponse::not_found(), cseq);
        }
        let index = index.unwrap_or(0);
        let stream = owned.stream_entry(index);

        let response_transport = match transport.spec {
            TransportSpec::Interleaved { rtp_channel, .. } => {
                self.channels.insert(rtp_channel, index);
                self.reader.set_interleaved(true);
                transport.raw.clone()
            }
            TransportSpec::Udp { rtp_port, rtcp_port } => {
                let server_rtp = match self.stream_server_port(&stream) {
                    Ok(port) => port,
                    Err(response) => return self.finish(response, cseq),
                };
                transport_header::udp_response(rtp_port, rtcp_port, server_rtp, server_rtp + 1)
            }
        };

        self.ensure_session();
        self.state = ConnState::Ready;
        tracing::info!(
            peer = %self.peer_addr,
            path = owned.path(),
            stream = index,
            interleaved = transport.is_interleaved(),
            "source stream set up"
        );
        self.finish(
            RtspResponse::ok().add_header("Transport", &response_transport),
            cseq,
        )
    }

    fn setup_client(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let path = mount::normalize_path(&request.uri);
        let (mount_path, index) = mount::split_stream_target(&path);
        let index = index.unwrap_or(0);

        let target = match self.ctx.registry.lookup(mount_path) {
            Some(m) if m.is_mounted() => m,
            _ => {
                tracing::debug!(peer = %self.peer_addr, mount_path, "SETUP for unknown stream");
                return self.finish(RtspResponse::not_found(), cseq);
            }
        };
        let Some(stream) = target.stream(index) else {
            return self.finish(RtspResponse::not_found(), cseq);
        };
        let Some(transport) = parse_transport(request) else {
            tracing::warn!(peer = %self.peer_addr, "SETUP with missing or invalid Transport");
            return self.finish(RtspResponse::bad_request(), cseq);
        };

        let session_id = self.ensure_session();

        let (subscriber_transport, response_transport) = match transport.spec {
            TransportSpec::Udp { rtp_port, rtcp_port } => {
                let server_rtp = match self.stream_server_port(&stream) {
                    Ok(port) => port,
                    Err(response) => return self.finish(response, cseq),
                };
                let ip = self.peer_addr.ip();
                (
                    SubscriberTransport::Udp {
                        rtp: SocketAddr::new(ip, rtp_port),
                        rtcp: SocketAddr::new(ip, rtcp_port),
                    },
                    transport_header::udp_response(rtp_port, rtcp_port, server_rtp, server_rtp + 1),
                )
            }
            TransportSpec::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => {
                self.reader.set_interleaved(true);
                (
                    SubscriberTransport::Interleaved {
                        rtp_channel,
                        rtcp_channel,
                    },
                    transport.raw.clone(),
                )
            }
        };

        stream.subscribe(Subscriber {
            session_id,
            peer: Arc::downgrade(&self.peer),
            transport: subscriber_transport,
        });
        if !self.subscribed.iter().any(|m| Arc::ptr_eq(m, &target)) {
            self.subscribed.push(target.clone());
        }

        self.role = Role::Client;
        self.state = ConnState::Ready;
        tracing::info!(
            peer = %self.peer_addr,
            path = target.path(),
            stream = index,
            interleaved = transport.is_interleaved(),
            "client subscribed"
        );
        self.finish(
            RtspResponse::ok().add_header("Transport", &response_transport),
            cseq,
        )
    }

    /// The stream's server-side RTP port, allocating (and binding) a pair
    /// on first use. Allocation failure maps to 500 on the owning SETUP.
    fn stream_server_port(&self, stream: &crate::mount::Stream) -> Result<u16, RtspResponse> {
        if let Some(port) = stream.rtp_port() {
            return Ok(port);
        }
        match self.ctx.ports.allocate_pair() {
            Ok(pair) => {
                let port = pair.rtp_port;
                stream.set_port_pair(pair.rtp_port, pair.rtp_socket, pair.rtcp_socket);
                Ok(port)
            }
            Err(e) => {
                tracing::error!(peer = %self.peer_addr, error = %e, "RTP port allocation failed");
                Err(RtspResponse::internal_error())
            }
        }
    }

    fn handle_record(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        if self.role != Role::Source || self.state != ConnState::Ready {
            return self.method_not_valid("RECORD", cseq);
        }
        let Some(owned) = self.mount.clone() else {
            return self.method_not_valid("RECORD", cseq);
        };

        let interleaved = !self.channels.is_empty();

        // One stream per SDP media section; sections the source never
        // SETUP individually still get a port pair in UDP mode.
        for index in 0..owned.media_count() {
            let stream = owned.stream_entry(index);
            if !interleaved {
                if let Err(response) = self.stream_server_port(&stream) {
                    return self.finish(response, cseq);
                }
            }
        }

        if !interleaved {
            for stream in owned.streams() {
                match RtpListener::spawn(owned.path(), stream) {
                    Ok(listener) => self.listeners.push(listener),
                    Err(e) => {
                        tracing::error!(peer = %self.peer_addr, error = %e, "RTP listener failed");
                        return self.finish(RtspResponse::internal_error(), cseq);
                    }
                }
            }
        }

        if let Some(range) = request.get_header("Range") {
            owned.set_range(Some(range.to_string()));
        }
        owned.set_mounted(true);
        owned.set_source_host(Some(self.peer_addr.ip().to_string()));
        if let Some(callback) = &self.ctx.on_mount_update {
            callback(owned.path(), true);
        }

        self.state = ConnState::Recording;
        tracing::info!(peer = %self.peer_addr, path = owned.path(), interleaved, "stream mounted");
        self.finish(RtspResponse::ok(), cseq)
    }

    fn handle_play(&mut self, cseq: &str) -> RtspResponse {
        if self.role != Role::Client || self.state != ConnState::Ready {
            return self.method_not_valid("PLAY", cseq);
        }
        // The publisher may have torn down between SETUP and PLAY.
        let Some(live) = self.subscribed.iter().find(|m| m.is_mounted()) else {
            return self.finish(RtspResponse::not_found(), cseq);
        };
        let range = live.range().unwrap_or_else(|| "npt=now-".to_string());

        self.peer.set_playing(true);
        self.state = ConnState::Playing;
        tracing::info!(peer = %self.peer_addr, path = live.path(), "client playing");
        self.finish(RtspResponse::ok().add_header("Range", &range), cseq)
    }

    fn handle_pause(&mut self, cseq: &str) -> RtspResponse {
        if self.role != Role::Client || self.state != ConnState::Playing {
            return self.method_not_valid("PAUSE", cseq);
        }
        self.peer.set_playing(false);
        self.state = ConnState::Ready;
        tracing::info!(peer = %self.peer_addr, "client paused");
        self.finish(RtspResponse::ok(), cseq)
    }

    fn handle_teardown(&mut self, cseq: &str) -> RtspResponse {
        self.cleanup();
        self.closing = true;
        self.finish(RtspResponse::ok(), cseq)
    }

    /// Interleaved ingress: resolve the channel against the map fixed at
    /// SETUP and fan the payload out like a UDP listener would.
    fn on_frame(&mut self, channel: u8, payload: &[u8]) {
        if self.role != Role::Source || self.state != ConnState::Recording {
            tracing::trace!(peer = %self.peer_addr, channel, "ignoring interleaved frame");
            return;
        }

        let (kind, rtp_channel) = if self.channels.contains_key(&channel) {
            (PacketKind::Rtp, channel)
        } else if channel > 0 && self.channels.contains_key(&(channel - 1)) {
            (PacketKind::Rtcp, channel - 1)
        } else {
            tracing::trace!(peer = %self.peer_addr, channel, "frame on unmapped channel");
            return;
        };

        let Some(owned) = &self.mount else { return };
        let Some(&index) = self.channels.get(&rtp_channel) else {
            return;
        };
        let Some(stream) = owned.stream(index) else { return };

        broadcast(&stream, kind, payload, self.ctx.egress.socket());
    }

    /// Teardown for either role. Runs exactly once; later calls are no-ops,
    /// so TEARDOWN followed by socket close behaves like a single teardown.
    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        for listener in &mut self.listeners {
            listener.stop();
        }
        self.listeners.clear();
        self.channels.clear();

        if let Some(owned) = self.mount.take() {
            self.ctx.registry.unmount(owned.path());
            owned.set_mounted(false);
            owned.set_source_host(None);
            owned.evict_subscribers();
            if let Some(callback) = &self.ctx.on_mount_update {
                callback(owned.path(), false);
            }
            tracing::info!(peer = %self.peer_addr, path = owned.path(), "stream unmounted");
        }

        if let Some(session_id) = &self.session_id {
            for subscribed in &self.subscribed {
                subscribed.unsubscribe_session(session_id);
            }
        }
        self.subscribed.clear();
        self.peer.set_playing(false);
    }
}

fn parse_transport(request: &RtspRequest) -> Option<TransportHeader> {
    TransportHeader::parse(request.get_header("Transport")?)
}
