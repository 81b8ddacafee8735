//! Mount points: the glue between one publisher and many subscribers.
//!
//! A [`Mount`] is created by ANNOUNCE, populated with [`Stream`]s by the
//! source's SETUPs, marked live by RECORD, and removed when the source
//! tears down or disconnects. Clients look mounts up by normalized URL
//! path and attach [`Subscriber`]s to individual streams.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{RelayError, Result};
use crate::transport::tcp::PeerHandle;

/// How RTP reaches one subscriber.
#[derive(Debug, Clone, Copy)]
pub enum SubscriberTransport {
    /// Datagrams sent to the client's negotiated UDP ports.
    Udp { rtp: SocketAddr, rtcp: SocketAddr },
    /// Frames written to the client's own control socket.
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

/// One client attachment to a [`Stream`].
///
/// Holds only a weak reference to the client connection: when the
/// connection drops, the upgrade fails and the subscriber is evicted at
/// the next broadcast pass.
#[derive(Debug)]
pub struct Subscriber {
    pub session_id: String,
    pub peer: Weak<PeerHandle>,
    pub transport: SubscriberTransport,
}

/// A numbered sub-stream of a mount (one per SDP `m=` line).
#[derive(Debug)]
pub struct Stream {
    index: usize,
    /// Server-side RTP port (even; RTCP is the next odd port). `None`
    /// until a port pair has been allocated — interleaved-only streams
    /// may never get one.
    rtp_port: RwLock<Option<u16>>,
    /// Bound socket pair parked here between SETUP and RECORD; the RTP
    /// listener takes them when its receive loops start.
    sockets: Mutex<Option<(UdpSocket, UdpSocket)>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Stream {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            rtp_port: RwLock::new(None),
            sockets: Mutex::new(None),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Server-side RTP port, when one has been allocated.
    pub fn rtp_port(&self) -> Option<u16> {
        *self.rtp_port.read()
    }

    /// Attach an allocated, already-bound port pair to this stream.
    pub fn set_port_pair(&self, rtp_port: u16, rtp_socket: UdpSocket, rtcp_socket: UdpSocket) {
        *self.rtp_port.write() = Some(rtp_port);
        *self.sockets.lock() = Some((rtp_socket, rtcp_socket));
    }

    /// Hand the parked socket pair to the RTP listener.
    pub fn take_sockets(&self) -> Option<(UdpSocket, UdpSocket)> {
        self.sockets.lock().take()
    }

    /// Register a subscriber, replacing any previous one for the same
    /// session (a client may re-SETUP the same stream).
    pub fn subscribe(&self, subscriber: Subscriber) {
        let mut subs = self.subscribers.write();
        subs.retain(|s| s.session_id != subscriber.session_id);
        tracing::debug!(
            stream = self.index,
            session_id = %subscriber.session_id,
            "subscriber attached"
        );
        subs.push(subscriber);
    }

    /// Remove the subscriber for a session, if present.
    pub fn unsubscribe(&self, session_id: &str) {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.session_id != session_id);
        if subs.len() != before {
            tracing::debug!(stream = self.index, session_id, "subscriber detached");
        }
    }

    /// Snapshot of subscribers for a broadcast pass. Socket writes happen
    /// outside the lock so one slow client never stalls the listener.
    pub fn subscribers_snapshot(&self) -> Vec<(String, Weak<PeerHandle>, SubscriberTransport)> {
        self.subscribers
            .read()
            .iter()
            .map(|s| (s.session_id.clone(), s.peer.clone(), s.transport))
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn clear_subscribers(&self) {
        self.subscribers.write().clear();
    }
}

/// A published stream endpoint (e.g. `/live`, `/cam1`).
#[derive(Debug)]
pub struct Mount {
    path: String,
    sdp: String,
    streams: RwLock<Vec<Arc<Stream>>>,
    mounted: AtomicBool,
    source_host: RwLock<Option<String>>,
    range: RwLock<Option<String>>,
}

impl Mount {
    pub fn new(path: &str, sdp: String) -> Self {
        Self {
            path: path.to_string(),
            sdp,
            streams: RwLock::new(Vec::new()),
            mounted: AtomicBool::new(false),
            source_host: RwLock::new(None),
            range: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The SDP exactly as the source announced it.
    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    /// Number of media sections (`m=` lines) in the announced SDP.
    pub fn media_count(&self) -> usize {
        self.sdp.lines().filter(|l| l.starts_with("m=")).count()
    }

    /// Whether the source has completed RECORD. Clients may only
    /// DESCRIBE/SETUP/PLAY a mounted mount.
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    pub fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::SeqCst);
    }

    pub fn source_host(&self) -> Option<String> {
        self.source_host.read().clone()
    }

    pub fn set_source_host(&self, host: Option<String>) {
        *self.source_host.write() = host;
    }

    pub fn range(&self) -> Option<String> {
        self.range.read().clone()
    }

    pub fn set_range(&self, range: Option<String>) {
        *self.range.write() = range;
    }

    /// Look up a stream by index.
    pub fn stream(&self, index: usize) -> Option<Arc<Stream>> {
        self.streams
            .read()
            .iter()
            .find(|s| s.index() == index)
            .cloned()
    }

    /// Get or create the stream for an index, keeping the list ordered.
    pub fn stream_entry(&self, index: usize) -> Arc<Stream> {
        if let Some(stream) = self.stream(index) {
            return stream;
        }
        let mut streams = self.streams.write();
        if let Some(stream) = streams.iter().find(|s| s.index() == index) {
            return stream.clone();
        }
        let stream = Arc::new(Stream::new(index));
        let at = streams
            .iter()
            .position(|s| s.index() > index)
            .unwrap_or(streams.len());
        streams.insert(at, stream.clone());
        stream
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.read().clone()
    }

    /// Detach one session from every stream (client teardown).
    pub fn unsubscribe_session(&self, session_id: &str) {
        for stream in self.streams.read().iter() {
            stream.unsubscribe(session_id);
        }
    }

    /// Drop every subscriber on every stream (unmount).
    pub fn evict_subscribers(&self) {
        for stream in self.streams.read().iter() {
            stream.clear_subscribers();
        }
    }
}

/// Registry of mounts, keyed by normalized path.
///
/// The map is the process's only multi-writer structure; the mutex guards
/// the map alone and is never held across a socket write.
#[derive(Clone)]
pub struct MountRegistry {
    mounts: Arc<Mutex<HashMap<String, Arc<Mount>>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            mounts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new mount. Rejected while any mount occupies the path,
    /// mounted or not — a second ANNOUNCE is forbidden until the first
    /// publisher is gone.
    pub fn create(&self, path: &str, sdp: String) -> Result<Arc<Mount>> {
        let mut mounts = self.mounts.lock();
        if mounts.contains_key(path) {
            return Err(RelayError::AlreadyExists(path.to_string()));
        }
        let mount = Arc::new(Mount::new(path, sdp));
        mounts.insert(path.to_string(), mount.clone());
        tracing::info!(path, "mount registered");
        Ok(mount)
    }

    /// Look up a mount by normalized path.
    pub fn lookup(&self, path: &str) -> Option<Arc<Mount>> {
        self.mounts.lock().get(path).cloned()
    }

    /// Remove a mount from the registry. The mount itself stays alive as
    /// long as the owning source connection holds it.
    pub fn unmount(&self, path: &str) -> Option<Arc<Mount>> {
        let removed = self.mounts.lock().remove(path);
        if removed.is_some() {
            tracing::info!(path, "mount removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.mounts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.lock().is_empty()
    }
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize a request URI to a mount path.
///
/// Strips the `rtsp://host[:port]` prefix and any query string, collapses
/// duplicate slashes, and removes a trailing slash except on the root.
///
/// `rtsp://host:8554/live/`  → `/live`
/// `rtsp://host//a//b?x=1`   → `/a/b`
/// `rtsp://host`             → `/`
pub fn normalize_path(uri: &str) -> String {
    let path = match uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        Some(after) => match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        },
        None => uri,
    };
    let path = path.split('?').next().unwrap_or("/");

    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Split a normalized path into its mount path and stream index.
///
/// SETUP targets a sub-stream with a `/streamid=N` suffix:
/// `/live/streamid=1` → (`/live`, Some(1)). Paths without the suffix
/// address the whole mount.
pub fn split_stream_target(path: &str) -> (&str, Option<usize>) {
    if let Some(pos) = path.rfind('/') {
        if let Some(value) = path[pos + 1..].strip_prefix("streamid=") {
            if let Ok(index) = value.parse() {
                let mount = if pos == 0 { "/" } else { &path[..pos] };
                return (mount, Some(index));
            }
        }
    }
    (path, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_full_uri() {
        assert_eq!(normalize_path("rtsp://localhost:8554/live"), "/live");
    }

    #[test]
    fn normalize_strips_trailing_slash() {
        assert_eq!(normalize_path("rtsp://host/live/"), "/live");
    }

    #[test]
    fn normalize_collapses_double_slashes() {
        assert_eq!(normalize_path("rtsp://host//a//b"), "/a/b");
    }

    #[test]
    fn normalize_drops_query() {
        assert_eq!(normalize_path("rtsp://host/live?token=x"), "/live");
    }

    #[test]
    fn normalize_bare_host_is_root() {
        assert_eq!(normalize_path("rtsp://host:8554"), "/");
    }

    #[test]
    fn normalize_bare_path() {
        assert_eq!(normalize_path("/cam1"), "/cam1");
    }

    #[test]
    fn stream_target_with_suffix() {
        assert_eq!(split_stream_target("/live/streamid=0"), ("/live", Some(0)));
        assert_eq!(split_stream_target("/a/b/streamid=2"), ("/a/b", Some(2)));
    }

    #[test]
    fn stream_target_without_suffix() {
        assert_eq!(split_stream_target("/live"), ("/live", None));
    }

    #[test]
    fn stream_target_at_root() {
        assert_eq!(split_stream_target("/streamid=1"), ("/", Some(1)));
    }

    #[test]
    fn create_rejects_duplicate_path() {
        let registry = MountRegistry::new();
        registry.create("/live", "v=0\r\n".to_string()).unwrap();
        let err = registry.create("/live", "v=0\r\n".to_string()).unwrap_err();
        assert!(matches!(err, RelayError::AlreadyExists(_)));
    }

    #[test]
    fn duplicate_rejected_even_before_mounted() {
        let registry = MountRegistry::new();
        let mount = registry.create("/live", "v=0\r\n".to_string()).unwrap();
        assert!(!mount.is_mounted());
        assert!(registry.create("/live", "v=0\r\n".to_string()).is_err());
    }

    #[test]
    fn lookup_after_unmount_fails() {
        let registry = MountRegistry::new();
        registry.create("/live", "v=0\r\n".to_string()).unwrap();
        assert!(registry.lookup("/live").is_some());
        registry.unmount("/live");
        assert!(registry.lookup("/live").is_none());
    }

    #[test]
    fn path_free_for_reuse_after_unmount() {
        let registry = MountRegistry::new();
        registry.create("/live", "old".to_string()).unwrap();
        registry.unmount("/live");
        let mount = registry.create("/live", "new".to_string()).unwrap();
        assert_eq!(mount.sdp(), "new");
    }

    #[test]
    fn media_count_counts_m_lines() {
        let sdp = "v=0\r\nm=video 0 RTP/AVP 96\r\na=control:streamid=0\r\nm=audio 0 RTP/AVP 97\r\n";
        let mount = Mount::new("/live", sdp.to_string());
        assert_eq!(mount.media_count(), 2);
    }

    #[test]
    fn stream_entry_is_ordered_and_idempotent() {
        let mount = Mount::new("/live", String::new());
        mount.stream_entry(1);
        mount.stream_entry(0);
        let first = mount.stream_entry(1);
        let indices: Vec<usize> = mount.streams().iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(Arc::ptr_eq(&first, &mount.stream(1).unwrap()));
    }

    #[test]
    fn sdp_survives_byte_identical() {
        let sdp = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\nm=video 0 RTP/AVP 96\r\n".to_string();
        let mount = Mount::new("/live", sdp.clone());
        assert_eq!(mount.sdp(), sdp);
    }
}
