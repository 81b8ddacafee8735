//! RTP ingress listeners and subscriber fan-out.
//!
//! In UDP mode every stream owns a bound socket pair; a pair of receive
//! loops forwards each datagram to the stream's subscribers. In
//! interleaved mode the source connection feeds the same fan-out from
//! frames parsed off its control socket.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;
use crate::mount::{Stream, SubscriberTransport};

/// Poll interval for the receive loops' shutdown flag.
const RECV_POLL: Duration = Duration::from_millis(100);

/// Largest UDP datagram we relay.
const MAX_DATAGRAM: usize = 65536;

/// Which half of the RTP/RTCP pair a payload belongs to. Selects the UDP
/// destination port or the interleaved channel on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

/// Shared egress socket for UDP delivery when the payload did not arrive
/// on a stream-owned socket (interleaved sources relaying to UDP clients).
///
/// Deliberately address-only: the caller resolves subscribers to socket
/// addresses before sending.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket for outbound RTP.
    pub fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self { socket })
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

/// Fan one payload out to every subscriber of a stream.
///
/// Takes a snapshot of the subscriber list, writes outside the lock, and
/// removes dead subscribers (dropped connection or failed write) after
/// the pass. A failure to one subscriber never aborts delivery to the
/// others. Delivery is skipped for connections not currently playing.
pub fn broadcast(stream: &Stream, kind: PacketKind, payload: &[u8], udp: &UdpSocket) {
    let snapshot = stream.subscribers_snapshot();
    let mut dead: Vec<String> = Vec::new();

    for (session_id, peer, transport) in snapshot {
        let Some(peer) = peer.upgrade() else {
            dead.push(session_id);
            continue;
        };
        if !peer.is_playing() {
            continue;
        }

        let outcome = match (transport, kind) {
            (SubscriberTransport::Udp { rtp, .. }, PacketKind::Rtp) => send_udp(udp, payload, rtp),
            (SubscriberTransport::Udp { rtcp, .. }, PacketKind::Rtcp) => {
                send_udp(udp, payload, rtcp)
            }
            (SubscriberTransport::Interleaved { rtp_channel, .. }, PacketKind::Rtp) => {
                peer.write_interleaved(rtp_channel, payload)
            }
            (SubscriberTransport::Interleaved { rtcp_channel, .. }, PacketKind::Rtcp) => {
                peer.write_interleaved(rtcp_channel, payload)
            }
        };

        if let Err(e) = outcome {
            tracing::warn!(
                stream = stream.index(),
                %session_id,
                error = %e,
                "subscriber write failed, evicting"
            );
            dead.push(session_id);
        }
    }

    for session_id in dead {
        stream.unsubscribe(&session_id);
    }
}

fn send_udp(socket: &UdpSocket, payload: &[u8], addr: SocketAddr) -> std::io::Result<()> {
    socket.send_to(payload, addr).map(|_| ())
}

/// Receive loops for one stream's bound RTP/RTCP socket pair.
///
/// Each socket gets its own thread; both poll a shared shutdown flag on a
/// short read timeout, so [`stop`](Self::stop) returns promptly.
pub struct RtpListener {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl RtpListener {
    /// Take the stream's parked socket pair and start its receive loops.
    pub fn spawn(mount_path: &str, stream: Arc<Stream>) -> Result<Self> {
        let Some((rtp_socket, rtcp_socket)) = stream.take_sockets() else {
            // Already consumed or never allocated; nothing to listen on.
            return Ok(Self {
                running: Arc::new(AtomicBool::new(false)),
                threads: Vec::new(),
            });
        };

        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::with_capacity(2);
        for (socket, kind) in [(rtp_socket, PacketKind::Rtp), (rtcp_socket, PacketKind::Rtcp)] {
            socket.set_read_timeout(Some(RECV_POLL))?;
            let stream = stream.clone();
            let running = running.clone();
            let path = mount_path.to_string();
            threads.push(thread::spawn(move || {
                recv_loop(&path, &stream, kind, socket, &running);
            }));
        }

        tracing::info!(
            path = mount_path,
            stream = stream.index(),
            rtp_port = stream.rtp_port(),
            "RTP listener started"
        );

        Ok(Self { running, threads })
    }

    /// Stop the receive loops and wait for them to exit. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for RtpListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn recv_loop(
    mount_path: &str,
    stream: &Arc<Stream>,
    kind: PacketKind,
    socket: UdpSocket,
    running: &AtomicBool,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, _from)) => {
                tracing::trace!(
                    path = mount_path,
                    stream = stream.index(),
                    ?kind,
                    len,
                    "datagram received"
                );
                broadcast(stream, kind, &buf[..len], &socket);
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                tracing::warn!(path = mount_path, stream = stream.index(), error = %e, "RTP receive error");
            }
        }
    }
    tracing::debug!(path = mount_path, stream = stream.index(), ?kind, "receive loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{Mount, Subscriber};
    use crate::transport::tcp::PeerHandle;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Weak;

    /// A connected (client side, server-side PeerHandle) pair.
    fn peer_pair() -> (TcpStream, Arc<PeerHandle>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (client, Arc::new(PeerHandle::new(server_side)))
    }

    #[test]
    fn broadcast_to_playing_udp_subscriber() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let dest = receiver.local_addr().unwrap();
        let rtcp_dest: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let (_client, peer) = peer_pair();
        peer.set_playing(true);

        let mount = Mount::new("/t", String::new());
        let stream = mount.stream_entry(0);
        stream.subscribe(Subscriber {
            session_id: "s1".to_string(),
            peer: Arc::downgrade(&peer),
            transport: SubscriberTransport::Udp {
                rtp: dest,
                rtcp: rtcp_dest,
            },
        });

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        broadcast(&stream, PacketKind::Rtp, &[0xAA, 0xBB, 0xCC], &sender);

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0xAA, 0xBB, 0xCC]);
        assert_eq!(stream.subscriber_count(), 1);
    }

    #[test]
    fn broadcast_skips_non_playing_subscriber() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let dest = receiver.local_addr().unwrap();

        let (_client, peer) = peer_pair();

        let mount = Mount::new("/t", String::new());
        let stream = mount.stream_entry(0);
        stream.subscribe(Subscriber {
            session_id: "s1".to_string(),
            peer: Arc::downgrade(&peer),
            transport: SubscriberTransport::Udp {
                rtp: dest,
                rtcp: "127.0.0.1:9".parse().unwrap(),
            },
        });

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        broadcast(&stream, PacketKind::Rtp, &[0x01], &sender);

        let mut buf = [0u8; 16];
        assert!(receiver.recv_from(&mut buf).is_err());
        assert_eq!(stream.subscriber_count(), 1);
    }

    #[test]
    fn broadcast_frames_interleaved_subscriber() {
        let (mut client, peer) = peer_pair();
        peer.set_playing(true);

        let mount = Mount::new("/t", String::new());
        let stream = mount.stream_entry(0);
        stream.subscribe(Subscriber {
            session_id: "s1".to_string(),
            peer: Arc::downgrade(&peer),
            transport: SubscriberTransport::Interleaved {
                rtp_channel: 2,
                rtcp_channel: 3,
            },
        });

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        broadcast(&stream, PacketKind::Rtp, &[0xAA, 0xBB, 0xCC], &sender);

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut frame = [0u8; 7];
        client.read_exact(&mut frame).unwrap();
        assert_eq!(frame, [b'$', 0x02, 0x00, 0x03, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn broadcast_evicts_dropped_subscribers() {
        let mount = Mount::new("/t", String::new());
        let stream = mount.stream_entry(0);
        stream.subscribe(Subscriber {
            session_id: "gone".to_string(),
            peer: Weak::new(),
            transport: SubscriberTransport::Udp {
                rtp: "127.0.0.1:9".parse().unwrap(),
                rtcp: "127.0.0.1:10".parse().unwrap(),
            },
        });
        assert_eq!(stream.subscriber_count(), 1);

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        broadcast(&stream, PacketKind::Rtp, &[0x00], &socket);
        assert_eq!(stream.subscriber_count(), 0);
    }
}
