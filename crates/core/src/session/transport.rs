//! `Transport` header parsing (RFC 2326 §12.39).
//!
//! The header negotiates how RTP reaches the peer: either a unicast UDP
//! port pair (`client_port=8000-8001`) or a channel pair multiplexed on
//! the control connection (`interleaved=0-1`).

/// How RTP/RTCP flows for one stream of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSpec {
    /// RTP over UDP to the peer's `client_port` pair.
    Udp { rtp_port: u16, rtcp_port: u16 },
    /// RTP framed on the control socket over the given channel pair.
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

/// Parsed client-side `Transport` header.
///
/// The raw header text is retained because an interleaved SETUP response
/// echoes the request's transport verbatim.
#[derive(Debug, Clone)]
pub struct TransportHeader {
    pub raw: String,
    pub spec: TransportSpec,
}

impl TransportHeader {
    /// Parse a `Transport` header value.
    ///
    /// Looks for `interleaved=a-b` or `client_port=RTP-RTCP` among the
    /// semicolon-separated parameters; interleaved wins when both are
    /// present. Returns `None` when neither parameter parses.
    pub fn parse(header: &str) -> Option<Self> {
        let mut udp: Option<TransportSpec> = None;

        for part in header.split(';') {
            let part = part.trim();
            if let Some(channels) = part.strip_prefix("interleaved=") {
                let (rtp_channel, rtcp_channel) = parse_pair::<u8>(channels)?;
                return Some(TransportHeader {
                    raw: header.to_string(),
                    spec: TransportSpec::Interleaved {
                        rtp_channel,
                        rtcp_channel,
                    },
                });
            }
            if let Some(ports) = part.strip_prefix("client_port=") {
                let (rtp_port, rtcp_port) = parse_pair::<u16>(ports)?;
                udp = Some(TransportSpec::Udp { rtp_port, rtcp_port });
            }
        }

        udp.map(|spec| TransportHeader {
            raw: header.to_string(),
            spec,
        })
    }

    /// Whether this transport multiplexes media onto the control socket.
    pub fn is_interleaved(&self) -> bool {
        matches!(self.spec, TransportSpec::Interleaved { .. })
    }
}

/// `"a-b"` → `(a, b)`.
fn parse_pair<T: std::str::FromStr>(value: &str) -> Option<(T, T)> {
    let (first, second) = value.split_once('-')?;
    Some((first.trim().parse().ok()?, second.trim().parse().ok()?))
}

/// Render the server's `Transport` response header for a UDP SETUP.
pub fn udp_response(client_rtp: u16, client_rtcp: u16, server_rtp: u16, server_rtcp: u16) -> String {
    format!(
        "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
        client_rtp, client_rtcp, server_rtp, server_rtcp
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_udp_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(
            th.spec,
            TransportSpec::Udp {
                rtp_port: 5000,
                rtcp_port: 5001
            }
        );
        assert!(!th.is_interleaved());
    }

    #[test]
    fn parse_interleaved_transport() {
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        assert_eq!(
            th.spec,
            TransportSpec::Interleaved {
                rtp_channel: 0,
                rtcp_channel: 1
            }
        );
        assert!(th.is_interleaved());
        assert_eq!(th.raw, "RTP/AVP/TCP;unicast;interleaved=0-1");
    }

    #[test]
    fn interleaved_wins_over_client_port() {
        let th =
            TransportHeader::parse("RTP/AVP/TCP;client_port=9000-9001;interleaved=2-3").unwrap();
        assert!(th.is_interleaved());
    }

    #[test]
    fn no_transport_parameters() {
        assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    }

    #[test]
    fn garbage_ports_rejected() {
        assert!(TransportHeader::parse("RTP/AVP;client_port=abc-def").is_none());
        assert!(TransportHeader::parse("RTP/AVP;client_port=5000").is_none());
    }

    #[test]
    fn render_udp_response() {
        assert_eq!(
            udp_response(9000, 9001, 20000, 20001),
            "RTP/AVP;unicast;client_port=9000-9001;server_port=20000-20001"
        );
    }
}
