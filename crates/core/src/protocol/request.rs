//! RTSP message parsing (RFC 2326 §6, §10.12).
//!
//! A control connection carries two kinds of messages on the same byte
//! stream: text RTSP requests and, once interleaved transport has been
//! negotiated, binary interleaved frames. [`MessageReader`] demultiplexes
//! both from a buffered socket.

use std::io::{self, BufRead};

use crate::error::{ParseErrorKind, RelayError, Result};

/// First byte of an interleaved frame (`$`, RFC 2326 §10.12).
pub const INTERLEAVED_SENTINEL: u8 = b'$';

/// Upper bound on the request line plus headers. A peer that never sends
/// the terminating blank line must not grow the buffer without limit.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// One message read off the control connection.
#[derive(Debug)]
pub enum Message {
    /// A parsed RTSP request.
    Request(RtspRequest),
    /// An interleaved RTP/RTCP frame: `$` + channel + 2-byte length + payload.
    Interleaved { channel: u8, payload: Vec<u8> },
}

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. The body is kept
/// as raw bytes so an SDP payload survives byte-for-byte.
#[derive(Debug)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, ANNOUNCE, SETUP, RECORD, PLAY, etc.).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/live/streamid=0`).
    pub uri: String,
    /// Protocol version (always `RTSP/1.0` once parsed).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Message body, sized by `Content-Length`. Empty when absent.
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Returns the session ID from the Session header, with any
    /// `;timeout=` suffix stripped (RFC 2326 §12.37).
    pub fn session(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }
}

/// Lazily yields [`Message`]s from a buffered control-socket reader.
///
/// Interleaved frames are rejected as a protocol violation until
/// [`set_interleaved`](Self::set_interleaved) arms them, which happens
/// when a SETUP negotiates `interleaved=` channels on the connection.
pub struct MessageReader<R: BufRead> {
    reader: R,
    interleaved: bool,
}

impl<R: BufRead> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            interleaved: false,
        }
    }

    /// Allow `$`-framed interleaved data on this connection.
    pub fn set_interleaved(&mut self, on: bool) {
        self.interleaved = on;
    }

    /// Read the next message off the stream.
    ///
    /// Returns [`RelayError::PeerClosed`] on clean EOF at a message
    /// boundary and [`RelayError::PeerReset`] on EOF inside a message.
    pub fn read_message(&mut self) -> Result<Message> {
        let mut first = [0u8; 1];
        loop {
            match self.reader.read_exact(&mut first) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(RelayError::PeerClosed);
                }
                Err(e) => return Err(e.into()),
            }

            match first[0] {
                // Stray CRLF between messages; some peers pad with them.
                b'\r' | b'\n' => continue,
                INTERLEAVED_SENTINEL => {
                    if !self.interleaved {
                        return Err(violation(ParseErrorKind::UnexpectedInterleaved));
                    }
                    return self.read_frame();
                }
                _ => return self.read_request(first[0]),
            }
        }
    }

    /// `$` already consumed: channel byte, big-endian length, payload.
    fn read_frame(&mut self) -> Result<Message> {
        let mut header = [0u8; 3];
        self.reader.read_exact(&mut header).map_err(reset_on_eof)?;
        let channel = header[0];
        let length = u16::from_be_bytes([header[1], header[2]]) as usize;

        let mut payload = vec![0u8; length];
        self.reader.read_exact(&mut payload).map_err(reset_on_eof)?;

        Ok(Message::Interleaved { channel, payload })
    }

    /// `first` is the already-consumed opening byte of the request line.
    fn read_request(&mut self, first: u8) -> Result<Message> {
        let mut request_line = String::new();
        request_line.push(first as char);
        let mut total = 1 + self.read_head_line(&mut request_line)?;

        let mut header_lines: Vec<String> = Vec::new();
        loop {
            let mut line = String::new();
            total += self.read_head_line(&mut line)?;
            if total > MAX_HEAD_BYTES {
                return Err(violation(ParseErrorKind::InvalidHeader));
            }
            if line == "\r\n" || line == "\n" {
                break;
            }
            header_lines.push(line);
        }

        let (method, uri, version) = parse_request_line(request_line.trim_end())?;

        let mut headers = Vec::with_capacity(header_lines.len());
        for line in &header_lines {
            let line = line.trim_end();
            let colon = line
                .find(':')
                .ok_or_else(|| violation(ParseErrorKind::InvalidHeader))?;
            let name = line[..colon].trim().to_string();
            let value = line[colon + 1..].trim().to_string();
            headers.push((name, value));
        }

        let request = RtspRequest {
            method,
            uri,
            version,
            headers,
            body: Vec::new(),
        };

        let body = match request.get_header("Content-Length") {
            Some(value) => {
                let length: usize = value
                    .trim()
                    .parse()
                    .map_err(|_| violation(ParseErrorKind::InvalidContentLength))?;
                let mut body = vec![0u8; length];
                self.reader.read_exact(&mut body).map_err(reset_on_eof)?;
                body
            }
            None => Vec::new(),
        };

        Ok(Message::Request(RtspRequest { body, ..request }))
    }

    /// One CRLF-terminated head line. EOF here is always mid-message.
    fn read_head_line(&mut self, buf: &mut String) -> Result<usize> {
        match self.reader.read_line(buf) {
            Ok(0) => Err(RelayError::PeerReset),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(violation(ParseErrorKind::InvalidHeader))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_request_line(line: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(violation(ParseErrorKind::InvalidRequestLine));
    }
    let version = parts[2];
    if version != "RTSP/1.0" {
        return Err(RelayError::UnsupportedVersion(version.to_string()));
    }
    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        version.to_string(),
    ))
}

fn violation(kind: ParseErrorKind) -> RelayError {
    RelayError::ProtocolViolation { kind }
}

fn reset_on_eof(e: io::Error) -> RelayError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RelayError::PeerReset
    } else {
        RelayError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(bytes: &[u8]) -> MessageReader<Cursor<Vec<u8>>> {
        MessageReader::new(Cursor::new(bytes.to_vec()))
    }

    fn expect_request(msg: Message) -> RtspRequest {
        match msg {
            Message::Request(req) => req,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn parse_options_request() {
        let mut r = reader(b"OPTIONS rtsp://localhost:8554/live RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        let req = expect_request(r.read_message().unwrap());
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.uri, "rtsp://localhost:8554/live");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("1"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn parse_announce_body_is_byte_identical() {
        let sdp = b"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\nm=video 0 RTP/AVP 96\r\n";
        let mut raw = format!(
            "ANNOUNCE rtsp://h/live RTSP/1.0\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n",
            sdp.len()
        )
        .into_bytes();
        raw.extend_from_slice(sdp);

        let mut r = reader(&raw);
        let req = expect_request(r.read_message().unwrap());
        assert_eq!(req.method, "ANNOUNCE");
        assert_eq!(req.body, sdp);
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let mut r = reader(b"OPTIONS rtsp://h/x RTSP/1.0\r\ncseq: 42\r\n\r\n");
        let req = expect_request(r.read_message().unwrap());
        assert_eq!(req.get_header("CSeq"), Some("42"));
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }

    #[test]
    fn session_header_strips_timeout_suffix() {
        let mut r = reader(b"PLAY rtsp://h/x RTSP/1.0\r\nCSeq: 3\r\nSession: ABC123;timeout=60\r\n\r\n");
        let req = expect_request(r.read_message().unwrap());
        assert_eq!(req.session(), Some("ABC123"));
    }

    #[test]
    fn stray_crlf_between_messages_is_skipped() {
        let mut r = reader(b"\r\n\r\nOPTIONS rtsp://h/x RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        let req = expect_request(r.read_message().unwrap());
        assert_eq!(req.method, "OPTIONS");
    }

    #[test]
    fn two_sequential_messages() {
        let mut r = reader(
            b"OPTIONS rtsp://h/x RTSP/1.0\r\nCSeq: 1\r\n\r\nTEARDOWN rtsp://h/x RTSP/1.0\r\nCSeq: 2\r\n\r\n",
        );
        let first = expect_request(r.read_message().unwrap());
        let second = expect_request(r.read_message().unwrap());
        assert_eq!(first.method, "OPTIONS");
        assert_eq!(second.method, "TEARDOWN");
    }

    #[test]
    fn interleaved_frame_when_armed() {
        let mut r = reader(&[b'$', 0x02, 0x00, 0x03, 0xAA, 0xBB, 0xCC]);
        r.set_interleaved(true);
        match r.read_message().unwrap() {
            Message::Interleaved { channel, payload } => {
                assert_eq!(channel, 2);
                assert_eq!(payload, vec![0xAA, 0xBB, 0xCC]);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn frame_between_requests() {
        let mut raw = b"OPTIONS rtsp://h/x RTSP/1.0\r\nCSeq: 1\r\n\r\n".to_vec();
        raw.extend_from_slice(&[b'$', 0x00, 0x00, 0x02, 0x01, 0x02]);
        raw.extend_from_slice(b"TEARDOWN rtsp://h/x RTSP/1.0\r\nCSeq: 2\r\n\r\n");

        let mut r = reader(&raw);
        r.set_interleaved(true);
        assert!(matches!(r.read_message().unwrap(), Message::Request(_)));
        assert!(matches!(
            r.read_message().unwrap(),
            Message::Interleaved { channel: 0, .. }
        ));
        assert!(matches!(r.read_message().unwrap(), Message::Request(_)));
    }

    #[test]
    fn sentinel_outside_interleaved_mode_is_violation() {
        let mut r = reader(&[b'$', 0x00, 0x00, 0x01, 0xFF]);
        assert!(matches!(
            r.read_message(),
            Err(RelayError::ProtocolViolation {
                kind: ParseErrorKind::UnexpectedInterleaved
            })
        ));
    }

    #[test]
    fn clean_eof_is_peer_closed() {
        let mut r = reader(b"");
        assert!(matches!(r.read_message(), Err(RelayError::PeerClosed)));
    }

    #[test]
    fn eof_mid_head_is_peer_reset() {
        let mut r = reader(b"OPTIONS rtsp://h/x RTSP/1.0\r\nCSeq:");
        assert!(matches!(r.read_message(), Err(RelayError::PeerReset)));
    }

    #[test]
    fn truncated_body_is_peer_reset() {
        let mut r = reader(b"ANNOUNCE rtsp://h/x RTSP/1.0\r\nCSeq: 1\r\nContent-Length: 10\r\n\r\nshort");
        assert!(matches!(r.read_message(), Err(RelayError::PeerReset)));
    }

    #[test]
    fn truncated_frame_is_peer_reset() {
        let mut r = reader(&[b'$', 0x00, 0x00, 0x05, 0xAA]);
        r.set_interleaved(true);
        assert!(matches!(r.read_message(), Err(RelayError::PeerReset)));
    }

    #[test]
    fn non_rtsp10_version_is_rejected() {
        let mut r = reader(b"OPTIONS rtsp://h/x RTSP/2.0\r\nCSeq: 1\r\n\r\n");
        assert!(matches!(
            r.read_message(),
            Err(RelayError::UnsupportedVersion(v)) if v == "RTSP/2.0"
        ));
    }

    #[test]
    fn malformed_request_line_is_violation() {
        let mut r = reader(b"JUST_A_METHOD\r\n\r\n");
        assert!(matches!(
            r.read_message(),
            Err(RelayError::ProtocolViolation {
                kind: ParseErrorKind::InvalidRequestLine
            })
        ));
    }

    #[test]
    fn header_without_colon_is_violation() {
        let mut r = reader(b"OPTIONS rtsp://h/x RTSP/1.0\r\nno colon here\r\n\r\n");
        assert!(matches!(
            r.read_message(),
            Err(RelayError::ProtocolViolation {
                kind: ParseErrorKind::InvalidHeader
            })
        ));
    }

    #[test]
    fn bad_content_length_is_violation() {
        let mut r = reader(b"ANNOUNCE rtsp://h/x RTSP/1.0\r\nContent-Length: many\r\n\r\n");
        assert!(matches!(
            r.read_message(),
            Err(RelayError::ProtocolViolation {
                kind: ParseErrorKind::InvalidContentLength
            })
        ));
    }
}
