//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the wire layer of the control plane — parsing
//! requests and interleaved frames off the socket and building responses.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! ANNOUNCE rtsp://server/live RTSP/1.0\r\n
//! CSeq: 1\r\n
//! Content-Length: 76\r\n
//! \r\n
//! v=0\r\n...
//! ```
//!
//! Key differences from HTTP:
//! - Stateful: sessions persist across requests (RFC 2326 §3).
//! - Binary interleaved frames may share the control socket (§10.12).
//! - Session header carries a server-assigned ID (RFC 2326 §12.37).
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | ANNOUNCE | §10.3 | Publish an SDP under a mount path |
//! | DESCRIBE | §10.2 | Retrieve a mounted stream's SDP |
//! | SETUP | §10.4 | Negotiate transport (UDP ports or channels) |
//! | RECORD | §10.11 | Start ingesting media from the source |
//! | PLAY | §10.5 | Start media delivery to a client |
//! | PAUSE | §10.6 | Suspend media delivery |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER / SET_PARAMETER | §10.8–9 | Keepalive |

pub mod request;
pub mod response;

pub use request::{Message, MessageReader, RtspRequest, INTERLEAVED_SENTINEL};
pub use response::RtspResponse;
