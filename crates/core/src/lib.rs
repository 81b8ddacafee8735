//! # rtsp-relay — RTSP server for relaying live media streams
//!
//! An RTSP server that accepts live publishers ("sources") and fans their
//! RTP/RTCP streams out to pull clients subscribed to the same mount
//! point. Media is relayed byte-for-byte; the server never inspects or
//! rewrites RTP payloads.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request parsing, session lifecycle, transport negotiation, interleaved framing (§10.12) |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP | Even/odd RTP/RTCP port-pair convention |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Passed through verbatim; only `m=` sections are counted |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Server        — listen socket, port allocator │
//! │  MountRegistry — path → published stream       │
//! ├───────────────────────────────────────────────┤
//! │  Protocol      — request/frame parser, responses│
//! │  Session       — roles, states, Transport header│
//! ├───────────────────────────────────────────────┤
//! │  Transport/tcp — per-connection state machine  │
//! │  Transport/udp — RTP listeners, subscriber fan-out│
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Data flow: source TCP → RTSP parser → state machine → mount creation →
//! RTP ingress (UDP listener or interleaved frames) → per-stream broadcast
//! → subscribed client egress (UDP datagram or interleaved TCP frame).
//!
//! ## Quick start
//!
//! ```no_run
//! use rtsp_relay::{Config, Server};
//!
//! let mut server = Server::new(Config::default());
//! server.start().unwrap();
//! // Sources ANNOUNCE+RECORD, clients DESCRIBE+PLAY against mount paths.
//! ```
//!
//! ## Crate layout
//!
//! - [`server`] — [`Server`] orchestrator, [`PortAllocator`](server::PortAllocator), shared [`ServerContext`](server::ServerContext).
//! - [`mount`] — [`Mount`], [`Stream`](mount::Stream), subscribers, [`MountRegistry`].
//! - [`protocol`] — RTSP request/frame parsing and response building.
//! - [`session`] — connection roles and states, session IDs, `Transport` header.
//! - [`transport`] — TCP control-plane loop, UDP RTP listeners and broadcast.
//! - [`config`] — JSON [`Config`] with defaults.
//! - [`error`] — [`RelayError`] enum and [`Result`] alias.

pub mod config;
pub mod error;
pub mod mount;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{RelayError, Result};
pub use mount::{Mount, MountRegistry};
pub use server::Server;
