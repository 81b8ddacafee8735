//! RTSP session identity and connection state (RFC 2326 §3, §12.37).
//!
//! A connection starts role-agnostic and is promoted by its first
//! role-specific method: ANNOUNCE makes it a source, DESCRIBE or a
//! subscribing SETUP makes it a client. The session ID is assigned on
//! the first successful SETUP and echoed in every later response.
//!
//! ## Lifecycle
//!
//! ```text
//! Source: ANNOUNCE -> SETUP (Ready) -> RECORD (Recording) -> TEARDOWN
//! Client: DESCRIBE -> SETUP (Ready) -> PLAY (Playing) <-> PAUSE -> TEARDOWN
//! TCP disconnect at any point runs the same cleanup as TEARDOWN.
//! ```

pub mod transport;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distr::{Alphanumeric, SampleString};

pub use transport::{TransportHeader, TransportSpec};

/// What kind of peer this connection turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No role-specific method seen yet.
    Unknown,
    /// Publisher: ANNOUNCE + SETUP + RECORD.
    Source,
    /// Subscriber: DESCRIBE + SETUP + PLAY.
    Client,
}

/// Per-connection protocol state. Transitions are monotonic except for
/// the Playing <-> Ready swing driven by PLAY and PAUSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Before any successful SETUP.
    Init,
    /// Transport negotiated, media not flowing.
    Ready,
    /// Client receiving media.
    Playing,
    /// Source ingesting media.
    Recording,
}

impl ConnState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Ready => "Ready",
            Self::Playing => "Playing",
            Self::Recording => "Recording",
        }
    }
}

/// Length of generated session IDs. RFC 2326 §3.4 requires at least 8
/// octets of randomness; 16 alphanumeric characters comfortably clear it.
const SESSION_ID_LEN: usize = 16;

/// Issues session IDs that are unique for the server's lifetime.
///
/// IDs are opaque URL-safe strings; the issued set is retained so a
/// collision can never hand two connections the same session.
#[derive(Clone)]
pub struct SessionIdGen {
    issued: Arc<Mutex<HashSet<String>>>,
}

impl SessionIdGen {
    pub fn new() -> Self {
        Self {
            issued: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Generate a fresh session ID.
    pub fn next(&self) -> String {
        let mut issued = self.issued.lock();
        loop {
            let id = Alphanumeric.sample_string(&mut rand::rng(), SESSION_ID_LEN);
            if issued.insert(id.clone()) {
                return id;
            }
        }
    }
}

impl Default for SessionIdGen {
    fn default() -> Self {
        Self::new()
    }
}
