//! Socket transports: the TCP control plane and the UDP data plane.

pub mod tcp;
pub mod udp;
