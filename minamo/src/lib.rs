//! Minamo is a session-oriented proxy runtime: a SOCKS5 protocol engine
//! plus a NAT-like UDP relay that multiplexes client flows onto per-session
//! upstream sockets.

pub mod config;
pub mod net;
pub mod relay;
pub mod router;
pub mod stats;
