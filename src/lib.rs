//! Tunnel Relay - HTTP forwarding proxy over SOCKS5
//!
//! Core library for the inbound HTTP front-end, the SOCKS5 tunnel dialer
//! and the relay engine between them.

pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod server;
pub mod tunnel;
