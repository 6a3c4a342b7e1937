//! HTTP protocol implementation.
//!
//! This module implements the HTTP/1.1 front-end clients talk to, plus the
//! pieces of the protocol the relay needs to read upstream responses.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: The main connection handler implementing the request-response state machine
//! - **`headers`**: Ordered, case-preserving header storage
//! - **`parser`**: Parses incoming requests and upstream response heads from byte buffers
//! - **`chunked`**: Incremental decoder for the chunked transfer coding
//! - **`request`**: HTTP request representation and parsing utilities
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: Serializes buffered responses and frames streamed ones
//!
//! # Connection State Machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Relay upstream, write the answer
//!        └──────┬───────────┘
//!               │ Relay finished
//!               ├─ Completed + Keep-Alive → Reading (same connection)
//!               └─ Aborted / client gone / Close → Closed
//!
//!   Malformed request → Writing (400 or 413) → Closed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tunnel_relay::http::connection::Connection;
//! use tokio::net::TcpListener;
//!
//! let (socket, peer) = listener.accept().await?;
//! let relay = Arc::clone(&relay);
//! tokio::spawn(async move {
//!     let mut conn = Connection::new(socket, peer, relay);
//!     if let Err(e) = conn.run().await {
//!         tracing::warn!("Connection error: {}", e);
//!     }
//! });
//! ```

pub mod chunked;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
