//! Relay engine
//!
//! This module maps inbound requests onto the upstream, sends them through
//! a SOCKS5 tunnel and writes the answers back, buffered or streamed.

pub mod relay;
pub mod request_id;
pub mod translate;
pub mod upstream;

pub use relay::{Relay, RelayOutcome};
pub use request_id::RequestId;
pub use translate::{translate, wants_streaming, InboundRequest, OutboundRequest};
pub use upstream::{ChunkMode, ChunkStream, RelayResult, UpstreamClient};
