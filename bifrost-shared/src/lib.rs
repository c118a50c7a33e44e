//! Shared library for Bifrost — protocol definitions, codec, and the
//! timeout/threshold constants every other crate in the workspace builds on.

#![forbid(unsafe_code)]

pub mod api_key;
pub mod codec;
pub mod protocol;
pub mod request_id;
pub mod timeouts;

pub use api_key::{ApiKeyResolver, BackendIdentity, StaticApiKeyResolver};
pub use codec::Delimited;
pub use protocol::{ClientMessage, ServerMessage, CONTROL_PORT, MAX_LINE_LENGTH};
pub use request_id::RequestId;
pub use timeouts::NETWORK_TIMEOUT;
