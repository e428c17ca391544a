//! Freebox content relay
//!
//! The HTTP request/response primitive shared by the plugin host and by
//! guest scripts. A request is described by [`RelayRequest`] (the option
//! object guest scripts pass to `http()`), executed against a shared base
//! client, and answered with a [`RelayResponse`] whose body is exposed
//! according to the request's buffering mode.
//!
//! Failures never escape [`Relay::fetch`]: they degrade to
//! [`RelayResponse::empty`].

pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod request;
pub mod response;

pub use client::Relay;
pub use config::RelayConfig;
pub use error::RelayError;
pub use pool::CallbackPool;
pub use request::{BufferMode, PostType, RelayRequest, RequestBody};
pub use response::{Content, RelayResponse};
