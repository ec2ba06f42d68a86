//! atomsync Client - talking to the remote source of truth
//!
//! This crate defines the JSON wire formats (inbound notifications and the
//! responses of the index/mjolnir endpoints), the [`RemoteApi`] seam the
//! engine fetches through, and [`HttpRemote`], its reqwest implementation.

pub mod error;
pub mod http;
pub mod remote;
pub mod wire;

pub use error::{ClientError, ClientResult};
pub use http::HttpRemote;
pub use remote::{IndexFetch, RemoteApi};
pub use wire::*;
