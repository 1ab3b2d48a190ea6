pub mod classify;
pub mod client;
pub mod error;
pub mod pipeline;
pub mod response;
pub mod sign;
pub mod state;
pub mod users;

pub use classify::{UpstreamAction, classify_upstream};
pub use client::{
    TransportError, UpstreamBody, UpstreamClient, UpstreamClientConfig, UpstreamRequest,
    UpstreamResponse, WreqUpstreamClient,
};
pub use error::{ErrorKind, ProxyError};
pub use pipeline::{MAX_RETRIES, handle_chat};
pub use response::{ProxyResponse, StreamBody};
pub use state::AppState;
pub use users::{NoopUserStore, UserStore};
