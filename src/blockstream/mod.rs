//! Head-info and live block stream over HTTP.

pub mod api;
pub mod client;
pub mod server;

pub use client::{BlockStreamClient, ClientError};
pub use server::{BlockStreamServer, ServerError, ServerState, SubscribeError, Subscription};
