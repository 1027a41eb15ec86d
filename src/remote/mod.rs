//! Remote access for paginated reads and row mutations.
//!
//! `RemoteClient` is the seam the cache coordinator talks through; the
//! HTTP implementation and its wire types live alongside it so fakes in
//! tests only need the trait.

pub mod client;
pub mod http;
pub mod wire;

pub use client::{MutationRequest, RemoteClient};
pub use http::HttpRemoteClient;
