//! Asynchronous Dubbo RPC client over persistent multiplexed TCP.
//!
//! Requests on a connection are correlated by a client-wide sequence
//! number carried in a fixed 16-byte big-endian header, so many calls
//! share one socket and responses may complete out of order. Response
//! bodies stream into a shared compacting arena as they arrive, which
//! keeps partially-received frames from fragmenting memory under load.
//!
//! # Architecture
//!
//! - [`protocol`] - header layout and frame construction
//! - [`connection`] - one task per provider endpoint: connect, frame
//!   reassembly, FIFO writes, reconnect and eviction
//! - [`arena`] - compacting buffer for in-flight response bodies
//! - [`registry`] - pending-request table and sequence allocation
//! - [`codec`] - invocation encoding and response-value decoding
//! - [`discovery`] - provider URLs, snapshots, and the path cache
//! - [`strategy`] - endpoint selection policies
//! - [`client`] - the orchestrating [`DubboClient`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dubbo_client::{Argument, DiscoveryCache, DubboClient};
//!
//! # async fn run() -> dubbo_client::Result<()> {
//! let cache = Arc::new(DiscoveryCache::new());
//! cache.update_children(
//!     "/dubbo/com.acme.CalcService/providers",
//!     &["dubbo%3A%2F%2F10.0.0.1%3A20880%2Fcom.acme.CalcService%3Fmethods%3Dadd%26version%3D1.0.0".to_string()],
//! );
//!
//! let client = DubboClient::builder().discovery(cache).build()?;
//! let sum = client
//!     .invoke(
//!         "com.acme.CalcService",
//!         "1.0.0",
//!         "add",
//!         vec![Argument::int(2), Argument::int(3)],
//!     )
//!     .await?;
//! println!("sum = {sum}");
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod strategy;

pub use client::{DubboClient, DubboClientBuilder, DEFAULT_DUBBO_VERSION};
pub use codec::{Argument, BodyCodec, Invocation, MsgPackBodyCodec};
pub use config::{ClientConfig, DiscoveryConfig};
pub use discovery::{
    parse_provider_url, DiscoveryCache, ProviderDiscovery, ProviderSnapshot, ServiceEndpoint,
};
pub use error::{DubboError, Result};
pub use strategy::{RoundRobin, SelectionStrategy, StrategyFactory};
