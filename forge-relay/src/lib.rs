//! # forge-relay
//!
//! Captures short-lived Forge bearer credentials from an embedding host app
//! and relays user actions (Jira comments) downstream with the most recently
//! captured one.
//!
//! ## Features
//!
//! - **Capture**: `GET /forge-token` and `GET /forge-token-2` record the
//!   request's bearer credential, the latter together with the routing
//!   claims decoded from it
//! - **Relay**: `POST /forge-comment` and `POST /forge-direct-comment` post a
//!   comment using the latest credential on a channel
//! - **Always 200**: failures are reported in the response body, never as an
//!   HTTP status
//! - **Pluggable Storage**: the [`CredentialLedger`] trait, with an in-memory
//!   implementation included
//!
//! Routing claims are decoded, never verified. See [`RoutingPolicy`] for how
//! much the relay trusts them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use forge_relay::{MemoryLedger, RelayConfig, RelayServer};
//! use std::sync::Arc;
//!
//! # async fn example() -> forge_relay::Result<()> {
//! let config = RelayConfig::from_env()?;
//! let server = RelayServer::builder()
//!     .config(config)
//!     .ledger(Arc::new(MemoryLedger::new()))
//!     .build()?;
//!
//! let app = server.router();
//! # Ok(())
//! # }
//! ```

pub mod claims;
pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod store;

pub use claims::{RoutingMetadata, decode_routing_claims};
pub use config::{RelayConfig, RoutingPolicy};
pub use error::{Error, Result};
pub use relay::{CommentRequest, RelayClient, RelayError, RelayOutcome};
pub use server::{RelayResponse, RelayServer, RelayServerBuilder, RelayTarget};
pub use store::{
    Channel, CredentialLedger, CredentialRecord, LedgerClock, MemoryLedger, NewCredential,
};
