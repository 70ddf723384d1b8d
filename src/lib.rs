//! # Provider Agent
//!
//! A provider in a decentralized compute marketplace: answers demands with
//! signed offers and correlates settlement results back to them.
//!
//! ## Architecture
//!
//! - **Encoding**: packed, versioned field order hashed with keccak-256
//! - **Signer**: EIP-191 personal-message signatures with the agent key
//! - **Offer Builder**: demand + chain height + account nonce -> signed offer
//! - **Tracker**: PENDING -> ACTIVE -> COMPLETED | EXPIRED, with mismatch anomalies
//! - **Agent**: routes the demand and settlement channels, runs the expiry sweep
//! - **Transport**: Kubo pubsub over HTTP, JSON-RPC chain reads via alloy

pub mod agent;
pub mod chain;
pub mod config;
pub mod encoding;
pub mod error;
pub mod logging;
pub mod model;
pub mod offer;
pub mod pubsub;
pub mod signer;
pub mod tracker;

pub use agent::{ProviderAgent, SettlementOutcome};
pub use chain::{ChainClient, RpcChainClient};
pub use config::AgentConfig;
pub use encoding::{FieldOrder, OfferField};
pub use error::{NegotiationError, Result};
pub use model::{Demand, Offer, OfferTerms, SettlementMessage};
pub use offer::{OfferBuilder, DEFAULT_DEADLINE_HORIZON};
pub use pubsub::{IpfsPubSub, MemoryPubSub, PubSub, PubSubMessage};
pub use signer::OfferSigner;
pub use tracker::{Correlation, CorrelationTracker, NegotiationStatus};
