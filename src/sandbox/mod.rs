//! Sandbox chain and sessions
//!
//! An in-memory stand-in for the collateral token, bonded token and market
//! maker contracts, so conversions can be quoted and executed end to end
//! without a node. Each HTTP session gets its own chain.

pub mod chain;
pub mod session;

pub use chain::{named_address, Deployment, MarketSetup, SandboxChain, SandboxSigner};
pub use session::{ConversionSession, MarketSnapshot, SessionError, SessionManager};
