//! Bonded Converter Backend
//!
//! Conversion engine for a bonding-curve market maker: curve price quotes with
//! entry/exit tribute and slippage, and the sequenced approval/order
//! transaction plan that executes a conversion.

pub mod api;
pub mod config;
pub mod engine;
pub mod sandbox;
pub mod types;
