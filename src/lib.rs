//! fixgate library crate
//!
//! Exposes the gate's modules so integration tests and external tooling can
//! drive cycles without going through CLI startup.

pub mod action;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod fingerprint;
pub mod ledger;
pub mod ops;
pub mod policy;
pub mod project;
pub mod safety;
pub mod store;
pub mod util;
