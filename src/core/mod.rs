//! Core rule compilation and object management
//!
//! This module contains the types and logic for describing nftables rules and
//! keeping them in sync with the packet filter.
//! It provides:
//!
//! - [`types`] and [`rule`]: Declarative descriptions of matches, actions and chains
//! - [`rule_constraints`]: Business rules for valid field combinations
//! - [`compiler`]: Translation of rules into nftables instructions
//! - [`interval`]: Prefix collapsing and interval set elements
//! - [`rule_list`]: Per-chain rule ordering with stable identifiers
//! - [`registry`]: Tables, chains, rules and sets backed by a [`transport`]
//! - [`memory`]: Recording in-memory transport
//! - [`error`]: Error types for all of the above

pub mod compiler;
pub mod error;
pub mod expr;
pub mod interval;
pub mod memory;
pub mod registry;
pub mod rule;
pub mod rule_constraints;
pub mod rule_list;
pub mod set;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod test_helpers;
