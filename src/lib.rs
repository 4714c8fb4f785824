//! nftkit - nftables rule compiler and object registry
//!
//! Describes firewall rules declaratively, compiles them into the instruction
//! sequences the kernel evaluates, and keeps tables, chains, rules and sets in
//! step with a transport that talks to the packet filter.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, compiler, ordering list and object registry
//! - [`validators`] - Input validation for names, interfaces and values
//! - [`config`] - Registry and compiler settings
//!
//! # Example
//!
//! ```
//! use nftkit::{MemoryTransport, Nftables};
//! use nftkit::core::rule::{L3, Rule};
//! use nftkit::core::types::{
//!     AddrSpec, ChainAttributes, ChainPriority, ChainType, Hook, TableFamily, Verdict,
//! };
//! use std::sync::Arc;
//!
//! let nft = Nftables::new(Arc::new(MemoryTransport::new()));
//! let table = nft.create_table_imm("filter", TableFamily::Ipv4).unwrap();
//! let chain = table
//!     .create_chain_imm(
//!         "input",
//!         ChainAttributes::base(Hook::Input, ChainType::Filter, ChainPriority::FILTER),
//!     )
//!     .unwrap();
//! let rule = Rule::new()
//!     .with_l3(L3::destination(AddrSpec::single("192.0.2.1".parse().unwrap())))
//!     .with_verdict(Verdict::Drop);
//! let id = chain.create_rule_imm(&rule).unwrap();
//! assert_eq!(chain.rule(id).unwrap().exprs.len(), 3);
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod validators;

// Re-export commonly used types
pub use config::Config;
pub use core::error::{Error, Result, TransportError, ValidationError};
pub use core::memory::MemoryTransport;
pub use core::registry::{Chain, Nftables, SetRegistry, SyncReport, Table};
pub use core::rule::Rule;
pub use core::rule_list::RuleId;
pub use core::transport::Transport;
