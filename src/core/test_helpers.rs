//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::memory::MemoryTransport;
use crate::core::registry::{Chain, Nftables, Table};
use crate::core::rule::{L3, L4, Rule};
use crate::core::types::{
    AddrSpec, Address, ChainAttributes, ChainPriority, ChainType, Hook, L4Proto, PortSpec,
    TableFamily, Verdict,
};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Routes `tracing` output through the test harness.
///
/// Filtered by `RUST_LOG`; silent unless it is set. Safe to call from every test.
pub fn init_test_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Registry over a fresh in-memory transport
pub fn memory_registry() -> (Arc<MemoryTransport>, Nftables) {
    init_test_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let nft = Nftables::new(transport.clone());
    (transport, nft)
}

/// Committed table with one committed `filter` base chain on the given hook
pub fn filter_chain(nft: &Nftables, family: TableFamily, hook: Hook) -> (Arc<Table>, Arc<Chain>) {
    let table = nft.create_table_imm("filter", family).unwrap();
    let chain = table
        .create_chain_imm(
            &hook.to_string(),
            ChainAttributes::base(hook, ChainType::Filter, ChainPriority::FILTER),
        )
        .unwrap();
    (table, chain)
}

pub fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

/// Rule matching one destination address with the given verdict
pub fn dst_rule(dst: &str, verdict: Verdict) -> Rule {
    Rule::new()
        .with_l3(L3::destination(AddrSpec::single(addr(dst))))
        .with_verdict(verdict)
}

/// Rule accepting TCP traffic to the given ports
pub fn tcp_ports_rule(ports: &[u16]) -> Rule {
    let spec = match ports {
        [port] => PortSpec::single(*port),
        _ => PortSpec::list(ports.to_vec()),
    };
    Rule::new()
        .with_l4(L4::new(L4Proto::Tcp).with_dst(spec))
        .with_verdict(Verdict::Accept)
}
