//! Integration tests for nftkit
//!
//! These tests drive the public API end to end against the in-memory
//! transport: building a ruleset, tearing it down, replacing objects, named
//! sets, reading state back and concurrent rule insertion.
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use nftkit::core::expr::{CmpOp, Expr, PayloadBase};
use nftkit::core::memory::OpKind;
use nftkit::core::rule::{L3, L4, Nat, Rule};
use nftkit::core::set::{SetAttributes, SetElement, SetKeyType};
use nftkit::core::types::{
    AddrSpec, Address, ChainAttributes, ChainPriority, ChainType, Hook, L4Proto, PortSpec,
    TableFamily, Verdict,
};
use nftkit::{Error, MemoryTransport, Nftables, RuleId, Transport};
use std::sync::Arc;

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

fn registry() -> (Arc<MemoryTransport>, Nftables) {
    let transport = Arc::new(MemoryTransport::new());
    let nft = Nftables::new(transport.clone());
    (transport, nft)
}

#[test]
fn test_drop_single_destination() {
    let (transport, nft) = registry();
    let table = nft.create_table_imm("T", TableFamily::Ipv4).unwrap();
    let chain = table
        .create_chain_imm(
            "input",
            ChainAttributes::base(Hook::Input, ChainType::Filter, ChainPriority::FIRST),
        )
        .unwrap();
    let rule = Rule::new()
        .with_l3(L3::destination(AddrSpec::single(addr("1.1.1.2"))))
        .with_verdict(Verdict::Drop);
    let id = chain.create_rule_imm(&rule).unwrap();
    assert_eq!(id, RuleId(10));

    let rules = transport.list_rules(table.record(), "input").unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(
        rules[0].exprs,
        vec![
            Expr::Payload {
                dreg: 1,
                base: PayloadBase::Network,
                offset: 16,
                len: 4,
            },
            Expr::Cmp {
                sreg: 1,
                op: CmpOp::Eq,
                data: vec![1, 1, 1, 2],
            },
            Expr::Verdict(Verdict::Drop),
        ]
    );

    let chains = transport.list_chains(table.record()).unwrap();
    assert_eq!(chains[0].attrs.priority, Some(ChainPriority::FIRST));
}

#[test]
fn test_teardown_issues_one_delete_per_object() {
    let (transport, nft) = registry();
    let table = nft.create_table_imm("T", TableFamily::Ipv4).unwrap();
    let chain = table
        .create_chain_imm(
            "input",
            ChainAttributes::base(Hook::Input, ChainType::Filter, ChainPriority::FILTER),
        )
        .unwrap();
    let id = chain
        .create_rule_imm(
            &Rule::new()
                .with_l3(L3::destination(AddrSpec::single(addr("1.1.1.2"))))
                .with_verdict(Verdict::Drop),
        )
        .unwrap();
    transport.reset_counters();

    chain.delete_rule_imm(id).unwrap();
    table.delete_chain_imm("input").unwrap();
    nft.delete_table_imm("T", TableFamily::Ipv4).unwrap();

    assert_eq!(
        transport.history(),
        vec![
            OpKind::DelRule,
            OpKind::Flush,
            OpKind::DelChain,
            OpKind::Flush,
            OpKind::DelTable,
            OpKind::Flush
        ]
    );
    assert_eq!(transport.table_count(), 0);
    assert!(nft.tables(None).is_empty());
    assert!(nft.families().is_empty());
}

#[test]
fn test_replace_table_drops_old_contents() {
    let (transport, nft) = registry();
    let table = nft.create_table_imm("nat", TableFamily::Ipv4).unwrap();
    let chain = table
        .create_chain_imm(
            "postrouting",
            ChainAttributes::base(Hook::Postrouting, ChainType::Nat, ChainPriority::SRCNAT),
        )
        .unwrap();
    chain
        .create_rule_imm(&Rule::new().with_l3(L3::source(AddrSpec::single(addr("10.0.0.0/8")))).with_nat(Nat::masquerade()))
        .unwrap();

    let replacement = nft.create_table_imm("nat", TableFamily::Ipv4).unwrap();
    assert!(replacement.chains().is_empty());
    assert_eq!(nft.tables(Some(TableFamily::Ipv4)).len(), 1);
    assert!(transport.list_chains(replacement.record()).unwrap().is_empty());
    assert_eq!(transport.calls(OpKind::DelTable), 1);
}

#[test]
fn test_named_set_lifecycle() {
    let (transport, nft) = registry();
    let table = nft.table("filter", TableFamily::Ipv4).unwrap();
    let sets = table.sets();

    sets.create_interval_set(
        SetAttributes::new("bogons", SetKeyType::Ipv4Addr),
        &[addr("10.0.0.0/8"), addr("192.168.0.0/16"), addr("172.16.0.0/12")],
    )
    .unwrap();
    sets.create_set(
        SetAttributes::new("admins", SetKeyType::Ipv4Addr),
        &[SetElement::address(&addr("192.0.2.10"))],
    )
    .unwrap();
    sets.add_set_elements("admins", &[SetElement::address(&addr("192.0.2.11"))])
        .unwrap();
    assert_eq!(sets.get_set_elements("admins").unwrap().len(), 2);

    let chain = table.create_chain_imm("input", ChainAttributes::default()).unwrap();
    let rule = Rule::new()
        .with_l3(L3::source(AddrSpec::list(vec![
            addr("192.0.2.10"),
            addr("192.0.2.11"),
        ])))
        .with_l4(L4::new(L4Proto::Tcp).with_dst(PortSpec::single(22)))
        .with_verdict(Verdict::Accept);
    chain.create_rule_imm(&rule).unwrap();

    let names: Vec<String> = sets.get_sets().unwrap().iter().map(|s| s.name().to_string()).collect();
    assert_eq!(names, vec!["admins".to_string(), "bogons".to_string()]);
    // One more set on the transport: the one generated for the rule
    assert_eq!(transport.list_sets(table.record()).unwrap().len(), 3);

    sets.del_set("bogons").unwrap();
    assert!(!sets.exist_set("bogons"));
    assert!(sets.del_set("bogons").unwrap_err().is_not_found());
}

#[test]
fn test_sync_into_fresh_registry() {
    let (transport, nft) = registry();
    let table = nft.create_table_imm("filter", TableFamily::Inet).unwrap();
    let chain = table
        .create_chain_imm(
            "input",
            ChainAttributes::base(Hook::Input, ChainType::Filter, ChainPriority::FILTER),
        )
        .unwrap();
    let first = chain
        .create_rule_imm(
            &Rule::new()
                .with_l4(L4::new(L4Proto::Tcp).with_dst(PortSpec::list(vec![80, 443])))
                .with_verdict(Verdict::Accept),
        )
        .unwrap();
    chain
        .insert_rule_before_imm(
            first,
            &Rule::new()
                .with_l3(L3::source(AddrSpec::single(addr("2001:db8::/32"))))
                .with_verdict(Verdict::Drop),
        )
        .unwrap();

    let restored = Nftables::new(transport.clone());
    let report = restored.sync(Some(TableFamily::Inet)).unwrap();
    assert_eq!((report.tables, report.chains, report.rules), (1, 1, 2));

    let chain = restored
        .get_table("filter", TableFamily::Inet)
        .unwrap()
        .chain("input")
        .unwrap();
    let ids: Vec<_> = chain.rules().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![RuleId(20), RuleId(10)]);

    // The restored rule still owns its generated set
    chain.delete_rule_imm(RuleId(10)).unwrap();
    let table = restored.get_table("filter", TableFamily::Inet).unwrap();
    assert!(transport.list_sets(table.record()).unwrap().is_empty());
}

#[test]
fn test_concurrent_appends_keep_transport_order() {
    let (transport, nft) = registry();
    let table = nft.create_table_imm("filter", TableFamily::Ipv4).unwrap();
    let chain = table
        .create_chain_imm(
            "forward",
            ChainAttributes::base(Hook::Forward, ChainType::Filter, ChainPriority::FILTER),
        )
        .unwrap();

    std::thread::scope(|s| {
        for worker in 0..4u8 {
            let chain = Arc::clone(&chain);
            s.spawn(move || {
                for i in 0..25u8 {
                    let rule = Rule::new()
                        .with_l3(L3::destination(AddrSpec::single(addr(&format!(
                            "10.{}.0.{}",
                            worker, i
                        )))))
                        .with_verdict(Verdict::Accept);
                    chain.create_rule(&rule).unwrap();
                }
            });
        }
    });
    nft.flush().unwrap();

    let local: Vec<_> = chain.rules().iter().map(|r| r.id).collect();
    let remote: Vec<_> = transport
        .list_rules(table.record(), "forward")
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(local.len(), 100);
    assert_eq!(local, remote);

    let mut sorted = local.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 100);
}

#[test]
fn test_flush_ruleset_resets_everything() {
    let (transport, nft) = registry();
    nft.create_table_imm("a", TableFamily::Ipv4).unwrap();
    nft.create_table_imm("b", TableFamily::Ipv6).unwrap();
    nft.create_table("c", TableFamily::Inet).unwrap();

    nft.flush_ruleset().unwrap();
    assert!(nft.tables(None).is_empty());
    assert_eq!(transport.staged_len(), 0);
    assert_eq!(nft.dump().unwrap()["nftables"].as_array().unwrap().len(), 0);
}

#[test]
fn test_validation_errors_surface_unchanged() {
    let (transport, nft) = registry();
    let table = nft.create_table_imm("filter", TableFamily::Ipv4).unwrap();
    let chain = table.create_chain_imm("input", ChainAttributes::default()).unwrap();
    transport.reset_counters();

    let err = chain.create_rule(&Rule::new()).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = chain
        .create_rule(
            &Rule::new()
                .with_l4(L4::new(L4Proto::Icmp).with_dst(PortSpec::single(1)))
                .with_verdict(Verdict::Accept),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(transport.total_calls(), 0);
}
