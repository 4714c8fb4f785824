//! Rule compiler
//!
//! Turns a declarative [`Rule`] into the instruction sequence the packet
//! filter evaluates. Compilation is pure: it reads the rule and the table
//! family and returns instructions plus the anonymous sets those instructions
//! look up. Nothing is registered anywhere; the caller names the sets and
//! binds them with [`CompiledRule::bind_sets`] before handing the rule to a
//! transport.
//!
//! Emission order is fixed:
//!
//! 1. `meta nfproto` guard (inet tables only)
//! 2. layer 2 interface matches
//! 3. layer 3 version, protocol, source, destination
//! 4. layer 4 protocol and ports
//! 5. concatenated key lookup
//! 6. dynamic set update, counter, log
//! 7. redirect, NAT or match-action
//! 8. verdict, unless an earlier instruction already ends the rule

mod action;
mod match_expr;

use crate::core::error::{Error, ObjectKind, Result, ValidationError};
use crate::core::expr::{Expr, SetHandle};
use crate::core::rule::Rule;
use crate::core::rule_constraints::{resolve_ip_version, validate_rule};
use crate::core::set::{SetAttributes, SetElement, SetKeyType, SetRecord};
use crate::core::types::{IpVersion, TableFamily};
use tracing::trace;

/// Knobs that change the emitted instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Prefix IP matches in `inet` tables with a `meta nfproto` compare
    pub inet_family_guard: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            inet_family_guard: true,
        }
    }
}

/// Set generated while compiling. It has no name until the caller assigns one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymousSet {
    pub key: SetKeyType,
    pub data: Option<SetKeyType>,
    pub interval: bool,
    pub elements: Vec<SetElement>,
}

impl AnonymousSet {
    /// Attributes of the set once named
    pub fn attributes(&self, name: impl Into<String>) -> SetAttributes {
        let mut attrs = SetAttributes::new(name, self.key.clone()).constant();
        attrs.anonymous = true;
        attrs.interval = self.interval;
        attrs.data.clone_from(&self.data);
        attrs
    }
}

/// Output of [`compile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub exprs: Vec<Expr>,
    /// Sets referenced as `SetHandle::Anonymous(index)`
    pub sets: Vec<AnonymousSet>,
}

impl CompiledRule {
    /// Replaces every anonymous set handle with the handle of its registered set.
    ///
    /// `records[i]` must be the registered form of `self.sets[i]`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if an instruction refers to a set index with no record.
    pub fn bind_sets(&mut self, records: &[SetRecord]) -> Result<()> {
        for expr in &mut self.exprs {
            if let Some(handle) = expr.set_handle_mut()
                && let SetHandle::Anonymous(index) = *handle
            {
                let record = records
                    .get(index)
                    .ok_or_else(|| Error::not_found(ObjectKind::Set, format!("anonymous set {index}")))?;
                *handle = record.handle();
            }
        }
        Ok(())
    }

    /// Returns `true` if the last instruction ends evaluation of the rule.
    pub fn is_terminal(&self) -> bool {
        self.exprs.last().is_some_and(Expr::is_terminal)
    }
}

/// Compiles a rule for a table of the given family.
///
/// # Errors
///
/// Returns `Err` if the rule fails validation for `family`.
///
/// # Examples
///
/// ```
/// use nftkit::core::compiler::{CompileOptions, compile};
/// use nftkit::core::rule::{L3, Rule};
/// use nftkit::core::types::{AddrSpec, TableFamily, Verdict};
///
/// let rule = Rule::new()
///     .with_l3(L3::destination(AddrSpec::single("1.1.1.2".parse().unwrap())))
///     .with_verdict(Verdict::Drop);
/// let compiled = compile(&rule, TableFamily::Ipv4, &CompileOptions::default()).unwrap();
/// assert_eq!(compiled.exprs.len(), 3);
/// assert!(compiled.is_terminal());
/// ```
pub fn compile(
    rule: &Rule,
    family: TableFamily,
    options: &CompileOptions,
) -> std::result::Result<CompiledRule, ValidationError> {
    validate_rule(rule, family)?;
    let version = resolve_ip_version(rule, family)?;

    let mut compiler = Compiler {
        family,
        version,
        exprs: Vec::new(),
        sets: Vec::new(),
    };

    if family == TableFamily::Inet
        && options.inet_family_guard
        && let Some(version) = version
    {
        compiler.nfproto_guard(version);
    }

    if let Some(l2) = &rule.l2 {
        compiler.l2(l2);
    }
    if let Some(l3) = &rule.l3 {
        compiler.l3(l3)?;
    }
    if let Some(l4) = &rule.l4 {
        compiler.l4(l4);
    }
    if let Some(concat) = &rule.concat {
        compiler.concat(concat)?;
    }

    if let Some(dynamic_set) = &rule.dynamic_set {
        compiler.dynamic_set(dynamic_set)?;
    }
    if rule.counter {
        compiler.exprs.push(Expr::Counter);
    }
    if let Some(log) = &rule.log {
        compiler.exprs.push(Expr::Log {
            prefix: log.prefix.clone(),
            level: log.level,
        });
    }

    if let Some(redirect) = &rule.redirect {
        compiler.redirect(redirect);
    }
    if let Some(nat) = &rule.nat {
        compiler.nat(nat);
    }
    if let Some(match_action) = &rule.match_action {
        compiler.match_action(match_action)?;
    }

    let terminated = compiler.exprs.last().is_some_and(Expr::is_terminal);
    if let Some(verdict) = &rule.verdict
        && !terminated
    {
        compiler.exprs.push(Expr::Verdict(verdict.clone()));
    }

    trace!(
        %family,
        exprs = compiler.exprs.len(),
        sets = compiler.sets.len(),
        "Rule compiled"
    );

    Ok(CompiledRule {
        exprs: compiler.exprs,
        sets: compiler.sets,
    })
}

/// Instruction buffer for one rule
struct Compiler {
    family: TableFamily,
    version: Option<IpVersion>,
    exprs: Vec<Expr>,
    sets: Vec<AnonymousSet>,
}

impl Compiler {
    /// IP version of the rule. Layers that need it are only reached once
    /// [`resolve_ip_version`] has found one.
    fn ip_version(&self) -> std::result::Result<IpVersion, ValidationError> {
        self.version
            .ok_or(ValidationError::UnknownIpVersion(self.family))
    }

    /// Adds an anonymous set and returns the handle instructions use for it.
    fn push_set(&mut self, set: AnonymousSet) -> SetHandle {
        self.sets.push(set);
        SetHandle::Anonymous(self.sets.len() - 1)
    }
}
