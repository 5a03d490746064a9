//! Source/destination comparison
//!
//! Read-only: neither side is mutated.

use std::collections::HashSet;

use phimask_core::{FieldPath, Value};
use serde::Serialize;

use crate::rule::RuleSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Non-null fields a masking (non-identity) rule matched in the source.
    pub fields_expected_masked: Vec<FieldPath>,
    /// Subset of the above whose destination value differs from the source.
    pub fields_actually_masked: Vec<FieldPath>,
    /// Expected-masked fields that still carry the source value.
    pub unexpectedly_unchanged: Vec<FieldPath>,
    /// Identity-ruled or unmatched fields whose value differs.
    pub unexpectedly_changed: Vec<FieldPath>,
    pub missing_in_destination: Vec<FieldPath>,
    /// Fields present in the destination but not in the source.
    pub unexpected_in_destination: Vec<FieldPath>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.unexpectedly_unchanged.is_empty()
            && self.unexpectedly_changed.is_empty()
            && self.missing_in_destination.is_empty()
            && self.unexpected_in_destination.is_empty()
    }
}

/// Compare a source document with its masked counterpart.
pub fn compare(source: &Value, dest: &Value, rules: &RuleSet) -> ValidationReport {
    let mut report = ValidationReport::default();
    // Subtrees already accounted for by a matched field or a missing container.
    let mut settled: HashSet<FieldPath> = HashSet::new();

    for (path, node) in source.walk() {
        if is_settled(&path, &settled) {
            continue;
        }
        let rule = path.last_key().and_then(|name| rules.match_field(name));
        let counterpart = dest.get_path(&path);

        match rule {
            Some((rule, _)) => {
                settled.insert(path.clone());
                let Some(counterpart) = counterpart else {
                    report.missing_in_destination.push(path);
                    continue;
                };
                if rule.strategy.is_identity() {
                    if !same_bytes(node, counterpart) {
                        report.unexpectedly_changed.push(path);
                    }
                } else if !node.is_null() {
                    report.fields_expected_masked.push(path.clone());
                    if same_bytes(node, counterpart) {
                        report.unexpectedly_unchanged.push(path);
                    } else {
                        report.fields_actually_masked.push(path);
                    }
                }
            }
            None => match counterpart {
                None => {
                    settled.insert(path.clone());
                    report.missing_in_destination.push(path);
                }
                Some(counterpart) => {
                    if !node.is_container() && !same_bytes(node, counterpart) {
                        report.unexpectedly_changed.push(path);
                    }
                }
            },
        }
    }

    // Matched fields were compared as a unit above; anything else new in the
    // destination is reported once at its top-most path.
    let mut extra: HashSet<FieldPath> = HashSet::new();
    for (path, _) in dest.walk() {
        if path.is_root() || is_settled(&path, &extra) || is_settled(&path, &settled) {
            continue;
        }
        if source.get_path(&path).is_none() {
            extra.insert(path.clone());
            report.unexpected_in_destination.push(path);
        }
    }

    report
}

/// Whether `path` or one of its ancestors is in `settled`.
fn is_settled(path: &FieldPath, settled: &HashSet<FieldPath>) -> bool {
    if settled.is_empty() {
        return false;
    }
    let mut prefix = FieldPath::root();
    for segment in path.segments() {
        prefix.push(segment.clone());
        if settled.contains(&prefix) {
            return true;
        }
    }
    false
}

fn same_bytes(a: &Value, b: &Value) -> bool {
    match (a.to_native(), b.to_native()) {
        (Ok(a), Ok(b)) => serde_json::to_vec(&a).ok() == serde_json::to_vec(&b).ok(),
        _ => a == b,
    }
}
