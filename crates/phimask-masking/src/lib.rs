//! PHI masking rules and engine
//!
//! This crate provides:
//! - RuleSet loading and validation
//! - The closed set of masking strategies
//! - The recursive masking engine (copying and in-place)
//! - Source/destination comparison for post-run validation

pub mod engine;
pub mod rule;
pub mod strategy;
pub mod validator;

pub use engine::{MaskingEngine, apply, apply_in_place};
pub use rule::{FieldMatcher, MaskingRule, RuleSet};
pub use strategy::Strategy;
pub use validator::{ValidationReport, compare};
