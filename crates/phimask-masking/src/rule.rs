//! Masking rules and rule sets

use std::fmt;
use std::path::Path;

use glob::Pattern;
use phimask_core::ConfigurationError;
use serde::Deserialize;
use tracing::warn;

use crate::strategy::Strategy;

/// Addresses a field by name at any nesting depth.
#[derive(Debug, Clone)]
pub enum FieldMatcher {
    Exact(String),
    Glob(Pattern),
}

impl FieldMatcher {
    /// Field names containing `*`, `?` or `[` are treated as glob patterns.
    pub fn parse(field: &str) -> Result<Self, ConfigurationError> {
        if field.is_empty() {
            return Err(ConfigurationError::InvalidMatcher(
                field.to_string(),
                "field name must not be empty".to_string(),
            ));
        }
        if field.contains(['*', '?', '[']) {
            Pattern::new(field)
                .map(FieldMatcher::Glob)
                .map_err(|e| ConfigurationError::InvalidMatcher(field.to_string(), e.to_string()))
        } else {
            Ok(FieldMatcher::Exact(field.to_string()))
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            FieldMatcher::Exact(field) => field == name,
            FieldMatcher::Glob(pattern) => pattern.matches(name),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldMatcher::Exact(field) => field,
            FieldMatcher::Glob(pattern) => pattern.as_str(),
        }
    }
}

impl fmt::Display for FieldMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct MaskingRule {
    pub matcher: FieldMatcher,
    pub strategy: Strategy,
    pub category: Option<String>,
}

impl MaskingRule {
    pub fn new(field: &str, strategy: Strategy) -> Result<Self, ConfigurationError> {
        Ok(Self {
            matcher: FieldMatcher::parse(field)?,
            strategy,
            category: None,
        })
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// One entry of a rule file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub field: String,
    pub strategy: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub category: Option<String>,
}

impl RuleSpec {
    pub fn into_rule(self) -> Result<MaskingRule, ConfigurationError> {
        let strategy = Strategy::parse(&self.field, &self.strategy, self.params)?;
        let mut rule = MaskingRule::new(&self.field, strategy)?;
        rule.category = self.category;
        Ok(rule)
    }
}

/// Ordered, immutable collection of rules.
///
/// Application is a flat pass in load order; categories are informational.
/// When several rules match one field name, the first wins.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<MaskingRule>,
    categories: Vec<String>,
    /// Evaluation rank per rule: 0 for independent rules, chain depth for mirrors.
    ranks: Vec<usize>,
    fingerprint: String,
}

impl RuleSet {
    pub fn new(rules: Vec<MaskingRule>) -> Result<Self, ConfigurationError> {
        let mut categories: Vec<String> = Vec::new();
        for rule in &rules {
            if let Some(category) = &rule.category {
                if !categories.contains(category) {
                    categories.push(category.clone());
                }
            }
        }

        for (idx, rule) in rules.iter().enumerate() {
            if let FieldMatcher::Exact(field) = &rule.matcher {
                if let Some(earlier) = rules[..idx].iter().find(|r| r.matcher.matches(field)) {
                    warn!(
                        field = %field,
                        shadowed_by = %earlier.matcher,
                        strategy = rule.strategy.name(),
                        "Rule is shadowed by an earlier rule and will never apply"
                    );
                }
            }
        }

        let ranks = resolve_ranks(&rules)?;
        let fingerprint = fingerprint(&rules);

        Ok(Self {
            rules,
            categories,
            ranks,
            fingerprint,
        })
    }

    /// Parse a rule file: either a flat array of rules, or
    /// `{"categories": {"names": [...], ...}}`.
    pub fn from_json_str(content: &str) -> Result<Self, ConfigurationError> {
        let document: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| ConfigurationError::MalformedRules(e.to_string()))?;
        Self::from_value(document)
    }

    pub fn from_value(document: serde_json::Value) -> Result<Self, ConfigurationError> {
        let specs: Vec<RuleSpec> = match document {
            serde_json::Value::Array(_) => serde_json::from_value(document)
                .map_err(|e| ConfigurationError::MalformedRules(e.to_string()))?,
            serde_json::Value::Object(mut root) => {
                let Some(serde_json::Value::Object(groups)) = root.remove("categories") else {
                    return Err(ConfigurationError::MalformedRules(
                        "expected an array of rules or a 'categories' object".to_string(),
                    ));
                };
                let mut specs = Vec::new();
                for (category, entries) in groups {
                    let group: Vec<RuleSpec> = serde_json::from_value(entries).map_err(|e| {
                        ConfigurationError::MalformedRules(format!("category '{}': {}", category, e))
                    })?;
                    specs.extend(group.into_iter().map(|mut spec| {
                        spec.category = Some(category.clone());
                        spec
                    }));
                }
                specs
            }
            _ => {
                return Err(ConfigurationError::MalformedRules(
                    "expected an array of rules or a 'categories' object".to_string(),
                ));
            }
        };

        let rules = specs
            .into_iter()
            .map(RuleSpec::into_rule)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(rules)
    }

    /// Load a rule file from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::MalformedRules(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn rules(&self) -> &[MaskingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a MaskingRule> + 'a {
        self.rules
            .iter()
            .filter(move |r| r.category.as_deref() == Some(category))
    }

    /// First rule matching the field name, with its evaluation rank.
    pub fn match_field(&self, name: &str) -> Option<(&MaskingRule, usize)> {
        self.rules
            .iter()
            .position(|r| r.matcher.matches(name))
            .map(|idx| (&self.rules[idx], self.ranks[idx]))
    }

    /// Stable BLAKE3 fingerprint of the rules' canonical form.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn fingerprint(rules: &[MaskingRule]) -> String {
    let canonical: Vec<(&str, &Strategy)> = rules
        .iter()
        .map(|r| (r.matcher.as_str(), &r.strategy))
        .collect();
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Rank every rule so that mirrors are evaluated after whatever they mirror.
fn resolve_ranks(rules: &[MaskingRule]) -> Result<Vec<usize>, ConfigurationError> {
    let first_match = |name: &str| rules.iter().position(|r| r.matcher.matches(name));

    let mut ranks = Vec::with_capacity(rules.len());
    for (idx, rule) in rules.iter().enumerate() {
        let mut rank = 0;
        let mut visited = vec![idx];
        let mut current = rule;
        while let Some(sibling) = current.strategy.sibling() {
            let Some(target) = first_match(sibling) else {
                return Err(ConfigurationError::UnmaskedSibling {
                    field: current.matcher.to_string(),
                    sibling: sibling.to_string(),
                });
            };
            if visited.contains(&target) {
                return Err(ConfigurationError::DependencyCycle(current.matcher.to_string()));
            }
            if rules[target].strategy.is_identity() {
                return Err(ConfigurationError::UnmaskedSibling {
                    field: current.matcher.to_string(),
                    sibling: sibling.to_string(),
                });
            }
            visited.push(target);
            current = &rules[target];
            rank += 1;
        }
        ranks.push(rank);
    }
    Ok(ranks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_rule_file() {
        let rules = RuleSet::from_value(json!([
            {"field": "FirstName", "strategy": "randomUppercaseWords", "params": {"count": 1}},
            {"field": "FirstNameLower", "strategy": "lowercaseMirror", "params": {"sibling": "FirstName"}},
            {"field": "Notes", "strategy": "fixedString", "params": {"value": "REDACTED"}, "category": "free_text"},
        ]))
        .unwrap();

        assert_eq!(rules.len(), 3);
        assert_eq!(rules.categories(), &["free_text".to_string()]);
        assert_eq!(rules.match_field("FirstNameLower").unwrap().1, 1);
        assert_eq!(rules.match_field("FirstName").unwrap().1, 0);
        assert!(rules.match_field("LastName").is_none());
    }

    #[test]
    fn test_grouped_rule_file_keeps_order() {
        let rules = RuleSet::from_json_str(
            r#"{"categories": {
                "names": [{"field": "LastName", "strategy": "random_uppercase_words", "params": {"count": 2}}],
                "contact": [
                    {"field": "*Phone*", "strategy": "randomDigits", "params": {"n": 10}},
                    {"field": "Email", "strategy": "maskedEmail"}
                ]
            }}"#,
        )
        .unwrap();

        assert_eq!(rules.categories(), &["names".to_string(), "contact".to_string()]);
        assert_eq!(rules.in_category("contact").count(), 2);
        let (rule, _) = rules.match_field("HomePhoneNumber").unwrap();
        assert_eq!(rule.strategy, Strategy::RandomDigits { n: 10 });
    }

    #[test]
    fn test_unknown_strategy_fails_load() {
        let err = RuleSet::from_value(json!([{"field": "Ssn", "strategy": "scramble"}])).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownStrategy { .. }));
    }

    #[test]
    fn test_malformed_file() {
        assert!(matches!(
            RuleSet::from_json_str("{not json").unwrap_err(),
            ConfigurationError::MalformedRules(_)
        ));
        assert!(matches!(
            RuleSet::from_value(json!({"rules": []})).unwrap_err(),
            ConfigurationError::MalformedRules(_)
        ));
    }

    #[test]
    fn test_mirror_dependencies() {
        let unmasked = RuleSet::from_value(json!([
            {"field": "NameLower", "strategy": "lowercaseMirror", "params": {"sibling": "Name"}},
        ]))
        .unwrap_err();
        assert!(matches!(unmasked, ConfigurationError::UnmaskedSibling { .. }));

        let identity = RuleSet::from_value(json!([
            {"field": "Name", "strategy": "identity"},
            {"field": "NameLower", "strategy": "lowercaseMirror", "params": {"sibling": "Name"}},
        ]))
        .unwrap_err();
        assert!(matches!(identity, ConfigurationError::UnmaskedSibling { .. }));

        let cycle = RuleSet::from_value(json!([
            {"field": "A", "strategy": "lowercaseMirror", "params": {"sibling": "B"}},
            {"field": "B", "strategy": "lowercaseMirror", "params": {"sibling": "A"}},
        ]))
        .unwrap_err();
        assert!(matches!(cycle, ConfigurationError::DependencyCycle(_)));

        let chain = RuleSet::from_value(json!([
            {"field": "C", "strategy": "lowercaseMirror", "params": {"sibling": "B"}},
            {"field": "B", "strategy": "lowercaseMirror", "params": {"sibling": "A"}},
            {"field": "A", "strategy": "randomUppercaseWords", "params": {"count": 1}},
        ]))
        .unwrap();
        assert_eq!(chain.match_field("C").unwrap().1, 2);
        assert_eq!(chain.match_field("B").unwrap().1, 1);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = RuleSet::from_value(json!([{"field": "Notes", "strategy": "fixedString", "params": {"value": "X"}}])).unwrap();
        let b = RuleSet::from_value(json!([{"field": "Notes", "strategy": "fixed_string", "params": {"value": "X"}}])).unwrap();
        let c = RuleSet::from_value(json!([{"field": "Notes", "strategy": "fixedString", "params": {"value": "Y"}}])).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"[{"field": "Dob", "strategy": "identity"}]"#).unwrap();
        let rules = RuleSet::load(&path).unwrap();
        assert!(rules.match_field("Dob").unwrap().0.strategy.is_identity());

        assert!(RuleSet::load(&dir.path().join("missing.json")).is_err());
    }
}
