//! Recursive masking engine

use std::sync::Arc;

use phimask_core::{DocumentKey, FieldPath, Map, MaskingError, PathSegment, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::rule::RuleSet;
use crate::strategy::{Strategy, lowercase_mirror};

/// Applies a [`RuleSet`] to documents.
///
/// With a seed, every document gets its own random stream derived from the
/// seed and the document key, so the output for a document does not depend on
/// which batch it landed in.
#[derive(Debug, Clone)]
pub struct MaskingEngine {
    rules: Arc<RuleSet>,
    seed: Option<u64>,
}

impl MaskingEngine {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules, seed: None }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Masked copy of `document`; the input is left untouched.
    pub fn apply(&self, document: &Value, key: Option<&DocumentKey>) -> Result<Value, MaskingError> {
        let mut copy = document.clone();
        self.apply_in_place(&mut copy, key)?;
        Ok(copy)
    }

    /// Mask `document` in place and return the paths whose value changed.
    ///
    /// On error the document may be partially masked and must be discarded.
    pub fn apply_in_place(
        &self,
        document: &mut Value,
        key: Option<&DocumentKey>,
    ) -> Result<Vec<FieldPath>, MaskingError> {
        let mut rng = self.rng_for(key);
        let mut touched = Vec::new();
        mask_node(&self.rules, document, &mut FieldPath::root(), &mut rng, &mut touched).map_err(
            |err| match key {
                Some(key) => err.with_key(key.clone()),
                None => err,
            },
        )?;
        Ok(touched)
    }

    fn rng_for(&self, key: Option<&DocumentKey>) -> StdRng {
        match self.seed {
            Some(seed) => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(&seed.to_le_bytes());
                if let Some(key) = key {
                    hasher.update(&key.canonical_bytes());
                }
                StdRng::from_seed(*hasher.finalize().as_bytes())
            }
            None => StdRng::from_entropy(),
        }
    }
}

/// Masked copy of `document` using an unseeded random stream.
pub fn apply(rules: &RuleSet, document: &Value) -> Result<Value, MaskingError> {
    let mut copy = document.clone();
    apply_in_place(rules, &mut copy)?;
    Ok(copy)
}

/// Mask `document` in place using an unseeded random stream.
pub fn apply_in_place(rules: &RuleSet, document: &mut Value) -> Result<Vec<FieldPath>, MaskingError> {
    let mut rng = StdRng::from_entropy();
    let mut touched = Vec::new();
    mask_node(rules, document, &mut FieldPath::root(), &mut rng, &mut touched)?;
    Ok(touched)
}

fn mask_node<R: Rng>(
    rules: &RuleSet,
    node: &mut Value,
    path: &mut FieldPath,
    rng: &mut R,
    touched: &mut Vec<FieldPath>,
) -> Result<(), MaskingError> {
    match node {
        Value::Object(map) => mask_object(rules, map, path, rng, touched),
        Value::Array(items) => {
            for (idx, item) in items.iter_mut().enumerate() {
                path.push(PathSegment::Index(idx));
                mask_node(rules, item, path, rng, touched)?;
                path.pop();
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Two passes: independent rules (and recursion into unmatched children)
/// first, then mirrors in rank order so they see their sibling's masked value.
fn mask_object<R: Rng>(
    rules: &RuleSet,
    map: &mut Map,
    path: &mut FieldPath,
    rng: &mut R,
    touched: &mut Vec<FieldPath>,
) -> Result<(), MaskingError> {
    let mut deferred: Vec<(usize, String, String)> = Vec::new();

    for (key, value) in map.iter_mut() {
        path.push(PathSegment::Key(key.to_string()));
        match rules.match_field(key) {
            None => mask_node(rules, value, path, rng, touched)?,
            Some((rule, rank)) => match &rule.strategy {
                Strategy::Identity => {}
                Strategy::LowercaseMirror { sibling } => {
                    deferred.push((rank, key.to_string(), sibling.clone()));
                }
                strategy => {
                    let masked = strategy
                        .mask(value, rng)
                        .map_err(|reason| MaskingError::new(path.to_string(), reason))?;
                    if masked != *value {
                        *value = masked;
                        touched.push(path.clone());
                    }
                }
            },
        }
        path.pop();
    }

    deferred.sort_by_key(|(rank, _, _)| *rank);
    for (_, key, sibling) in deferred {
        let field_path = path.child_key(&key);
        let mirrored = lowercase_mirror(&sibling, map.get(&sibling))
            .map_err(|reason| MaskingError::new(field_path.to_string(), reason))?;
        if map.get(&key) != Some(&mirrored) {
            map.insert(key, mirrored);
            touched.push(field_path);
        }
    }
    Ok(())
}
