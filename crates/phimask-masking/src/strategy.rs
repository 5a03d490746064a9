//! Masking strategies
//!
//! The set is closed: a rule file naming anything else is rejected at load
//! time. Strategies never see the document key and never put the original
//! value into an error message.

use phimask_core::{ConfigurationError, Value};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

const WORD_MIN_LEN: usize = 4;
const WORD_MAX_LEN: usize = 10;
const MAX_DIGITS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "strategy", content = "params", rename_all = "camelCase")]
pub enum Strategy {
    /// Replace any non-null value with a constant string.
    FixedString { value: String },
    /// `count` random A-Z tokens joined by spaces.
    RandomUppercaseWords { count: usize },
    /// Lowercase of the sibling field's already-masked value.
    LowercaseMirror { sibling: String },
    /// Shift a date by a signed millisecond offset, keeping its type.
    NumericOffsetDate {
        #[serde(rename = "offsetMillis")]
        offset_millis: i64,
    },
    /// `n`-digit numeric string.
    RandomDigits { n: usize },
    /// `{local}@{domain}.{suffix}`.
    MaskedEmail {
        local: String,
        domain: String,
        suffix: String,
    },
    /// A member of a declared set, fixed or random.
    CategoricalReplace {
        values: Vec<String>,
        fixed: Option<String>,
    },
    /// Field intentionally left unmasked.
    Identity,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FixedStringParams {
    value: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WordsParams {
    count: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MirrorParams {
    sibling: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OffsetParams {
    #[serde(rename = "offsetMillis", alias = "offset_millis")]
    offset_millis: i64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DigitsParams {
    #[serde(alias = "digits", alias = "count")]
    n: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EmailParams {
    #[serde(default = "default_email_local")]
    local: String,
    #[serde(default = "default_email_domain")]
    domain: String,
    #[serde(default = "default_email_suffix")]
    suffix: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CategoricalParams {
    values: Vec<String>,
    #[serde(default)]
    fixed: Option<String>,
}

fn default_email_local() -> String {
    "user".to_string()
}

fn default_email_domain() -> String {
    "masked".to_string()
}

fn default_email_suffix() -> String {
    "com".to_string()
}

impl Strategy {
    /// Build a strategy from its rule-file name and parameters.
    ///
    /// Names are accepted in camelCase or snake_case.
    pub fn parse(field: &str, name: &str, params: serde_json::Value) -> Result<Self, ConfigurationError> {
        let params = if params.is_null() {
            serde_json::json!({})
        } else {
            params
        };
        let normalized = name.replace(['_', '-'], "").to_ascii_lowercase();
        let invalid = |reason: String| ConfigurationError::InvalidParams {
            field: field.to_string(),
            strategy: name.to_string(),
            reason,
        };

        let strategy = match normalized.as_str() {
            "fixedstring" => {
                let p: FixedStringParams = decode(params).map_err(invalid)?;
                Strategy::FixedString { value: p.value }
            }
            "randomuppercasewords" => {
                let p: WordsParams = decode(params).map_err(invalid)?;
                if p.count == 0 {
                    return Err(invalid("count must be at least 1".to_string()));
                }
                Strategy::RandomUppercaseWords { count: p.count }
            }
            "lowercasemirror" => {
                let p: MirrorParams = decode(params).map_err(invalid)?;
                if p.sibling.is_empty() {
                    return Err(invalid("sibling must not be empty".to_string()));
                }
                if p.sibling == field {
                    return Err(invalid("a field cannot mirror itself".to_string()));
                }
                Strategy::LowercaseMirror { sibling: p.sibling }
            }
            "numericoffsetdate" => {
                let p: OffsetParams = decode(params).map_err(invalid)?;
                if p.offset_millis == 0 {
                    return Err(invalid("offsetMillis must be non-zero".to_string()));
                }
                Strategy::NumericOffsetDate {
                    offset_millis: p.offset_millis,
                }
            }
            "randomdigits" => {
                let p: DigitsParams = decode(params).map_err(invalid)?;
                if p.n == 0 || p.n > MAX_DIGITS {
                    return Err(invalid(format!("n must be between 1 and {}", MAX_DIGITS)));
                }
                Strategy::RandomDigits { n: p.n }
            }
            "maskedemail" => {
                let p: EmailParams = decode(params).map_err(invalid)?;
                for part in [&p.local, &p.domain, &p.suffix] {
                    if part.is_empty() || part.contains('@') {
                        return Err(invalid(format!(
                            "email placeholder '{}' must be non-empty and contain no '@'",
                            part
                        )));
                    }
                }
                Strategy::MaskedEmail {
                    local: p.local,
                    domain: p.domain,
                    suffix: p.suffix,
                }
            }
            "categoricalreplace" => {
                let p: CategoricalParams = decode(params).map_err(invalid)?;
                if p.values.is_empty() {
                    return Err(invalid("values must not be empty".to_string()));
                }
                if let Some(fixed) = &p.fixed {
                    if !p.values.contains(fixed) {
                        return Err(invalid(format!("fixed value '{}' is not in values", fixed)));
                    }
                }
                Strategy::CategoricalReplace {
                    values: p.values,
                    fixed: p.fixed,
                }
            }
            "identity" => Strategy::Identity,
            _ => {
                return Err(ConfigurationError::UnknownStrategy {
                    field: field.to_string(),
                    strategy: name.to_string(),
                });
            }
        };
        Ok(strategy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::FixedString { .. } => "fixedString",
            Strategy::RandomUppercaseWords { .. } => "randomUppercaseWords",
            Strategy::LowercaseMirror { .. } => "lowercaseMirror",
            Strategy::NumericOffsetDate { .. } => "numericOffsetDate",
            Strategy::RandomDigits { .. } => "randomDigits",
            Strategy::MaskedEmail { .. } => "maskedEmail",
            Strategy::CategoricalReplace { .. } => "categoricalReplace",
            Strategy::Identity => "identity",
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Strategy::Identity)
    }

    /// Whether the value depends on another field of the same object.
    pub fn sibling(&self) -> Option<&str> {
        match self {
            Strategy::LowercaseMirror { sibling } => Some(sibling),
            _ => None,
        }
    }

    /// Mask a value that does not depend on its siblings.
    ///
    /// Null passes through. String-oriented strategies map over array elements.
    pub fn mask<R: Rng + ?Sized>(&self, value: &Value, rng: &mut R) -> Result<Value, String> {
        match self {
            Strategy::Identity => Ok(value.clone()),
            Strategy::FixedString { value: constant } => Ok(match value {
                Value::Null => Value::Null,
                _ => Value::String(constant.clone()),
            }),
            Strategy::LowercaseMirror { .. } => {
                Err("lowercaseMirror must be resolved against its sibling".to_string())
            }
            Strategy::RandomUppercaseWords { count } => map_elements(value, &mut |v| match v {
                Value::String(original) => {
                    let words = random_words(*count, rng);
                    Ok(Value::String(ensure_differs(words, original, next_letter)))
                }
                other => Err(format!("expected a string, found {}", other.kind())),
            }),
            Strategy::RandomDigits { n } => map_elements(value, &mut |v| {
                let original = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    other => return Err(format!("expected a string or number, found {}", other.kind())),
                };
                let digits = random_digits(*n, rng);
                Ok(Value::String(ensure_differs(digits, &original, next_digit)))
            }),
            Strategy::MaskedEmail {
                local,
                domain,
                suffix,
            } => map_elements(value, &mut |v| match v {
                Value::String(_) => Ok(Value::String(format!("{}@{}.{}", local, domain, suffix))),
                other => Err(format!("expected an email string, found {}", other.kind())),
            }),
            Strategy::CategoricalReplace { values, fixed } => map_elements(value, &mut |v| {
                let current = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => return Err(format!("expected a categorical scalar, found {}", other.kind())),
                };
                if let Some(fixed) = fixed {
                    return Ok(Value::String(fixed.clone()));
                }
                let candidates: Vec<&String> = values.iter().filter(|c| **c != current).collect();
                let choice = candidates
                    .choose(rng)
                    .map(|c| (*c).clone())
                    .unwrap_or_else(|| values[0].clone());
                Ok(Value::String(choice))
            }),
            Strategy::NumericOffsetDate { offset_millis } => {
                map_elements(value, &mut |v| shift_date(v, *offset_millis))
            }
        }
    }
}

/// Resolve a `lowercaseMirror` against the sibling's current value.
pub fn lowercase_mirror(sibling: &str, sibling_value: Option<&Value>) -> Result<Value, String> {
    match sibling_value {
        None => Err(format!("sibling field '{}' is missing", sibling)),
        Some(Value::Null) => Ok(Value::Null),
        Some(Value::String(s)) => Ok(Value::String(s.to_lowercase())),
        Some(other) => Err(format!(
            "sibling field '{}' must be a string, found {}",
            sibling,
            other.kind()
        )),
    }
}

fn decode<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| e.to_string())
}

fn map_elements<F>(value: &Value, f: &mut F) -> Result<Value, String>
where
    F: FnMut(&Value) -> Result<Value, String>,
{
    match value {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(map_elements(item, f)?);
            }
            Ok(Value::Array(out))
        }
        other => f(other),
    }
}

fn shift_date(value: &Value, offset_millis: i64) -> Result<Value, String> {
    let offset = Duration::milliseconds(offset_millis);
    match value {
        Value::Timestamp(ts) => ts
            .checked_add(offset)
            .map(Value::Timestamp)
            .ok_or_else(|| "date out of range after offset".to_string()),
        Value::String(s) => {
            let ts = OffsetDateTime::parse(s, &Rfc3339)
                .map_err(|_| "expected a date, found a non-date string".to_string())?;
            let shifted = ts
                .checked_add(offset)
                .ok_or_else(|| "date out of range after offset".to_string())?;
            shifted
                .format(&Rfc3339)
                .map(Value::String)
                .map_err(|e| format!("shifted date not representable: {}", e))
        }
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| "expected integer epoch milliseconds".to_string())?
            .checked_add(offset_millis)
            .map(Value::from)
            .ok_or_else(|| "date out of range after offset".to_string()),
        other => Err(format!("expected a date, found {}", other.kind())),
    }
}

fn random_words<R: Rng + ?Sized>(count: usize, rng: &mut R) -> String {
    let mut words = Vec::with_capacity(count);
    for _ in 0..count {
        let len = rng.gen_range(WORD_MIN_LEN..=WORD_MAX_LEN);
        let word: String = (0..len).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect();
        words.push(word);
    }
    words.join(" ")
}

fn random_digits<R: Rng + ?Sized>(n: usize, rng: &mut R) -> String {
    (0..n).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect()
}

/// Guarantee the masked output never equals the input by nudging one character.
fn ensure_differs(generated: String, original: &str, nudge: fn(char) -> char) -> String {
    if generated != original {
        return generated;
    }
    let mut chars: Vec<char> = generated.chars().collect();
    if let Some(last) = chars.last_mut() {
        *last = nudge(*last);
    }
    chars.into_iter().collect()
}

fn next_letter(c: char) -> char {
    if c == 'Z' { 'A' } else { (c as u8 + 1) as char }
}

fn next_digit(c: char) -> char {
    if c == '9' { '0' } else { (c as u8 + 1) as char }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;
    use time::macros::datetime;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_parse_accepts_both_casings() {
        let camel = Strategy::parse("Dob", "numericOffsetDate", json!({"offsetMillis": 5})).unwrap();
        let snake = Strategy::parse("Dob", "numeric_offset_date", json!({"offset_millis": 5})).unwrap();
        assert_eq!(camel, snake);
        assert_eq!(Strategy::parse("Notes", "identity", serde_json::Value::Null).unwrap(), Strategy::Identity);
    }

    #[test]
    fn test_unknown_strategy_is_configuration_error() {
        let err = Strategy::parse("Ssn", "hashIt", json!({})).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnknownStrategy {
                field: "Ssn".to_string(),
                strategy: "hashIt".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(Strategy::parse("Name", "randomUppercaseWords", json!({"count": 0})).is_err());
        assert!(Strategy::parse("Name", "randomUppercaseWords", json!({"cnt": 1})).is_err());
        assert!(Strategy::parse("Dob", "numericOffsetDate", json!({"offsetMillis": 0})).is_err());
        assert!(Strategy::parse("G", "categoricalReplace", json!({"values": []})).is_err());
        assert!(
            Strategy::parse("G", "categoricalReplace", json!({"values": ["F"], "fixed": "X"})).is_err()
        );
        assert!(Strategy::parse("E", "maskedEmail", json!({"domain": "a@b"})).is_err());
    }

    #[test]
    fn test_random_uppercase_words() {
        let strategy = Strategy::RandomUppercaseWords { count: 3 };
        let masked = strategy.mask(&Value::from("Jane Q Doe"), &mut rng()).unwrap();
        let text = masked.as_str().unwrap();
        let words: Vec<_> = text.split(' ').collect();
        assert_eq!(words.len(), 3);
        for word in words {
            assert!((WORD_MIN_LEN..=WORD_MAX_LEN).contains(&word.len()));
            assert!(word.chars().all(|c| c.is_ascii_uppercase()));
        }
        assert!(strategy.mask(&Value::from(5), &mut rng()).is_err());
    }

    #[test]
    fn test_seeded_output_is_deterministic() {
        let strategy = Strategy::RandomDigits { n: 10 };
        let a = strategy.mask(&Value::from("555-0100"), &mut rng()).unwrap();
        let b = strategy.mask(&Value::from("555-0100"), &mut rng()).unwrap();
        assert_eq!(a, b);
        let digits = a.as_str().unwrap();
        assert_eq!(digits.len(), 10);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_generated_never_equals_original() {
        assert_eq!(ensure_differs("1234".to_string(), "1234", next_digit), "1235");
        assert_eq!(ensure_differs("ABZ".to_string(), "ABZ", next_letter), "ABA");
        assert_eq!(ensure_differs("X".to_string(), "Y", next_letter), "X");

        let strategy = Strategy::RandomDigits { n: 1 };
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert_ne!(strategy.mask(&Value::from("4"), &mut rng).unwrap(), Value::from("4"));
        }
    }

    #[test]
    fn test_numeric_offset_date_keeps_type() {
        let strategy = Strategy::NumericOffsetDate {
            offset_millis: 86_400_000,
        };
        let ts = strategy
            .mask(&Value::Timestamp(datetime!(2000-02-28 12:00 UTC)), &mut rng())
            .unwrap();
        assert_eq!(ts, Value::Timestamp(datetime!(2000-02-29 12:00 UTC)));

        let s = strategy.mask(&Value::from("2000-02-28T12:00:00Z"), &mut rng()).unwrap();
        assert_eq!(s, Value::from("2000-02-29T12:00:00Z"));

        let n = strategy.mask(&Value::from(0), &mut rng()).unwrap();
        assert_eq!(n, Value::from(86_400_000));

        let err = strategy.mask(&Value::from("not a date"), &mut rng()).unwrap_err();
        assert!(err.contains("non-date"));
        assert!(!err.contains("not a date"));
        assert!(strategy.mask(&Value::Bool(true), &mut rng()).is_err());
    }

    #[test]
    fn test_masked_email_shape() {
        let strategy = Strategy::parse("Email", "maskedEmail", json!({})).unwrap();
        let masked = strategy.mask(&Value::from("jane@hospital.org"), &mut rng()).unwrap();
        assert_eq!(masked, Value::from("user@masked.com"));
    }

    #[test]
    fn test_categorical_stays_in_domain() {
        let strategy = Strategy::CategoricalReplace {
            values: vec!["F".to_string(), "M".to_string(), "U".to_string()],
            fixed: None,
        };
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let masked = strategy.mask(&Value::from("F"), &mut rng).unwrap();
            let value = masked.as_str().unwrap();
            assert!(value == "M" || value == "U");
        }

        let fixed = Strategy::CategoricalReplace {
            values: vec!["U".to_string()],
            fixed: Some("U".to_string()),
        };
        assert_eq!(fixed.mask(&Value::from("F"), &mut rng()).unwrap(), Value::from("U"));
    }

    #[test]
    fn test_null_and_arrays() {
        let strategy = Strategy::MaskedEmail {
            local: "u".to_string(),
            domain: "d".to_string(),
            suffix: "io".to_string(),
        };
        assert_eq!(strategy.mask(&Value::Null, &mut rng()).unwrap(), Value::Null);

        let list = Value::Array(vec![Value::from("a@x.org"), Value::Null, Value::from("b@y.org")]);
        assert_eq!(
            strategy.mask(&list, &mut rng()).unwrap(),
            Value::Array(vec![Value::from("u@d.io"), Value::Null, Value::from("u@d.io")])
        );

        let fixed = Strategy::FixedString {
            value: "REDACTED".to_string(),
        };
        assert_eq!(fixed.mask(&list, &mut rng()).unwrap(), Value::from("REDACTED"));
    }

    #[test]
    fn test_lowercase_mirror_resolution() {
        assert_eq!(
            lowercase_mirror("FirstName", Some(&Value::from("QWERTY"))).unwrap(),
            Value::from("qwerty")
        );
        assert_eq!(lowercase_mirror("FirstName", Some(&Value::Null)).unwrap(), Value::Null);
        assert!(lowercase_mirror("FirstName", None).is_err());
        assert!(lowercase_mirror("FirstName", Some(&Value::from(3))).is_err());
    }
}
