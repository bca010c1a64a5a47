//! Parameter store backed by `params.yaml`.
//!
//! Parameters are grouped into named sections (one top-level mapping per
//! section). The `base` section is shared: every stage sees it in addition
//! to the sections it declares. Values are converted to JSON values at load
//! time, so comparisons and lock records are independent of YAML
//! formatting.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde_json::Value;

use crate::error::{Result, TrellisError};

/// Section every stage receives implicitly.
pub const BASE_SECTION: &str = "base";

/// Resolved parameter values for one stage: section name -> key -> value.
pub type SectionValues = BTreeMap<String, BTreeMap<String, Value>>;

/// All sections parsed from `params.yaml`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    sections: SectionValues,
}

impl ParamStore {
    /// Load and validate `params.yaml`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrellisError::ParamsNotFound(path.display().to_string())
            } else {
                TrellisError::Io(e)
            }
        })?;
        Self::parse(&text)
    }

    /// Parse params from YAML text.
    pub fn parse(text: &str) -> Result<Self> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| TrellisError::InvalidParams(e.to_string()))?;

        let mapping = match doc {
            serde_yaml::Value::Mapping(m) => m,
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            other => {
                return Err(TrellisError::InvalidParams(format!(
                    "expected a mapping of sections at the top level, found {}",
                    yaml_kind(&other)
                )))
            }
        };

        let mut sections = SectionValues::new();
        for (name, body) in mapping {
            let name = yaml_string_key(&name, "section name")?;
            let body = match body {
                serde_yaml::Value::Mapping(m) => m,
                other => {
                    return Err(TrellisError::InvalidParams(format!(
                        "section {name} must be a mapping, found {}",
                        yaml_kind(&other)
                    )))
                }
            };

            let mut values = BTreeMap::new();
            for (key, value) in body {
                let key = yaml_string_key(&key, &format!("key in section {name}"))?;
                values.insert(key, yaml_to_json(value)?);
            }
            sections.insert(name, values);
        }

        Ok(Self { sections })
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    /// Every section with its values, sorted by name.
    pub fn all(&self) -> &SectionValues {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, Value>> {
        self.sections.get(name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.sections.get(section).and_then(|s| s.get(key))
    }

    /// Look up a value, failing with the section and key spelled out.
    pub fn require(&self, section: &str, key: &str) -> Result<&Value> {
        self.get(section, key).ok_or_else(|| TrellisError::MissingParam {
            section: section.to_string(),
            key: key.to_string(),
        })
    }

    /// Resolve the values a stage sees: `base` (when present) plus each
    /// declared section. Declaring a section that does not exist is a
    /// configuration error.
    pub fn stage_view(&self, declared: &[String]) -> Result<SectionValues> {
        let mut view = SectionValues::new();
        if let Some(base) = self.sections.get(BASE_SECTION) {
            view.insert(BASE_SECTION.to_string(), base.clone());
        }
        for name in declared {
            let section = self
                .sections
                .get(name)
                .ok_or_else(|| TrellisError::UnknownSection(name.clone()))?;
            view.insert(name.clone(), section.clone());
        }
        Ok(view)
    }

    /// Return a copy with `section.key=value` overrides applied. The
    /// section must already exist; keys may be new.
    pub fn with_overrides(&self, overrides: &[ParamOverride]) -> Result<Self> {
        let mut sections = self.sections.clone();
        for ov in overrides {
            let section = sections
                .get_mut(&ov.section)
                .ok_or_else(|| TrellisError::UnknownSection(ov.section.clone()))?;
            section.insert(ov.key.clone(), ov.value.clone());
        }
        Ok(Self { sections })
    }
}

/// One `section.key=value` override from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamOverride {
    pub section: String,
    pub key: String,
    pub value: Value,
}

impl ParamOverride {
    /// Parse `section.key=value`. The value is interpreted as YAML, so
    /// `epochs=10` stays a number and `name=Dragon` stays a string.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || TrellisError::InvalidOverride(spec.to_string());

        let (target, raw_value) = spec.split_once('=').ok_or_else(invalid)?;
        let (section, key) = target.split_once('.').ok_or_else(invalid)?;
        if section.is_empty() || key.is_empty() {
            return Err(invalid());
        }

        let yaml: serde_yaml::Value = serde_yaml::from_str(raw_value)
            .map_err(|_| TrellisError::InvalidOverride(spec.to_string()))?;

        Ok(Self {
            section: section.to_string(),
            key: key.to_string(),
            value: yaml_to_json(yaml)?,
        })
    }
}

impl fmt::Display for ParamOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.section, self.key, self.value)
    }
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "a bool",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a list",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}

fn yaml_string_key(key: &serde_yaml::Value, what: &str) -> Result<String> {
    match key {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        other => Err(TrellisError::InvalidParams(format!(
            "{what} must be a string, found {}",
            yaml_kind(other)
        ))),
    }
}

/// Convert a YAML value to JSON for storage and comparison.
fn yaml_to_json(value: serde_yaml::Value) -> Result<Value> {
    match value {
        serde_yaml::Value::Null => Ok(Value::Null),
        serde_yaml::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::from(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Value::from(u))
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| {
                        TrellisError::InvalidParams("non-finite number".to_string())
                    })
            } else {
                Err(TrellisError::InvalidParams(format!("unsupported number {n}")))
            }
        }
        serde_yaml::Value::String(s) => Ok(Value::String(s)),
        serde_yaml::Value::Sequence(seq) => Ok(Value::Array(
            seq.into_iter().map(yaml_to_json).collect::<Result<_>>()?,
        )),
        serde_yaml::Value::Mapping(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                obj.insert(yaml_string_key(&k, "mapping key")?, yaml_to_json(v)?);
            }
            Ok(Value::Object(obj))
        }
        serde_yaml::Value::Tagged(t) => Err(TrellisError::InvalidParams(format!(
            "YAML tags are not supported (found !{})",
            t.tag
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
base:
  seed: 42
  pokemon_type_train: "Water"

train:
  epochs: 10
  lr: 0.001
  layers: [64, 32]

evaluate:
  threshold: 0.8
"#;

    #[test]
    fn parses_sections_and_values() {
        let store = ParamStore::parse(SAMPLE).unwrap();
        assert!(store.has_section("base"));
        assert_eq!(store.get("train", "epochs"), Some(&json!(10)));
        assert_eq!(store.get("train", "lr"), Some(&json!(0.001)));
        assert_eq!(store.get("base", "pokemon_type_train"), Some(&json!("Water")));
        assert_eq!(store.get("train", "layers"), Some(&json!([64, 32])));
    }

    #[test]
    fn require_names_missing_key() {
        let store = ParamStore::parse(SAMPLE).unwrap();
        let err = store.require("train", "batch_size").unwrap_err();
        assert!(err.to_string().contains("train.batch_size"));
    }

    #[test]
    fn top_level_must_be_sections() {
        let err = ParamStore::parse("- just\n- a\n- list\n").unwrap_err();
        assert!(matches!(err, TrellisError::InvalidParams(_)));

        let err = ParamStore::parse("train: 5\n").unwrap_err();
        assert!(err.to_string().contains("must be a mapping"));
    }

    #[test]
    fn stage_view_merges_base() {
        let store = ParamStore::parse(SAMPLE).unwrap();
        let view = store.stage_view(&["train".to_string()]).unwrap();
        assert!(view.contains_key("base"));
        assert!(view.contains_key("train"));
        assert!(!view.contains_key("evaluate"));
    }

    #[test]
    fn stage_view_rejects_unknown_section() {
        let store = ParamStore::parse(SAMPLE).unwrap();
        let err = store.stage_view(&["tune".to_string()]).unwrap_err();
        assert!(matches!(err, TrellisError::UnknownSection(s) if s == "tune"));
    }

    #[test]
    fn override_keeps_value_type() {
        let ov = ParamOverride::parse("train.epochs=25").unwrap();
        assert_eq!(ov.value, json!(25));

        let ov = ParamOverride::parse("base.pokemon_type_train=Dragon").unwrap();
        assert_eq!(ov.value, json!("Dragon"));

        let ov = ParamOverride::parse("evaluate.strict=true").unwrap();
        assert_eq!(ov.value, json!(true));
    }

    #[test]
    fn override_requires_section_key_value() {
        for bad in ["epochs=10", "train.epochs", ".epochs=1", "train.=1"] {
            assert!(
                matches!(ParamOverride::parse(bad), Err(TrellisError::InvalidOverride(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn overrides_apply_without_touching_original() {
        let store = ParamStore::parse(SAMPLE).unwrap();
        let ov = ParamOverride::parse("train.epochs=99").unwrap();
        let patched = store.with_overrides(&[ov]).unwrap();

        assert_eq!(patched.get("train", "epochs"), Some(&json!(99)));
        assert_eq!(store.get("train", "epochs"), Some(&json!(10)));
    }

    #[test]
    fn override_unknown_section_fails() {
        let store = ParamStore::parse(SAMPLE).unwrap();
        let ov = ParamOverride::parse("tune.depth=3").unwrap();
        assert!(matches!(
            store.with_overrides(&[ov]),
            Err(TrellisError::UnknownSection(_))
        ));
    }

    #[test]
    fn reformatted_yaml_parses_equal() {
        let compact = ParamStore::parse("train: {epochs: 10, lr: 0.001}\n").unwrap();
        let spread = ParamStore::parse("train:\n  epochs: 10\n  lr: 0.001\n").unwrap();
        assert_eq!(compact, spread);
    }
}
