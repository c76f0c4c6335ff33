//! Typed policy parameters.
//!
//! Each policy declares its options (name, type, default) in
//! `config/policies.json`. `key=value` overrides are parsed against that
//! schema instead of being evaluated as expressions, and the catalog is
//! validated when it is loaded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParameterError {
    #[error("unknown policy class '{0}'")]
    UnknownPolicy(String),

    #[error("malformed parameter '{0}', expected key=value")]
    Malformed(String),

    #[error("policy '{policy}' has no parameter '{name}'")]
    UnknownParameter { policy: String, name: String },

    #[error("parameter '{name}' expects {expected}, got '{value}'")]
    TypeMismatch {
        name: String,
        expected: ParameterKind,
        value: String,
    },

    #[error("parameter '{name}' is required by policy '{policy}'")]
    Missing { policy: String, name: String },

    #[error("invalid policy catalog: {0}")]
    InvalidCatalog(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    Integer,
    Float,
    Boolean,
    Text,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKind::Integer => write!(f, "integer"),
            ParameterKind::Float => write!(f, "float"),
            ParameterKind::Boolean => write!(f, "boolean"),
            ParameterKind::Text => write!(f, "text"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterValue::Boolean(_) => ParameterKind::Boolean,
            ParameterValue::Integer(_) => ParameterKind::Integer,
            ParameterValue::Float(_) => ParameterKind::Float,
            ParameterValue::Text(_) => ParameterKind::Text,
        }
    }

    /// Parse a raw override string as the given kind
    pub fn parse(name: &str, raw: &str, kind: ParameterKind) -> Result<Self, ParameterError> {
        let mismatch = || ParameterError::TypeMismatch {
            name: name.to_string(),
            expected: kind,
            value: raw.to_string(),
        };
        let trimmed = raw.trim();
        match kind {
            ParameterKind::Integer => trimmed.parse().map(ParameterValue::Integer).map_err(|_| mismatch()),
            ParameterKind::Float => trimmed.parse().map(ParameterValue::Float).map_err(|_| mismatch()),
            ParameterKind::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Ok(ParameterValue::Boolean(true)),
                "false" => Ok(ParameterValue::Boolean(false)),
                _ => Err(mismatch()),
            },
            ParameterKind::Text => Ok(ParameterValue::Text(raw.to_string())),
        }
    }

    /// Python literal for the entrypoint, which evaluates each `--param` value.
    ///
    /// The entrypoint splits `name=value` on every `=`, so `=` inside text is
    /// written as an escape.
    pub fn to_literal(&self) -> String {
        match self {
            ParameterValue::Boolean(true) => "True".to_string(),
            ParameterValue::Boolean(false) => "False".to_string(),
            ParameterValue::Integer(i) => i.to_string(),
            ParameterValue::Float(x) if x.is_nan() => "float('nan')".to_string(),
            ParameterValue::Float(x) if x.is_infinite() => {
                if *x > 0.0 { "float('inf')".to_string() } else { "float('-inf')".to_string() }
            }
            // Debug keeps the fractional part, so 10.0 stays a float
            ParameterValue::Float(x) => format!("{:?}", x),
            ParameterValue::Text(s) => quote_text(s),
        }
    }

    /// Integers are accepted where floats are declared
    fn conforms_to(&self, kind: ParameterKind) -> bool {
        self.kind() == kind || (kind == ParameterKind::Float && self.kind() == ParameterKind::Integer)
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Boolean(b) => write!(f, "{}", b),
            ParameterValue::Integer(i) => write!(f, "{}", i),
            ParameterValue::Float(x) => write!(f, "{}", x),
            ParameterValue::Text(s) => write!(f, "{}", s),
        }
    }
}

fn quote_text(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('\'');
    for c in text.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            '=' => quoted.push_str("\\x3d"),
            c if c.is_ascii_control() => quoted.push_str(&format!("\\x{:02x}", c as u32)),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub default: Option<ParameterValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySchema {
    pub class_name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl PolicySchema {
    /// Resolve `key=value` overrides into a complete, typed parameter set
    pub fn resolve(&self, overrides: &[String]) -> Result<BTreeMap<String, ParameterValue>, ParameterError> {
        let mut resolved = BTreeMap::new();

        for raw in overrides {
            let (name, value) = raw
                .split_once('=')
                .ok_or_else(|| ParameterError::Malformed(raw.clone()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ParameterError::Malformed(raw.clone()));
            }
            let spec = self
                .parameters
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| ParameterError::UnknownParameter {
                    policy: self.class_name.clone(),
                    name: name.to_string(),
                })?;
            resolved.insert(name.to_string(), ParameterValue::parse(name, value, spec.kind)?);
        }

        for spec in &self.parameters {
            if resolved.contains_key(&spec.name) {
                continue;
            }
            match &spec.default {
                Some(default) => {
                    resolved.insert(spec.name.clone(), default.clone());
                }
                None => {
                    return Err(ParameterError::Missing {
                        policy: self.class_name.clone(),
                        name: spec.name.clone(),
                    })
                }
            }
        }

        Ok(resolved)
    }

    fn validate(&self) -> Result<(), ParameterError> {
        let mut seen = HashSet::new();
        for spec in &self.parameters {
            if !seen.insert(spec.name.as_str()) {
                return Err(ParameterError::InvalidCatalog(format!(
                    "policy '{}' declares '{}' twice",
                    self.class_name, spec.name
                )));
            }
            if let Some(default) = &spec.default {
                if !default.conforms_to(spec.kind) {
                    return Err(ParameterError::InvalidCatalog(format!(
                        "default for '{}.{}' is not {}",
                        self.class_name, spec.name, spec.kind
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PoliciesJson {
    policies: Vec<PolicySchema>,
}

/// Validated set of known policy schemas
#[derive(Debug, Clone)]
pub struct PolicyCatalog {
    policies: Vec<PolicySchema>,
}

impl PolicyCatalog {
    pub fn new(policies: Vec<PolicySchema>) -> Result<Self, ParameterError> {
        let mut names = HashSet::new();
        for policy in &policies {
            if !names.insert(policy.class_name.as_str()) {
                return Err(ParameterError::InvalidCatalog(format!(
                    "policy '{}' declared twice",
                    policy.class_name
                )));
            }
            policy.validate()?;
        }
        Ok(Self { policies })
    }

    pub fn load(path: &Path) -> Result<Self, ParameterError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ParameterError::InvalidCatalog(format!("{}: {}", path.display(), e)))?;
        let parsed: PoliciesJson = serde_json::from_str(&content)
            .map_err(|e| ParameterError::InvalidCatalog(format!("{}: {}", path.display(), e)))?;
        Self::new(parsed.policies)
    }

    pub fn get(&self, class_name: &str) -> Result<&PolicySchema, ParameterError> {
        self.policies
            .iter()
            .find(|p| p.class_name == class_name)
            .ok_or_else(|| ParameterError::UnknownPolicy(class_name.to_string()))
    }

    pub fn class_names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.class_name.as_str()).collect()
    }
}

/// Entrypoint arguments selecting a policy and its parameters
pub fn policy_args(class_name: &str, parameters: &BTreeMap<String, ParameterValue>) -> Vec<String> {
    let mut args = vec!["--class_name".to_string(), class_name.to_string()];
    for (name, value) in parameters {
        args.push("--param".to_string());
        args.push(format!("{}={}", name, value.to_literal()));
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PolicyCatalog {
        PolicyCatalog::new(vec![
            PolicySchema {
                class_name: "MovingAveragePolicy".into(),
                parameters: vec![ParameterSpec {
                    name: "window_size".into(),
                    kind: ParameterKind::Integer,
                    default: Some(ParameterValue::Integer(5)),
                }],
            },
            PolicySchema {
                class_name: "SimplePolicy".into(),
                parameters: vec![ParameterSpec {
                    name: "quantity".into(),
                    kind: ParameterKind::Float,
                    default: Some(ParameterValue::Integer(10)),
                }],
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_defaults_fill_missing_overrides() {
        let resolved = catalog().get("MovingAveragePolicy").unwrap().resolve(&[]).unwrap();
        assert_eq!(resolved["window_size"], ParameterValue::Integer(5));
    }

    #[test]
    fn test_override_is_typed() {
        let schema = catalog().get("SimplePolicy").unwrap().clone();
        let resolved = schema.resolve(&["quantity=-2.5".to_string()]).unwrap();
        assert_eq!(resolved["quantity"], ParameterValue::Float(-2.5));
    }

    #[test]
    fn test_expression_values_are_rejected() {
        let schema = catalog().get("MovingAveragePolicy").unwrap().clone();
        let err = schema.resolve(&["window_size=__import__('os')".to_string()]).unwrap_err();
        assert!(matches!(err, ParameterError::TypeMismatch { .. }));
    }

    #[test]
    fn test_unknown_and_malformed_parameters() {
        let schema = catalog().get("MovingAveragePolicy").unwrap().clone();
        assert!(matches!(
            schema.resolve(&["window=3".to_string()]),
            Err(ParameterError::UnknownParameter { .. })
        ));
        assert!(matches!(
            schema.resolve(&["window_size".to_string()]),
            Err(ParameterError::Malformed(_))
        ));
        assert!(matches!(catalog().get("Nope"), Err(ParameterError::UnknownPolicy(_))));
    }

    #[test]
    fn test_required_parameter_without_default() {
        let schema = PolicySchema {
            class_name: "Threshold".into(),
            parameters: vec![ParameterSpec {
                name: "level".into(),
                kind: ParameterKind::Float,
                default: None,
            }],
        };
        assert!(matches!(schema.resolve(&[]), Err(ParameterError::Missing { .. })));
    }

    #[test]
    fn test_catalog_rejects_bad_defaults_and_duplicates() {
        let bad_default = PolicySchema {
            class_name: "P".into(),
            parameters: vec![ParameterSpec {
                name: "flag".into(),
                kind: ParameterKind::Boolean,
                default: Some(ParameterValue::Text("yes".into())),
            }],
        };
        assert!(PolicyCatalog::new(vec![bad_default]).is_err());

        let dup = PolicySchema {
            class_name: "P".into(),
            parameters: vec![],
        };
        assert!(PolicyCatalog::new(vec![dup.clone(), dup]).is_err());
    }

    #[test]
    fn test_policy_args() {
        let mut params = BTreeMap::new();
        params.insert("window_size".to_string(), ParameterValue::Integer(7));
        assert_eq!(
            policy_args("MovingAveragePolicy", &params),
            vec!["--class_name", "MovingAveragePolicy", "--param", "window_size=7"]
        );
    }

    #[test]
    fn test_literals_per_kind() {
        assert_eq!(ParameterValue::Integer(-3).to_literal(), "-3");
        assert_eq!(ParameterValue::Float(10.0).to_literal(), "10.0");
        assert_eq!(ParameterValue::Float(-2.5).to_literal(), "-2.5");
        assert_eq!(ParameterValue::Float(f64::INFINITY).to_literal(), "float('inf')");
        assert_eq!(ParameterValue::Boolean(true).to_literal(), "True");
        assert_eq!(ParameterValue::Boolean(false).to_literal(), "False");
        assert_eq!(ParameterValue::Text("foo".into()).to_literal(), "'foo'");
        assert_eq!(ParameterValue::Text("peak hours".into()).to_literal(), "'peak hours'");
    }

    #[test]
    fn test_text_literal_escapes() {
        assert_eq!(ParameterValue::Text("it's".into()).to_literal(), r"'it\'s'");
        assert_eq!(ParameterValue::Text(r"a\b".into()).to_literal(), r"'a\\b'");
        assert_eq!(ParameterValue::Text("x\ny".into()).to_literal(), r"'x\ny'");
        assert_eq!(ParameterValue::Text("a=b".into()).to_literal(), r"'a\x3db'");
    }

    #[test]
    fn test_policy_args_render_literals() {
        let schema = PolicySchema {
            class_name: "P".into(),
            parameters: vec![
                ParameterSpec {
                    name: "label".into(),
                    kind: ParameterKind::Text,
                    default: None,
                },
                ParameterSpec {
                    name: "greedy".into(),
                    kind: ParameterKind::Boolean,
                    default: Some(ParameterValue::Boolean(false)),
                },
            ],
        };
        let resolved = schema.resolve(&["label=peak hours".to_string()]).unwrap();
        assert_eq!(
            policy_args("P", &resolved),
            vec!["--class_name", "P", "--param", "greedy=False", "--param", "label='peak hours'"]
        );
    }

    #[test]
    fn test_catalog_json_shape() {
        let json = r#"{"policies": [{"class_name": "SimplePolicy",
            "parameters": [{"name": "quantity", "kind": "float", "default": 10}]}]}"#;
        let parsed: PoliciesJson = serde_json::from_str(json).unwrap();
        let catalog = PolicyCatalog::new(parsed.policies).unwrap();
        assert_eq!(catalog.class_names(), vec!["SimplePolicy"]);
    }
}
