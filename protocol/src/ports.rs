use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// The small type algebra spoken by component ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PortType {
    Text,
    Number,
    Boolean,
    Secret,
    Json,
    Any,
    File,
    List {
        item: Box<PortType>,
    },
    Map {
        key: Box<PortType>,
        value: Box<PortType>,
    },
    /// Reference to a named schema registered alongside the component
    /// catalog (e.g. `aws-credentials`).
    Contract {
        schema: String,
        #[serde(default)]
        credential: bool,
    },
}

/// How a port participates in scheduling: credential ports resolve through
/// the secret store, action ports are wired from upstream node outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Binding {
    Credential,
    Action,
}

impl PortType {
    /// Secret ports and credential-flagged contract ports bind as
    /// credentials; everything else is an action port.
    pub fn binding(&self) -> Binding {
        match self {
            PortType::Secret => Binding::Credential,
            PortType::Contract {
                credential: true, ..
            } => Binding::Credential,
            _ => Binding::Action,
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            PortType::Text | PortType::Secret | PortType::File => value.is_string(),
            PortType::Number => value.is_number(),
            PortType::Boolean => value.is_boolean(),
            PortType::Json | PortType::Any => true,
            PortType::List { item } => match value {
                Value::Array(items) => items.iter().all(|v| item.accepts(v)),
                _ => false,
            },
            PortType::Map { value: val_ty, .. } => match value {
                Value::Object(entries) => entries.values().all(|v| val_ty.accepts(v)),
                _ => false,
            },
            // Named schemas are validated by the catalog service; at this
            // layer a contract value must at least be an object.
            PortType::Contract { .. } => value.is_object(),
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortType::Text => write!(f, "text"),
            PortType::Number => write!(f, "number"),
            PortType::Boolean => write!(f, "boolean"),
            PortType::Secret => write!(f, "secret"),
            PortType::Json => write!(f, "json"),
            PortType::Any => write!(f, "any"),
            PortType::File => write!(f, "file"),
            PortType::List { item } => write!(f, "list<{item}>"),
            PortType::Map { key, value } => write!(f, "map<{key},{value}>"),
            PortType::Contract { schema, .. } => write!(f, "contract<{schema}>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    #[serde(flatten)]
    pub ty: PortType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl PortSpec {
    pub fn required(ty: PortType) -> Self {
        Self {
            ty,
            label: None,
            required: true,
        }
    }

    pub fn optional(ty: PortType) -> Self {
        Self {
            ty,
            label: None,
            required: false,
        }
    }
}

/// A validated record of named ports. `BTreeMap` keeps serialization stable
/// so contract hashes and snapshots do not churn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Contract {
    pub ports: BTreeMap<String, PortSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ContractViolation {
    MissingPort { port: String },
    UnknownPort { port: String },
    TypeMismatch { port: String, expected: String },
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractViolation::MissingPort { port } => {
                write!(f, "required port `{port}` is missing")
            }
            ContractViolation::UnknownPort { port } => {
                write!(f, "port `{port}` is not declared by the contract")
            }
            ContractViolation::TypeMismatch { port, expected } => {
                write!(f, "port `{port}` does not match declared type {expected}")
            }
        }
    }
}

impl Contract {
    pub fn new(ports: impl IntoIterator<Item = (String, PortSpec)>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Check `record` against the contract, reporting every violation at
    /// once so callers can surface a single actionable error.
    pub fn validate_record(&self, record: &serde_json::Map<String, Value>) -> Vec<ContractViolation> {
        let mut violations = Vec::new();

        for (name, spec) in &self.ports {
            match record.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        violations.push(ContractViolation::MissingPort { port: name.clone() });
                    }
                }
                Some(value) => {
                    if !spec.ty.accepts(value) {
                        violations.push(ContractViolation::TypeMismatch {
                            port: name.clone(),
                            expected: spec.ty.to_string(),
                        });
                    }
                }
            }
        }

        for name in record.keys() {
            if !self.ports.contains_key(name) {
                violations.push(ContractViolation::UnknownPort { port: name.clone() });
            }
        }

        violations
    }

    /// Ports that must be resolved through the secret store.
    pub fn credential_ports(&self) -> impl Iterator<Item = (&str, &PortSpec)> {
        self.ports
            .iter()
            .filter(|(_, spec)| spec.ty.binding() == Binding::Credential)
            .map(|(name, spec)| (name.as_str(), spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn secret_and_credential_contract_ports_bind_as_credentials() {
        assert_eq!(PortType::Secret.binding(), Binding::Credential);
        assert_eq!(
            PortType::Contract {
                schema: "aws-credentials".to_string(),
                credential: true,
            }
            .binding(),
            Binding::Credential
        );
        assert_eq!(
            PortType::Contract {
                schema: "scan-target".to_string(),
                credential: false,
            }
            .binding(),
            Binding::Action
        );
        assert_eq!(PortType::Text.binding(), Binding::Action);
    }

    #[test]
    fn validates_required_and_unknown_ports() {
        let contract = Contract::new([
            ("target".to_string(), PortSpec::required(PortType::Text)),
            ("depth".to_string(), PortSpec::optional(PortType::Number)),
        ]);

        let violations = contract.validate_record(&record(json!({"depth": 2, "extra": true})));
        assert_eq!(
            violations,
            vec![
                ContractViolation::MissingPort {
                    port: "target".to_string()
                },
                ContractViolation::UnknownPort {
                    port: "extra".to_string()
                },
            ]
        );

        assert!(
            contract
                .validate_record(&record(json!({"target": "example.com"})))
                .is_empty()
        );
    }

    #[test]
    fn nested_list_and_map_types_check_elements() {
        let contract = Contract::new([(
            "hosts".to_string(),
            PortSpec::required(PortType::List {
                item: Box::new(PortType::Text),
            }),
        )]);

        assert!(
            contract
                .validate_record(&record(json!({"hosts": ["a.io", "b.io"]})))
                .is_empty()
        );
        let violations = contract.validate_record(&record(json!({"hosts": ["a.io", 5]})));
        assert_eq!(
            violations,
            vec![ContractViolation::TypeMismatch {
                port: "hosts".to_string(),
                expected: "list<text>".to_string(),
            }]
        );
    }

    #[test]
    fn null_counts_as_absent() {
        let contract = Contract::new([(
            "note".to_string(),
            PortSpec::optional(PortType::Text),
        )]);
        assert!(
            contract
                .validate_record(&record(json!({"note": null})))
                .is_empty()
        );
    }
}
