use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::ports::Contract;
use crate::retry::RetryPolicy;
use crate::runner::RunnerSpec;

/// Fully-qualified component id: `<namespace>.<family>.<verb>`, e.g.
/// `shipsec.recon.subdomain-scan`. Each segment is lowercase alphanumeric
/// plus dashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentId {
    namespace: String,
    family: String,
    verb: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComponentIdError {
    #[error("component id `{0}` must have exactly three dot-separated segments")]
    SegmentCount(String),
    #[error("component id `{id}` has invalid segment `{segment}`")]
    InvalidSegment { id: String, segment: String },
}

impl ComponentId {
    pub fn parse(raw: &str) -> Result<Self, ComponentIdError> {
        let segments: Vec<&str> = raw.split('.').collect();
        let [namespace, family, verb] = segments.as_slice() else {
            return Err(ComponentIdError::SegmentCount(raw.to_string()));
        };
        for segment in [namespace, family, verb] {
            let ok = !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if !ok {
                return Err(ComponentIdError::InvalidSegment {
                    id: raw.to_string(),
                    segment: segment.to_string(),
                });
            }
        }
        Ok(Self {
            namespace: namespace.to_string(),
            family: family.to_string(),
            verb: verb.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.namespace, self.family, self.verb)
    }
}

impl FromStr for ComponentId {
    type Err = ComponentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ComponentId {
    type Error = ComponentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ComponentId> for String {
    fn from(id: ComponentId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentCategory {
    Scanner,
    Transform,
    Agent,
    HumanInput,
    Integration,
    Utility,
}

/// Declares how a component appears as an MCP tool when placed on the
/// canvas next to an agent node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolProviderSpec {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Immutable descriptor for an executable component. Loaded into the
/// process-wide registry at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinition {
    pub id: ComponentId,
    pub label: String,
    pub category: ComponentCategory,
    pub inputs: Contract,
    pub outputs: Contract,
    pub parameters: Contract,
    pub runner: RunnerSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_provider: Option<ToolProviderSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_well_formed_ids() {
        let id = ComponentId::parse("shipsec.recon.subdomain-scan").unwrap();
        assert_eq!(id.namespace(), "shipsec");
        assert_eq!(id.family(), "recon");
        assert_eq!(id.verb(), "subdomain-scan");
        assert_eq!(id.to_string(), "shipsec.recon.subdomain-scan");
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(matches!(
            ComponentId::parse("shipsec.recon"),
            Err(ComponentIdError::SegmentCount(_))
        ));
        assert!(matches!(
            ComponentId::parse("a.b.c.d"),
            Err(ComponentIdError::SegmentCount(_))
        ));
    }

    #[test]
    fn rejects_invalid_segments() {
        for bad in ["Shipsec.recon.scan", "shipsec..scan", "shipsec.re con.scan"] {
            assert!(
                matches!(
                    ComponentId::parse(bad),
                    Err(ComponentIdError::InvalidSegment { .. })
                ),
                "expected {bad} to be rejected"
            );
        }
    }

    #[test]
    fn id_round_trips_through_serde() {
        let id = ComponentId::parse("shipsec.core.text-block").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"shipsec.core.text-block\"");
        let back: ComponentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
