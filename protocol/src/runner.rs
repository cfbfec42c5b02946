use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// How a component executes. Dispatch is a single match over this enum;
/// there is deliberately no trait hierarchy behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RunnerSpec {
    Inline {},
    Container(ContainerSpec),
    Remote { endpoint: String },
}

impl RunnerSpec {
    pub fn kind(&self) -> RunnerKind {
        match self {
            RunnerSpec::Inline {} => RunnerKind::Inline,
            RunnerSpec::Container(_) => RunnerKind::Container,
            RunnerSpec::Remote { .. } => RunnerKind::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunnerKind {
    Inline,
    Container,
    Remote,
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerKind::Inline => write!(f, "inline"),
            RunnerKind::Container => write!(f, "container"),
            RunnerKind::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    pub timeout_seconds: u64,
    /// When true (the default) the resolved inputs are serialized to the
    /// container's stdin as one JSON document, then stdin is closed.
    #[serde(default = "default_stdin_json")]
    pub stdin_json: bool,
    /// Allocate a pseudo-terminal instead of plain pipes. PTY components
    /// never receive stdin JSON; it would pollute the terminal stream.
    #[serde(default)]
    pub pty: bool,
}

fn default_stdin_json() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkMode {
    #[default]
    None,
    Bridge,
    Host,
}

impl NetworkMode {
    pub fn as_docker_arg(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}
