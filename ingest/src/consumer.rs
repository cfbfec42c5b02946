use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestorKind {
    Logs,
    Events,
    NodeIo,
}

impl std::fmt::Display for IngestorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestorKind::Logs => write!(f, "logs"),
            IngestorKind::Events => write!(f, "events"),
            IngestorKind::NodeIo => write!(f, "node-io"),
        }
    }
}

/// Consumer identity on the messaging backend. Group and client ids
/// default to an instance-scoped name so co-located runtimes never share
/// a consumer group by accident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    pub kind: IngestorKind,
    pub group_id: String,
    pub client_id: String,
}

impl ConsumerConfig {
    pub fn new(kind: IngestorKind, instance: Option<&str>) -> Self {
        let base = format!("shipsec-{kind}-ingestor");
        let scoped = match instance {
            Some(instance) => format!("{base}-{instance}"),
            None => base,
        };
        Self {
            kind,
            group_id: scoped.clone(),
            client_id: scoped,
        }
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_instance_scoped() {
        let bare = ConsumerConfig::new(IngestorKind::Logs, None);
        assert_eq!(bare.group_id, "shipsec-logs-ingestor");
        assert_eq!(bare.client_id, "shipsec-logs-ingestor");

        let scoped = ConsumerConfig::new(IngestorKind::NodeIo, Some("2"));
        assert_eq!(scoped.group_id, "shipsec-node-io-ingestor-2");
    }

    #[test]
    fn overrides_replace_the_defaults() {
        let config = ConsumerConfig::new(IngestorKind::Events, None)
            .with_group_id("custom-group")
            .with_client_id("custom-client");
        assert_eq!(config.group_id, "custom-group");
        assert_eq!(config.client_id, "custom-client");
    }
}
