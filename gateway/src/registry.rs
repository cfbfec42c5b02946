//! Run-scoped tool registry.
//!
//! Tool-provider nodes register here when they execute; agent nodes see
//! the union of local registrations and external server tools for their
//! `allowedNodeIds`. Entries never outlive their run.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use shipsec_mcp_client::McpServerConfig;

/// One tool offered by a node for the duration of a run. Keyed by
/// (run_id, node_id, tool_name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRegistration {
    pub run_id: String,
    pub node_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_headers: Option<HashMap<String, String>>,
}

#[derive(Default)]
struct RegistryInner {
    /// (run_id, node_id, tool_name) -> registration.
    local: HashMap<(String, String, String), ToolRegistration>,
    /// (run_id, node_id) -> external servers that node references.
    external: HashMap<(String, String), Vec<McpServerConfig>>,
}

#[derive(Default)]
pub struct ToolRegistry {
    inner: Mutex<RegistryInner>,
}

impl ToolRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register_local(&self, registration: ToolRegistration) {
        let key = (
            registration.run_id.clone(),
            registration.node_id.clone(),
            registration.tool_name.clone(),
        );
        self.lock().local.insert(key, registration);
    }

    /// Attach an external MCP server referenced by a node; its tools are
    /// served under the `<serverSlug>__` prefix.
    pub fn register_external(&self, run_id: &str, node_id: &str, config: McpServerConfig) {
        self.lock()
            .external
            .entry((run_id.to_string(), node_id.to_string()))
            .or_default()
            .push(config);
    }

    /// Local registrations visible to the given scope.
    pub fn local_tools(&self, run_id: &str, allowed_node_ids: &[String]) -> Vec<ToolRegistration> {
        let inner = self.lock();
        let mut tools: Vec<ToolRegistration> = inner
            .local
            .values()
            .filter(|reg| reg.run_id == run_id && allowed_node_ids.contains(&reg.node_id))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        tools
    }

    /// External servers visible to the given scope, deduped by server id.
    pub fn external_servers(
        &self,
        run_id: &str,
        allowed_node_ids: &[String],
    ) -> Vec<McpServerConfig> {
        let inner = self.lock();
        let mut seen = Vec::new();
        let mut configs = Vec::new();
        for node_id in allowed_node_ids {
            if let Some(servers) = inner
                .external
                .get(&(run_id.to_string(), node_id.clone()))
            {
                for config in servers {
                    if !seen.contains(&config.server_id) {
                        seen.push(config.server_id.clone());
                        configs.push(config.clone());
                    }
                }
            }
        }
        configs
    }

    pub fn find_local(
        &self,
        run_id: &str,
        allowed_node_ids: &[String],
        tool_name: &str,
    ) -> Option<ToolRegistration> {
        self.lock()
            .local
            .values()
            .find(|reg| {
                reg.run_id == run_id
                    && reg.tool_name == tool_name
                    && allowed_node_ids.contains(&reg.node_id)
            })
            .cloned()
    }

    /// Drop everything owned by a terminated run.
    pub fn remove_run(&self, run_id: &str) {
        let mut inner = self.lock();
        inner.local.retain(|(run, _, _), _| run != run_id);
        inner.external.retain(|(run, _), _| run != run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use shipsec_mcp_client::TransportKind;

    fn registration(run: &str, node: &str, tool: &str) -> ToolRegistration {
        ToolRegistration {
            run_id: run.to_string(),
            node_id: node.to_string(),
            tool_name: tool.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
            endpoint: None,
            container_id: None,
            resolved_headers: None,
        }
    }

    fn server(id: &str) -> McpServerConfig {
        McpServerConfig {
            server_id: id.to_string(),
            transport: TransportKind::Http,
            endpoint: Some("https://srv/mcp".to_string()),
            command: None,
            args: Vec::new(),
            env: None,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn scope_filters_by_run_and_allowed_nodes() {
        let registry = ToolRegistry::default();
        registry.register_local(registration("run-1", "node-a", "port-scan"));
        registry.register_local(registration("run-1", "node-b", "dns-lookup"));
        registry.register_local(registration("run-2", "node-a", "port-scan"));

        let tools = registry.local_tools("run-1", &["node-a".to_string()]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool_name, "port-scan");

        let both = registry.local_tools(
            "run-1",
            &["node-a".to_string(), "node-b".to_string()],
        );
        assert_eq!(both.len(), 2);
        // Stable name ordering.
        assert_eq!(both[0].tool_name, "dns-lookup");
    }

    #[test]
    fn re_registering_the_same_key_replaces_the_entry() {
        let registry = ToolRegistry::default();
        registry.register_local(registration("run-1", "node-a", "port-scan"));
        let mut updated = registration("run-1", "node-a", "port-scan");
        updated.description = Some("updated".to_string());
        registry.register_local(updated);

        let tools = registry.local_tools("run-1", &["node-a".to_string()]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].description.as_deref(), Some("updated"));
    }

    #[test]
    fn external_servers_are_deduped_across_nodes() {
        let registry = ToolRegistry::default();
        registry.register_external("run-1", "node-a", server("probe"));
        registry.register_external("run-1", "node-b", server("probe"));
        registry.register_external("run-1", "node-b", server("intel"));

        let servers = registry.external_servers(
            "run-1",
            &["node-a".to_string(), "node-b".to_string()],
        );
        let ids: Vec<&str> = servers.iter().map(|s| s.server_id.as_str()).collect();
        assert_eq!(ids, vec!["probe", "intel"]);
    }

    #[test]
    fn remove_run_clears_local_and_external_entries() {
        let registry = ToolRegistry::default();
        registry.register_local(registration("run-1", "node-a", "port-scan"));
        registry.register_external("run-1", "node-a", server("probe"));
        registry.register_local(registration("run-2", "node-a", "port-scan"));

        registry.remove_run("run-1");

        assert!(registry.local_tools("run-1", &["node-a".to_string()]).is_empty());
        assert!(
            registry
                .external_servers("run-1", &["node-a".to_string()])
                .is_empty()
        );
        assert_eq!(
            registry.local_tools("run-2", &["node-a".to_string()]).len(),
            1
        );
    }
}
