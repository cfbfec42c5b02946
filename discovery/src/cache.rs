use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use shipsec_mcp_client::DiscoveredTool;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryCacheEntry {
    pub cache_token: String,
    pub tools: Vec<DiscoveredTool>,
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// TTL-bounded discovery result cache. Two lookups with the same token
/// inside the TTL see the same tool list, bit for bit; the second one
/// never opens a transport.
pub struct DiscoveryCache {
    entries: Mutex<HashMap<String, DiscoveryCacheEntry>>,
    ttl: Duration,
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_CACHE_TTL)
    }
}

impl DiscoveryCache {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DiscoveryCacheEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, cache_token: &str) -> Option<DiscoveryCacheEntry> {
        let mut entries = self.lock();
        match entries.get(cache_token) {
            Some(entry) if entry.expires_at > Utc::now() => Some(entry.clone()),
            Some(_) => {
                entries.remove(cache_token);
                None
            }
            None => None,
        }
    }

    pub fn put(
        &self,
        cache_token: &str,
        workflow_id: &str,
        tools: Vec<DiscoveredTool>,
    ) -> DiscoveryCacheEntry {
        let created_at = Utc::now();
        let entry = DiscoveryCacheEntry {
            cache_token: cache_token.to_string(),
            tools,
            workflow_id: workflow_id.to_string(),
            created_at,
            expires_at: created_at
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero()),
        };
        self.lock().insert(cache_token.to_string(), entry.clone());
        entry
    }
}
