use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::error::ShipsecErr;

/// A decrypted secret held in memory only. `Debug` is redacted and the
/// buffer is zeroed on drop; values must never reach logs or telemetry.
pub struct SecretValue(Vec<u8>);

impl SecretValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn expose_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.0)
            .map_err(|_| ShipsecErr::Validation("secret value is not valid UTF-8".to_string()))
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretValue(<redacted>)")
    }
}

impl Drop for SecretValue {
    fn drop(&mut self) {
        for byte in self.0.iter_mut() {
            *byte = 0;
        }
    }
}

/// Seam to the platform secret store. Decryption happens behind this trait;
/// the runtime only ever sees plaintext wrapped in [`SecretValue`].
pub trait SecretStore: Send + Sync {
    fn resolve<'a>(
        &'a self,
        organization_id: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<SecretValue>>;
}

/// In-memory store backing the dev harness and tests.
#[derive(Default)]
pub struct InMemorySecretStore {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemorySecretStore {
    pub fn insert(&self, organization_id: &str, name: &str, value: &[u8]) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(
            (organization_id.to_string(), name.to_string()),
            value.to_vec(),
        );
    }
}

impl SecretStore for InMemorySecretStore {
    fn resolve<'a>(
        &'a self,
        organization_id: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<SecretValue>> {
        Box::pin(async move {
            let entries = match self.entries.lock() {
                Ok(entries) => entries,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries
                .get(&(organization_id.to_string(), name.to_string()))
                .map(|bytes| SecretValue::new(bytes.clone()))
                .ok_or_else(|| {
                    ShipsecErr::NotFound(format!("secret `{name}` for organization"))
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_scoped_secrets() {
        let store = InMemorySecretStore::default();
        store.insert("org-1", "shodan-api-key", b"k-123");

        let value = store.resolve("org-1", "shodan-api-key").await.unwrap();
        assert_eq!(value.expose_str().unwrap(), "k-123");

        let missing = store.resolve("org-2", "shodan-api-key").await;
        assert!(matches!(missing, Err(ShipsecErr::NotFound(_))));
    }

    #[test]
    fn debug_never_prints_the_value() {
        let value = SecretValue::new(b"hunter2".to_vec());
        assert_eq!(format!("{value:?}"), "SecretValue(<redacted>)");
    }
}
