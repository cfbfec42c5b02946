use std::path::PathBuf;

use crate::error::EnvVarError;
use crate::error::Result;
use crate::error::ShipsecErr;
use crate::flags::SHIPSEC_INSTANCE;

pub const SECRET_MASTER_KEY_BYTES: usize = 32;

/// Connection parameters for the durable workflow orchestrator. The
/// runtime consumes the orchestrator as an external collaborator; these
/// values are threaded through to the worker harness untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub address: String,
    pub namespace: String,
    pub task_queue: String,
}

/// Runtime configuration assembled once in `main` from the environment and
/// passed by reference; nothing here is re-read after startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Hardened mode: refuses Remote runners and unsigned webhooks.
    pub production: bool,

    /// Instance suffix for multi-tenant co-location (`SHIPSEC_INSTANCE`).
    pub instance: Option<String>,

    /// Shared secret guarding internal endpoints and signing session
    /// tokens (`INTERNAL_SERVICE_TOKEN`).
    pub internal_token: String,

    /// 32-byte master key for the secret store
    /// (`SECRET_STORE_MASTER_KEY`, hex-encoded).
    pub secret_master_key: Vec<u8>,

    pub orchestrator: OrchestratorConfig,

    /// Base directory for per-run isolated volumes and output scratch.
    pub volume_base_dir: PathBuf,
}

fn require_env(var: &str, instructions: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ShipsecErr::EnvVar(EnvVarError {
            var: var.to_string(),
            instructions: Some(instructions.to_string()),
        })),
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        let internal_token = require_env(
            "INTERNAL_SERVICE_TOKEN",
            "Set it to the shared secret used by internal service-to-service calls.",
        )?;

        let master_key_hex = require_env(
            "SECRET_STORE_MASTER_KEY",
            "Set it to 64 hex characters (32 bytes), e.g. `openssl rand -hex 32`.",
        )?;
        let secret_master_key = decode_master_key(&master_key_hex)?;

        let orchestrator = OrchestratorConfig {
            address: env_or("TEMPORAL_ADDRESS", "localhost:7233"),
            namespace: env_or("TEMPORAL_NAMESPACE", "default"),
            task_queue: env_or("TEMPORAL_TASK_QUEUE", "shipsec-runtime"),
        };

        let volume_base_dir = match std::env::var("SHIPSEC_VOLUME_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::temp_dir().join("shipsec-volumes"),
        };

        Ok(Self {
            production: env_or("SHIPSEC_ENV", "development") == "production",
            instance: (*SHIPSEC_INSTANCE).map(str::to_string),
            internal_token,
            secret_master_key,
            orchestrator,
            volume_base_dir,
        })
    }
}

fn decode_master_key(raw: &str) -> Result<Vec<u8>> {
    let decoded = hex::decode(raw.trim()).map_err(|_| {
        ShipsecErr::Configuration(
            "SECRET_STORE_MASTER_KEY must be hex-encoded".to_string(),
        )
    })?;
    if decoded.len() != SECRET_MASTER_KEY_BYTES {
        return Err(ShipsecErr::Configuration(format!(
            "SECRET_STORE_MASTER_KEY must decode to {SECRET_MASTER_KEY_BYTES} bytes, got {}",
            decoded.len()
        )));
    }
    Ok(decoded)
}
