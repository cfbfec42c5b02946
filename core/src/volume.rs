//! Per-run isolated volumes.
//!
//! Inputs are staged into a tenant/run-scoped directory and mounted
//! read-only into the component's container, so one tenant's run can never
//! observe another's files. Names are deterministic: retried activities
//! land on the same volume.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use tracing::warn;

use shipsec_protocol::VolumeMount;

use crate::error::Result;
use crate::error::ShipsecErr;

pub struct IsolatedVolume {
    root: PathBuf,
    organization_id: String,
    run_id: String,
}

fn sanitize_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

impl IsolatedVolume {
    /// Deterministic volume name: `shipsec-vol-<tenant>-<run>`.
    pub fn volume_name(organization_id: &str, run_id: &str) -> String {
        format!(
            "shipsec-vol-{}-{}",
            sanitize_segment(organization_id),
            sanitize_segment(run_id)
        )
    }

    pub fn create(base_dir: &Path, organization_id: &str, run_id: &str) -> Result<Self> {
        let root = base_dir.join(Self::volume_name(organization_id, run_id));
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            organization_id: organization_id.to_string(),
            run_id: run_id.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Seed the volume with named input files. File names must be plain
    /// names; separators or parent references are rejected before any
    /// write happens.
    pub fn initialize(&self, input_files: &HashMap<String, Vec<u8>>) -> Result<()> {
        for name in input_files.keys() {
            if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
                return Err(ShipsecErr::Validation(format!(
                    "input file name `{name}` must be a plain file name"
                )));
            }
        }
        for (name, bytes) in input_files {
            std::fs::write(self.root.join(name), bytes)?;
        }
        Ok(())
    }

    /// Mount descriptor consumed by the container executor.
    pub fn volume_config(&self, target_path: &str, read_only: bool) -> VolumeMount {
        VolumeMount {
            source: self.root.to_string_lossy().to_string(),
            target: target_path.to_string(),
            read_only,
        }
    }

    /// Remove the volume. Absence is tolerated; other failures are warned
    /// and swallowed so cleanup never masks the activity's own result.
    pub fn cleanup(&self) {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    volume = %self.root.display(),
                    "failed to remove isolated volume: {err}"
                );
            }
        }
    }
}
