use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Instance suffix used to scope consumer groups, ports and volume
    /// namespaces when several runtimes share a host.
    pub SHIPSEC_INSTANCE: Option<&str> = None;

    /// Debugging only: leave per-run output directories and volumes on
    /// disk after the activity exits.
    pub SKIP_CONTAINER_CLEANUP: bool = false;

    /// Container runtime binary. Anything CLI-compatible with docker
    /// (podman, nerdctl) works.
    pub SHIPSEC_CONTAINER_RUNTIME: &str = "docker";

    /// Grace period between asking the runtime to kill a timed-out
    /// container and force-killing our child process.
    pub SHIPSEC_KILL_GRACE_MS: Duration = Duration::from_millis(2_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}
