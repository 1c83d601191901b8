use tracing::{info, warn};

use crate::dynatrace::{AgentVersionSource, InstallerType, OsType};
use crate::resources::oneagents::OneAgentStatus;

/// Ask the Dynatrace environment for the OneAgent version that should be running.
///
/// Failures and empty answers are logged and reported as `None`, the caller falls back to a slower requeue.
pub async fn resolve_desired_version<C: AgentVersionSource>(client: &C) -> Option<String> {
    match client
        .latest_version(OsType::Unix, InstallerType::Default)
        .await
    {
        Ok(version) if !version.trim().is_empty() => Some(version),
        Ok(_) => {
            warn!(endpoint = %client.endpoint(), "The environment reported no OneAgent version");
            None
        }
        Err(err) => {
            warn!(endpoint = %client.endpoint(), "Failed to fetch the latest OneAgent version: {err}");
            None
        }
    }
}

/// Record a newly resolved version in the status. An empty version is never recorded.
pub fn record_desired_version(status: &mut OneAgentStatus, desired: &str) {
    if desired.is_empty() || status.version == desired {
        return;
    }

    info!(
        previous = %status.version,
        "New OneAgent version available: {desired}"
    );
    status.version = desired.to_owned();
}
