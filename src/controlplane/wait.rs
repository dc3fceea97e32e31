//! Wait-for-condition polling against the live resource view

use crate::domain::ports::{ResourceWithVolumes, StorageBackend};
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Timing of polling loops
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Overall deadline of a single wait
    pub timeout: Duration,
    /// Pause between two queries
    pub interval: Duration,
    /// Number of consecutive checks a freshly started resource has to stay put
    pub stability_checks: u32,
    /// Pause between two stability checks
    pub stability_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(3),
            stability_checks: 5,
            stability_interval: Duration::from_secs(1),
        }
    }
}

/// Run a future unless the token is cancelled first
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

pub fn any_in_use(resources: &[ResourceWithVolumes]) -> bool {
    resources.iter().any(ResourceWithVolumes::is_in_use)
}

pub fn none_in_use(resources: &[ResourceWithVolumes]) -> bool {
    !any_in_use(resources)
}

fn in_use_node(resources: &[ResourceWithVolumes]) -> Option<&str> {
    resources
        .iter()
        .find(|r| r.is_in_use())
        .map(|r| r.node_name.as_str())
}

/// Poll the resource view until `condition` holds.
///
/// Transient query failures are logged and retried. Any other failure ends
/// the wait with that error.
pub async fn wait_until<F>(
    backend: &dyn StorageBackend,
    resource: &str,
    condition_name: &str,
    settings: &PollSettings,
    cancel: &CancellationToken,
    condition: F,
) -> Result<Vec<ResourceWithVolumes>>
where
    F: Fn(&[ResourceWithVolumes]) -> bool,
{
    let deadline = Instant::now() + settings.timeout;

    loop {
        match cancellable(cancel, backend.resource_view(resource)).await {
            Ok(view) if condition(&view) => return Ok(view),
            Ok(_) => debug!("Resource {} not yet {}", resource, condition_name),
            Err(e) if e.is_transient() => debug!("Polling resource {} failed: {}", resource, e),
            Err(e) => return Err(e),
        }

        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                name: resource.to_string(),
                condition: condition_name.to_string(),
                duration: settings.timeout,
            });
        }

        let wake = deadline.min(Instant::now() + settings.interval);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

/// Check that the resource stays in use on the same node for a few polls
/// after it was started
pub async fn assert_in_use_stable(
    backend: &dyn StorageBackend,
    resource: &str,
    settings: &PollSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    let view = cancellable(cancel, backend.resource_view(resource)).await?;
    let initial = in_use_node(&view)
        .ok_or_else(|| Error::Unstable {
            name: resource.to_string(),
            node: String::new(),
        })?
        .to_string();

    for _ in 0..settings.stability_checks {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(settings.stability_interval) => {}
        }

        let view = cancellable(cancel, backend.resource_view(resource)).await?;
        if in_use_node(&view) != Some(initial.as_str()) {
            return Err(Error::Unstable {
                name: resource.to_string(),
                node: initial,
            });
        }
    }

    debug!("Resource {} is stable on node {}", resource, initial);
    Ok(())
}
