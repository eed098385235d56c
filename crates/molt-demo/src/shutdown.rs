//! Server draining after the stop token fires.

use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Wait for every server task to finish.
///
/// Gives up when `hurry` is cancelled or `timeout` elapses; remaining tasks
/// are aborted. Returns the first task failure, if any.
pub async fn drain(
    mut servers: JoinSet<Result<()>>,
    hurry: CancellationToken,
    timeout: Duration,
) -> Result<()> {
    let total = servers.len();
    info!(servers = total, timeout_secs = timeout.as_secs(), "Draining servers");

    let joined = async {
        let mut first_error = None;
        while let Some(joined) = servers.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(anyhow!("server task failed: {}", e)),
            };
            if let Err(e) = outcome {
                error!(error = %e, "Server stopped with an error");
                first_error.get_or_insert(e);
            }
        }
        first_error
    };

    tokio::select! {
        first_error = joined => match first_error {
            None => {
                info!("All servers drained");
                Ok(())
            }
            Some(e) => Err(e),
        },
        _ = hurry.cancelled() => {
            warn!("Drain cut short, aborting remaining servers");
            Ok(())
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(timeout_secs = timeout.as_secs(), "Drain timed out, aborting remaining servers");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_waits_for_servers() {
        let mut servers = JoinSet::new();
        servers.spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });
        servers.spawn(async { Ok(()) });

        drain(servers, CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_reports_failure() {
        let mut servers = JoinSet::new();
        servers.spawn(async { Err(anyhow!("bind lost")) });
        servers.spawn(async { Ok(()) });

        let err = drain(servers, CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bind lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let mut servers = JoinSet::new();
        servers.spawn(std::future::pending::<Result<()>>());

        drain(servers, CancellationToken::new(), Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_hurried() {
        let mut servers = JoinSet::new();
        servers.spawn(std::future::pending::<Result<()>>());
        let hurry = CancellationToken::new();
        hurry.cancel();

        drain(servers, hurry, Duration::from_secs(3600)).await.unwrap();
    }
}
