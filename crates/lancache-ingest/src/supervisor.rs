//! Supervised background tasks.
//!
//! Replaces child-process polling with an in-process supervisor: the
//! factory builds a fresh future for each attempt, failures (errors or
//! panics) restart it after a backed-off delay, and the shared
//! shutdown token ends the loop cooperatively.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;

/// First restart delay; doubles per consecutive failure.
const RESTART_DELAY: Duration = Duration::from_secs(5);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);
/// A run lasting at least this long resets the backoff.
const STABLE_RUN: Duration = Duration::from_secs(60);

/// Spawn `factory`'s future and keep it running until `shutdown`.
pub fn spawn_supervised<F, Fut>(
    name: impl Into<String>,
    shutdown: CancellationToken,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        let mut delay = RESTART_DELAY;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let started = tokio::time::Instant::now();
            // Inner spawn so a panic is contained as a JoinError.
            let task = tokio::spawn(factory());

            let outcome = tokio::select! {
                joined = task => joined,
                () = shutdown.cancelled() => {
                    // The task watches the same token; give it a moment
                    // to wind down on its own.
                    break;
                }
            };

            match outcome {
                Ok(Ok(())) => {
                    info!(task = %name, "background task exited cleanly");
                    if shutdown.is_cancelled() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!(task = %name, "background task failed: {e}");
                }
                Err(join_error) => {
                    error!(task = %name, "background task panicked: {join_error}");
                }
            }

            if started.elapsed() >= STABLE_RUN {
                delay = RESTART_DELAY;
            }
            warn!(task = %name, "restarting in {delay:?}");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.cancelled() => break,
            }
            delay = (delay * 2).min(MAX_RESTART_DELAY);
        }
        info!(task = %name, "supervisor stopped");
    })
}
