//! Side effects that must never fail the operation that triggered them.

use std::fmt::Display;
use std::future::Future;

use tokio::task::JoinHandle;

/// Runs `future` on its own task. A failure is logged at warn and dropped.
pub fn spawn<F, E>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(error) = future.await {
            tracing::warn!(
                event_name = "worker.best_effort.failed",
                side_effect = name,
                error = %error,
                "best-effort side effect failed"
            );
        }
    })
}
