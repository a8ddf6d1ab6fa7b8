//! Periodic background loops.

use crate::metrics;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Run `tick` every `interval` until the runtime shuts down.
///
/// Each tick runs in its own task: an error is logged, a panic is caught at
/// the join handle, and in both cases the loop carries on with the next tick.
/// Ticks never overlap; a tick that overruns the interval skips the missed
/// ones.
pub fn spawn_loop<F, Fut, E>(name: &'static str, interval: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!(loop_name = name, interval_secs = interval.as_secs(), "Background loop started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;

            match tokio::spawn(tick()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics::record_tick_failure(name);
                    tracing::error!(loop_name = name, error = %e, "Background tick failed");
                }
                Err(join_err) if join_err.is_panic() => {
                    metrics::record_tick_failure(name);
                    tracing::error!(loop_name = name, panic = ?join_err, "Background tick panicked");
                }
                Err(join_err) => {
                    tracing::warn!(loop_name = name, error = %join_err, "Background tick cancelled");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_loop_survives_errors_and_panics() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();

        let handle = spawn_loop("test", Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => Err("first tick fails".to_string()),
                    1 => panic!("second tick panics"),
                    _ => Ok(()),
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while ticks.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(!handle.is_finished());
        handle.abort();
    }
}
