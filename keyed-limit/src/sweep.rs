use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cadence of the background staleness sweeps.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// State older than this is considered abandoned by strategies that judge
/// staleness by last activity rather than window expiry.
pub(crate) const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Runs `sweep` every `every`, starting one full period after spawn, until
/// the shutdown signal fires.
///
/// The loop also exits when the [`watch::Sender`] side is dropped, so a
/// strategy that is dropped without `close` cannot leak its task.
pub(crate) fn spawn_sweep<F>(
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut sweep: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let first = tokio::time::Instant::now() + every;
        let mut ticker = tokio::time::interval_at(first, every);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => sweep(),
            }
        }
    })
}
