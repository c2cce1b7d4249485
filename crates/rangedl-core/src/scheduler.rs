//! Periodic runner - fixed-delay background jobs
//!
//! Drives the orchestrator tick and the meter recompute. A run is awaited
//! before the next tick is taken, so one job never overlaps itself.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn `job` every `period` until `shutdown` fires.
///
/// The first run happens immediately. A run that overshoots the period
/// pushes the schedule back instead of bursting to catch up.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    info!("Starting periodic job {} every {:?}", name, period);

    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            debug!("Periodic job {} running", name);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = job() => {}
            }
        }

        info!("Periodic job {} stopped", name);
    })
}
