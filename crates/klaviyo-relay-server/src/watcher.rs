//! Credential Store change detection.
//!
//! Polls the store's mtime. A change the slot did not make itself is given a
//! settle delay before reloading so a writer that is still mid-write is not
//! read half-finished. This narrows the race with external writers but does
//! not close it; atomic-rename publishing on the writer side does.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::state::SessionSlot;

/// Period used when a zero watch interval is passed in.
pub const FALLBACK_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `slot`'s store every `interval` until `shutdown` resolves.
pub async fn watch_store<S>(
    slot: Arc<SessionSlot>,
    interval: Duration,
    settle: Duration,
    shutdown: S,
) where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let interval = if interval.is_zero() {
        warn!(
            fallback_secs = FALLBACK_WATCH_INTERVAL.as_secs(),
            "Zero watch interval, using fallback"
        );
        FALLBACK_WATCH_INTERVAL
    } else {
        interval
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(
        path = %slot.store().path().display(),
        interval_secs = interval.as_secs(),
        "Watching credential store"
    );

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        if !slot.changed() {
            continue;
        }

        info!(
            settle_secs = settle.as_secs(),
            "Credential store changed externally, waiting before reload"
        );

        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(settle) => {}
        }

        // A save during the settle delay moves the baseline; nothing to do then.
        if !slot.changed() {
            continue;
        }

        if let Err(e) = slot.reload() {
            warn!(error = %e, "Reload after external change failed");
        }
    }

    debug!("Credential store watcher stopped");
}
