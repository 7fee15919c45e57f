//! Periodic collection driver
//!
//! Runs [`Session::collect_profiles`] every `period` on the blocking pool
//! until shutdown is signalled or the session is stopped. Stopping the session
//! stays with the caller.

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::lifecycle::Session;
use super::sample::ProfileSample;
use crate::domain::SessionError;

/// Spawn the collection loop on the current runtime
///
/// Send `true` (or drop the sender) on `shutdown` to end the loop after the
/// in-flight round.
pub fn spawn_collection_loop<F>(
    session: Arc<Session>,
    period: Duration,
    mut sink: F,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    F: FnMut(ProfileSample) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!("Collection loop shutting down");
                    break;
                }
            }

            let round_session = session.clone();
            let round = tokio::task::spawn_blocking(move || {
                let result = round_session.collect_profiles(&mut sink);
                (sink, result)
            })
            .await;

            match round {
                Ok((returned, result)) => {
                    sink = returned;
                    match result {
                        Ok(()) => {}
                        Err(SessionError::Stopped | SessionError::NotStarted) => {
                            debug!("Session not running, collection loop exiting");
                            break;
                        }
                        Err(e) => warn!("Collection round failed: {e}"),
                    }
                }
                Err(e) => {
                    warn!("Collection round panicked: {e}");
                    break;
                }
            }
        }
    })
}
