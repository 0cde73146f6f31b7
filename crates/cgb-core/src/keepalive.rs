use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ports::{QueryParams, QueryTransport};

/// Harmless query issued to keep an idle query connection open.
pub const KEEPALIVE_COMMAND: &str = "version";

/// Issue [`KEEPALIVE_COMMAND`] every `period` until `cancel` fires.
///
/// The first query goes out one full period after start. Failures are logged
/// and the loop keeps going.
pub(crate) fn spawn(
    transport: Arc<dyn QueryTransport>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = tick.tick() => {
                match transport.request(KEEPALIVE_COMMAND, QueryParams::new(), &[]).await {
                  Ok(_) => debug!("keep-alive sent"),
                  Err(e) => warn!(error = %e, "keep-alive failed"),
                }
              }
            }
        }
        debug!("keep-alive stopped");
    })
}
