//! Resubscription after connection loss.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ReconnectPolicy;
use crate::status::ConnectionMonitor;
use crate::transport::{InboundStream, Transport};

/// Wait for the connection to come back and consume `destination` again.
///
/// Returns `None` once `cancel` fires.
pub(crate) async fn resubscribe(
    transport: &Arc<dyn Transport>,
    destination: &str,
    monitor: &ConnectionMonitor,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
) -> Option<InboundStream> {
    let mut attempt: u32 = 0;
    loop {
        if !monitor.wait_connected(cancel).await {
            return None;
        }
        match transport.consume(destination).await {
            Ok(stream) => {
                debug!(destination, attempt, "resubscribed");
                return Some(stream);
            }
            Err(err) => {
                // The state may still read as connected until the loss is observed.
                let delay = policy.delay_for(attempt);
                debug!(destination, error = %err, ?delay, "resubscribe failed");
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
