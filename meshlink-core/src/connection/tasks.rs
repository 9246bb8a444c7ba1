//! Background tasks owned by a connection: the signal poller and the drain worker.
//! Both are aborted by the connection when it tears down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::link::Command;
use crate::device::DeviceId;
use crate::hardware::RadioCentral;

/// Ask the stack for the link's signal strength every `interval`.
/// Results come back as `SignalRead` hardware events.
pub(crate) fn spawn_signal_poller(
    central: Arc<dyn RadioCentral>,
    id: DeviceId,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            trace!(device = %id, "Polling signal strength");
            central.read_signal(&id);
        }
    })
}

/// Single consumer of "data available" notifications.
///
/// Each wake runs one drain pass: read FROMRADIO until it returns an empty
/// frame, handing every non-empty frame back to the connection. `Notify`
/// stores at most one permit, so notifications that arrive during a pass
/// collapse into exactly one follow-up pass and two passes never overlap.
pub(crate) fn spawn_drain_worker(
    inbox: mpsc::UnboundedSender<Command>,
    wake: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            wake.notified().await;

            let mut frames = 0usize;
            loop {
                let (tx, rx) = oneshot::channel();
                if inbox.send(Command::Read(tx)).is_err() {
                    return;
                }
                match rx.await {
                    Ok(Ok(frame)) if frame.is_empty() => break,
                    Ok(Ok(frame)) => {
                        frames += 1;
                        if inbox.send(Command::Deliver(frame)).is_err() {
                            return;
                        }
                    }
                    Ok(Err(e)) => {
                        debug!("Drain stopped: {}", e);
                        return;
                    }
                    Err(_) => return,
                }
            }
            trace!(frames, "Drain pass complete");
        }
    })
}
