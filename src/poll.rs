use std::sync::Arc;

use tokio::time::sleep;
use tracing::trace;

use crate::connection::Connection;
use crate::shared::{ConnId, Event};
use crate::stack::{Shared, SlotState};

/// Arm the recurring poll timeout for a freshly opened connection
///
/// Each expiry re-checks the slot under the core lock: while the occupancy
/// identified by `id` is still active, a poll event is emitted and the timer
/// re-arms for another interval. Once the connection is closing, closed, or
/// the slot has been recycled, the timer simply does not re-arm and the
/// chain terminates without any cancellation bookkeeping. The chain also
/// ends when the application drops its event stream, so an abandoned stack
/// does not keep ticking.
pub(crate) fn schedule(shared: Arc<Shared>, id: ConnId) {
    tokio::spawn(async move {
        loop {
            sleep(shared.config.poll_interval).await;
            if shared.events_closed() {
                break;
            }
            let conn = {
                let table = shared.state.lock().unwrap();
                match table.get(id) {
                    Some(slot) if slot.state == SlotState::Active => Some(Connection {
                        shared: shared.clone(),
                        id,
                    }),
                    _ => None,
                }
            };
            match conn {
                Some(conn) => {
                    trace!(id = %id, "poll event");
                    shared.emit(Event::Poll(conn));
                }
                None => break,
            }
        }
    });
}
