use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::buffer::WriteBuffer;
use crate::command::{CommandKind, Outcome};
use crate::shared::{Arg, ConnId};
use crate::stack::{Shared, SlotState};
use crate::Error;

/// Handle to one logical modem connection
///
/// Cheap to clone; all clones address the same slot occupancy. Every
/// operation revalidates the handle's generation against the live slot under
/// the core lock, so a handle held across a close-and-reuse of its slot
/// degrades into a stale handle instead of silently acting on the slot's new
/// occupant: operations fail with [`Error::InvalidState`] and accessors
/// return their "not connected" answers.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
    pub(crate) id: ConnId,
}

impl Connection {
    /// Generational identifier of this connection
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Stage data in the connection's write buffer, dispatching full chunks
    ///
    /// Bytes accumulate in a buffer of the configured chunk size; a full
    /// buffer (or `flush`) hands the content to the command executor as a
    /// non-blocking send. Input larger than the chunk size is dispatched
    /// directly in full-size chunks. Returns the space left in the staging
    /// buffer after the call: `Ok(0)` with no error means the next staging
    /// buffer could not be allocated, which only matters once more data is
    /// written.
    ///
    /// A zero-length write with `flush` set is a deliberate no-op flush: it
    /// force-creates an empty buffer and immediately releases it.
    pub fn write(&self, data: &[u8], flush: bool) -> Result<usize, Error> {
        let mut rest = data;
        let max_chunk = self.shared.config.max_chunk;

        // Step 1: top up an existing staging buffer, detaching it once it
        // fills or a flush was requested.
        let detached = {
            let mut table = self.shared.state.lock().unwrap();
            let (slot, mem) = table.slot_and_mem(self.id).ok_or(Error::InvalidState)?;
            match slot.buffer.as_mut() {
                Some(buffer) => {
                    let n = buffer.fill(rest);
                    rest = &rest[n..];
                    if buffer.is_full() || flush {
                        let buffer = slot.buffer.take();
                        if let Some(buffer) = &buffer {
                            mem.release(buffer.capacity());
                        }
                        buffer
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(buffer) = detached {
            // Failure to push out a leftover buffer is absorbed: the buffer
            // is freed and the write carries on. An empty leftover (from a
            // previous exact-chunk write) is freed without dispatching.
            if buffer.is_empty() {
                trace!(id = %self.id, "freed empty staging buffer");
            } else if self.submit_send(buffer.into_bytes(), None).is_err() {
                trace!(id = %self.id, "freed staged buffer after failed dispatch");
            }
        }

        // Step 2: dispatch full-size chunks of the remaining input directly.
        while rest.len() >= max_chunk {
            let chunk = Bytes::copy_from_slice(&rest[..max_chunk]);
            if let Err(e) = self.submit_send(chunk, None) {
                trace!(id = %self.id, "freed chunk buffer after failed dispatch");
                return Err(e);
            }
            rest = &rest[max_chunk..];
        }

        // Steps 3 and 4: make sure a staging buffer exists and absorb the
        // remainder. Zero remaining bytes still force-create a buffer so a
        // flush in the same call has something to pick up.
        let (available, flushed) = {
            let mut table = self.shared.state.lock().unwrap();
            let (slot, mem) = table.slot_and_mem(self.id).ok_or(Error::InvalidState)?;
            if slot.buffer.is_none() {
                if mem.charge(max_chunk) {
                    slot.buffer = Some(WriteBuffer::new(max_chunk));
                    trace!(id = %self.id, "allocated staging buffer");
                } else {
                    debug!(id = %self.id, "staging buffer allocation failed");
                }
            }
            if !rest.is_empty() {
                match slot.buffer.as_mut() {
                    Some(buffer) => {
                        buffer.fill(rest);
                    }
                    None => return Err(Error::Memory),
                }
            }
            let flushed = if flush {
                let buffer = slot.buffer.take();
                if let Some(buffer) = &buffer {
                    mem.release(buffer.capacity());
                }
                buffer
            } else {
                None
            };
            let available = slot.buffer.as_ref().map(WriteBuffer::available).unwrap_or(0);
            (available, flushed)
        };
        if let Some(buffer) = flushed {
            if buffer.is_empty() {
                trace!(id = %self.id, "freed empty staging buffer");
            } else if self.submit_send(buffer.into_bytes(), None).is_err() {
                trace!(id = %self.id, "freed staged buffer after failed dispatch");
            }
        }
        Ok(available)
    }

    /// Send data on this connection
    ///
    /// Any staged write-buffer content is completed and flushed first so
    /// bytes leave in program order. In blocking mode, waits for the send
    /// command to complete and returns the number of directly-sent bytes the
    /// modem accepted; in non-blocking mode returns `Ok(0)` once the command
    /// is queued and the byte count arrives later via [`Event::DataSent`].
    ///
    /// [`Event::DataSent`]: crate::Event::DataSent
    pub async fn send(&self, data: &[u8], blocking: bool) -> Result<usize, Error> {
        if data.is_empty() {
            return Err(Error::InvalidState);
        }
        let mut rest = data;
        {
            let mut table = self.shared.state.lock().unwrap();
            let (slot, _) = table.slot_and_mem(self.id).ok_or(Error::InvalidState)?;
            if let Some(buffer) = slot.buffer.as_mut() {
                let n = buffer.fill(rest);
                rest = &rest[n..];
            }
        }
        let flushed = self.flush_staged();
        if rest.is_empty() {
            return flushed.map(|_| 0);
        }
        self.send_direct(Bytes::copy_from_slice(rest), None, blocking)
            .await
    }

    /// Send a datagram to a specific remote address
    ///
    /// Only meaningful on UDP connections; without an explicit remote the
    /// executor falls back to plain send behavior. Flushes any staged write
    /// data first.
    pub async fn send_to(
        &self,
        remote: SocketAddr,
        data: &[u8],
        blocking: bool,
    ) -> Result<usize, Error> {
        if data.is_empty() {
            return Err(Error::InvalidState);
        }
        let _ = self.flush_staged();
        self.send_direct(Bytes::copy_from_slice(data), Some(remote), blocking)
            .await
    }

    /// Request closure of this connection
    ///
    /// Rejected before anything is queued if the connection is already
    /// closing or no longer active, so at most one close command is ever
    /// outstanding. Staged write data is flushed first, best-effort. When
    /// queued in non-blocking mode the connection is marked closing
    /// immediately, without waiting for the modem to confirm.
    pub async fn close(&self, blocking: bool) -> Result<(), Error> {
        {
            let mut table = self.shared.state.lock().unwrap();
            let (slot, _) = table.slot_and_mem(self.id).ok_or(Error::InvalidState)?;
            if slot.state != SlotState::Active {
                return Err(Error::InvalidState);
            }
        }
        let _ = self.flush_staged();
        let result = self
            .shared
            .dispatcher
            .dispatch(
                CommandKind::Close,
                Some(self.id),
                blocking,
                self.shared.config.status_timeout,
            )
            .await;
        if result.is_ok() && !blocking {
            let mut table = self.shared.state.lock().unwrap();
            if let Some((slot, _)) = table.slot_and_mem(self.id) {
                trace!(id = %self.id, "connection set to closing state");
                slot.state = SlotState::Closing;
            }
        }
        result.map(|_| ())
    }

    /// Acknowledge receipt of `len` bytes in manual-receive mode
    ///
    /// A no-op unless [`Config::manual_receive`] is enabled. Once all
    /// announced data has been acknowledged the executor may request more
    /// from the modem.
    ///
    /// [`Config::manual_receive`]: crate::Config::manual_receive
    pub fn ack_received(&self, len: usize) -> Result<(), Error> {
        if !self.shared.config.manual_receive {
            return Ok(());
        }
        let mut table = self.shared.state.lock().unwrap();
        let (slot, _) = table.slot_and_mem(self.id).ok_or(Error::InvalidState)?;
        slot.manual_unacked = slot.manual_unacked.saturating_sub(len);
        Ok(())
    }

    /// Bytes received but not yet acknowledged in manual-receive mode
    pub fn unacked_received(&self) -> usize {
        let table = self.shared.state.lock().unwrap();
        table.get(self.id).map(|s| s.manual_unacked).unwrap_or(0)
    }

    /// Whether this handle refers to a live client-side connection
    pub fn is_client(&self) -> bool {
        let table = self.shared.state.lock().unwrap();
        table
            .get(self.id)
            .map(|s| s.state != SlotState::Closed && s.client)
            .unwrap_or(false)
    }

    /// Whether this handle refers to a live server-side connection
    pub fn is_server(&self) -> bool {
        let table = self.shared.state.lock().unwrap();
        table
            .get(self.id)
            .map(|s| s.state != SlotState::Closed && s.server)
            .unwrap_or(false)
    }

    /// Whether the connection is still active (including while closing)
    pub fn is_active(&self) -> bool {
        let table = self.shared.state.lock().unwrap();
        table
            .get(self.id)
            .map(|s| s.state != SlotState::Closed)
            .unwrap_or(false)
    }

    /// Whether the connection has fully closed (or the handle is stale)
    pub fn is_closed(&self) -> bool {
        !self.is_active()
    }

    /// Slot number of this connection, if the handle is still current
    pub fn slot(&self) -> Option<usize> {
        // The slot number itself never changes; only its occupancy does.
        let table = self.shared.state.lock().unwrap();
        table.get(self.id).map(|_| self.id.slot)
    }

    /// Remote endpoint address, populated on connect/accept
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        let table = self.shared.state.lock().unwrap();
        table.get(self.id).and_then(|s| s.remote)
    }

    /// Remote port, or 0 if unknown or the handle is stale
    pub fn remote_port(&self) -> u16 {
        self.remote_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Local port, or 0 if unknown or the handle is stale
    pub fn local_port(&self) -> u16 {
        let table = self.shared.state.lock().unwrap();
        table.get(self.id).map(|s| s.local_port).unwrap_or(0)
    }

    /// Application argument attached to this connection
    pub fn arg(&self) -> Option<Arg> {
        let table = self.shared.state.lock().unwrap();
        table.get(self.id).and_then(|s| s.arg.clone())
    }

    /// Attach an application argument to this connection
    pub fn set_arg(&self, arg: Option<Arg>) -> Result<(), Error> {
        let mut table = self.shared.state.lock().unwrap();
        let (slot, _) = table.slot_and_mem(self.id).ok_or(Error::InvalidState)?;
        slot.arg = arg;
        Ok(())
    }

    /// Total bytes ever received on this connection and handed to the
    /// application
    pub fn total_received(&self) -> u64 {
        let table = self.shared.state.lock().unwrap();
        table.get(self.id).map(|s| s.total_received).unwrap_or(0)
    }

    /// Detach the staging buffer and hand any pending content to the
    /// executor
    ///
    /// A detached buffer never returns to the connection: on dispatch
    /// failure (or empty content) it is freed here. No buffer at all is a
    /// success; a buffer with nothing staged reports `InvalidState`.
    fn flush_staged(&self) -> Result<(), Error> {
        let detached = {
            let mut table = self.shared.state.lock().unwrap();
            match table.slot_and_mem(self.id) {
                Some((slot, mem)) => {
                    let buffer = slot.buffer.take();
                    if let Some(buffer) = &buffer {
                        mem.release(buffer.capacity());
                    }
                    buffer
                }
                None => None,
            }
        };
        let buffer = match detached {
            Some(buffer) => buffer,
            None => return Ok(()),
        };
        if buffer.is_empty() {
            trace!(id = %self.id, "freed empty staging buffer");
            return Err(Error::InvalidState);
        }
        match self.submit_send(buffer.into_bytes(), None) {
            Ok(()) => Ok(()),
            Err(e) => {
                trace!(id = %self.id, "freed staged buffer after failed dispatch");
                Err(e)
            }
        }
    }

    /// Non-blocking send used by the staging pipeline; ownership of `data`
    /// moves into the envelope
    fn submit_send(&self, data: Bytes, remote: Option<SocketAddr>) -> Result<(), Error> {
        self.shared
            .dispatcher
            .submit(CommandKind::Send { data, remote }, Some(self.id))
    }

    async fn send_direct(
        &self,
        data: Bytes,
        remote: Option<SocketAddr>,
        blocking: bool,
    ) -> Result<usize, Error> {
        match self
            .shared
            .dispatcher
            .dispatch(
                CommandKind::Send { data, remote },
                Some(self.id),
                blocking,
                self.shared.config.send_timeout,
            )
            .await?
        {
            Outcome::Sent(n) => Ok(n),
            _ => Ok(0),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}
