use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::buffer::WriteBuffer;
use crate::command::{CommandKind, CommandQueue, Dispatcher, Outcome, StartRequest};
use crate::config::Config;
use crate::connection::Connection;
use crate::poll;
use crate::shared::{Arg, ConnId, ConnKind, Event, EventStream};
use crate::Error;

/// Core state shared by every handle: the connection table behind the core
/// lock, plus the channels into the executor and out to the application
///
/// The lock is held only for short scoped sections and never across a queue
/// submission or a blocking wait.
pub(crate) struct Shared {
    pub(crate) state: Mutex<ConnTable>,
    pub(crate) dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<Event>,
    pub(crate) config: Config,
}

impl Shared {
    /// Deliver an event to the application before returning control to
    /// whichever context raised it
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Whether the application has dropped its [`EventStream`]
    pub(crate) fn events_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Lifecycle state of one slot occupancy
///
/// `Closing` is entered only from `Active` by an accepted close request;
/// `Closed` is reached once the executor reports the close complete (or the
/// remote side closed the connection) and makes the slot eligible for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Closed,
    Active,
    Closing,
}

/// Storage for one connection slot, reused across connection lifetimes
pub(crate) struct Slot {
    pub(crate) generation: u8,
    pub(crate) state: SlotState,
    pub(crate) kind: ConnKind,
    pub(crate) client: bool,
    pub(crate) server: bool,
    pub(crate) buffer: Option<WriteBuffer>,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) local_port: u16,
    pub(crate) arg: Option<Arg>,
    pub(crate) total_received: u64,
    pub(crate) manual_unacked: usize,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            generation: 0,
            state: SlotState::Closed,
            kind: ConnKind::Tcp,
            client: false,
            server: false,
            buffer: None,
            remote: None,
            local_port: 0,
            arg: None,
            total_received: 0,
            manual_unacked: 0,
        }
    }
}

/// Budget for staging-buffer memory, standing in for a fallible allocator
///
/// Only buffers held inside the table count; ownership handed to the command
/// executor releases the charge.
#[derive(Debug)]
pub(crate) struct MemBudget {
    limit: usize,
    used: usize,
}

impl MemBudget {
    pub(crate) fn charge(&mut self, n: usize) -> bool {
        if self.used + n <= self.limit {
            self.used += n;
            true
        } else {
            false
        }
    }

    pub(crate) fn release(&mut self, n: usize) {
        self.used = self.used.saturating_sub(n);
    }
}

/// Fixed arena of connection slots, guarded by the core lock
pub(crate) struct ConnTable {
    slots: Box<[Slot]>,
    mem: MemBudget,
}

impl ConnTable {
    fn new(config: &Config) -> Self {
        Self {
            slots: (0..config.max_conns)
                .map(|_| Slot::default())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            mem: MemBudget {
                limit: config.buffer_memory,
                used: 0,
            },
        }
    }

    /// Look up a slot if the handle's generation is still current
    pub(crate) fn get(&self, id: ConnId) -> Option<&Slot> {
        self.slots
            .get(id.slot)
            .filter(|slot| slot.generation == id.generation)
    }

    /// Mutable lookup for operations, rejecting stale handles and closed
    /// slots; the memory budget is handed out alongside so callers can
    /// account buffer transfers under the same lock scope
    pub(crate) fn slot_and_mem(&mut self, id: ConnId) -> Option<(&mut Slot, &mut MemBudget)> {
        let slot = self.slots.get_mut(id.slot)?;
        if slot.generation != id.generation || slot.state == SlotState::Closed {
            return None;
        }
        Some((slot, &mut self.mem))
    }

    /// Assign a closed slot to a new logical connection
    ///
    /// This is the one place the validation counter advances: handles held
    /// across a close-then-reuse stay distinguishable from the new occupant.
    #[allow(clippy::too_many_arguments)]
    fn open(
        &mut self,
        slot: usize,
        kind: ConnKind,
        client: bool,
        server: bool,
        remote: Option<SocketAddr>,
        local_port: u16,
        arg: Option<Arg>,
    ) -> Result<ConnId, Error> {
        let s = self.slots.get_mut(slot).ok_or(Error::InvalidState)?;
        if s.state != SlotState::Closed {
            return Err(Error::InvalidState);
        }
        debug_assert!(s.buffer.is_none());
        s.generation = s.generation.wrapping_add(1);
        s.state = SlotState::Active;
        s.kind = kind;
        s.client = client;
        s.server = server;
        s.remote = remote;
        s.local_port = local_port;
        s.arg = arg;
        s.total_received = 0;
        s.manual_unacked = 0;
        Ok(ConnId {
            slot,
            generation: s.generation,
        })
    }
}

/// Entry point of the connection layer
///
/// [`Stack::new`] returns the stack together with the [`CommandQueue`] the
/// command executor drains and the [`EventStream`] the application consumes.
/// The stack itself is a cheap clonable handle; the executor-facing methods
/// (`connection_opened` and friends) are how the out-of-scope AT executor
/// reports asynchronous outcomes back into the state machine.
#[derive(Clone)]
pub struct Stack {
    pub(crate) shared: Arc<Shared>,
}

impl Stack {
    /// Create a connection layer with the given configuration
    pub fn new(config: Config) -> (Self, CommandQueue, EventStream) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.queue_depth);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnTable::new(&config)),
            dispatcher: Dispatcher::new(cmd_tx),
            events: event_tx,
            config,
        });
        (
            Self { shared },
            CommandQueue { rx: cmd_rx },
            EventStream { rx: event_rx },
        )
    }

    /// Start a new outgoing connection
    ///
    /// In blocking mode, waits for the executor to confirm the connection and
    /// returns the handle. In non-blocking mode returns `Ok(None)` once the
    /// start command is queued; the handle is delivered later via
    /// [`Event::Active`].
    pub async fn connect(
        &self,
        kind: ConnKind,
        host: &str,
        port: u16,
        arg: Option<Arg>,
        blocking: bool,
    ) -> Result<Option<Connection>, Error> {
        if host.is_empty() || port == 0 {
            return Err(Error::InvalidState);
        }
        let request = StartRequest {
            kind,
            host: host.to_owned(),
            port,
            arg,
        };
        match self
            .shared
            .dispatcher
            .dispatch(
                CommandKind::Start(request),
                None,
                blocking,
                self.shared.config.send_timeout,
            )
            .await?
        {
            Outcome::Opened(conn) => Ok(Some(conn)),
            _ => Ok(None),
        }
    }

    /// Queue a refresh of all connection states
    pub async fn request_status(&self, blocking: bool) -> Result<(), Error> {
        self.shared
            .dispatcher
            .dispatch(
                CommandKind::Status,
                None,
                blocking,
                self.shared.config.status_timeout,
            )
            .await
            .map(|_| ())
    }

    /// Whether a captured connection reference still addresses the live
    /// occupant of its slot
    ///
    /// The command executor must call this immediately before acting on a
    /// queued command and discard the command as a no-op on `false`; this is
    /// what keeps a command submitted against a recycled slot from touching
    /// the slot's new connection.
    pub fn is_current(&self, id: ConnId) -> bool {
        let table = self.shared.state.lock().unwrap();
        table.get(id).is_some()
    }

    /// Executor report: a start command succeeded and the modem assigned
    /// `slot` to the connection described by `request`
    ///
    /// Allocates the slot, emits [`Event::Active`], and arms the poll timer.
    /// Fails if the slot is out of range or still occupied.
    pub fn connection_opened(
        &self,
        slot: usize,
        remote: Option<SocketAddr>,
        request: &StartRequest,
    ) -> Result<Connection, Error> {
        self.open(
            slot,
            request.kind,
            true,
            false,
            remote,
            0,
            request.arg.clone(),
        )
    }

    /// Executor report: the modem accepted an incoming connection on `slot`
    ///
    /// Same as [`connection_opened`](Self::connection_opened) but with the
    /// server role bit set and no start request to draw arguments from.
    pub fn connection_accepted(
        &self,
        slot: usize,
        kind: ConnKind,
        remote: Option<SocketAddr>,
        local_port: u16,
    ) -> Result<Connection, Error> {
        self.open(slot, kind, false, true, remote, local_port, None)
    }

    fn open(
        &self,
        slot: usize,
        kind: ConnKind,
        client: bool,
        server: bool,
        remote: Option<SocketAddr>,
        local_port: u16,
        arg: Option<Arg>,
    ) -> Result<Connection, Error> {
        let conn = {
            let mut table = self.shared.state.lock().unwrap();
            let id = table.open(slot, kind, client, server, remote, local_port, arg)?;
            Connection {
                shared: self.shared.clone(),
                id,
            }
        };
        debug!(id = %conn.id(), "connection active");
        self.shared.emit(Event::Active(conn.clone()));
        poll::schedule(self.shared.clone(), conn.id());
        Ok(conn)
    }

    /// Executor report: the connection occupying `slot` is gone, either
    /// because its close command completed or because the remote side closed
    /// it
    ///
    /// Frees any staged write buffer, marks the slot eligible for reuse, and
    /// emits [`Event::Closed`] carrying a handle to the ended occupancy.
    pub fn connection_closed(&self, slot: usize) {
        let conn = {
            let mut table = self.shared.state.lock().unwrap();
            let ConnTable { slots, mem } = &mut *table;
            let s = match slots.get_mut(slot) {
                Some(s) if s.state != SlotState::Closed => s,
                _ => return,
            };
            if let Some(buffer) = s.buffer.take() {
                mem.release(buffer.capacity());
            }
            s.state = SlotState::Closed;
            s.arg = None;
            Connection {
                shared: self.shared.clone(),
                id: ConnId {
                    slot,
                    generation: s.generation,
                },
            }
        };
        debug!(id = %conn.id(), "connection closed");
        self.shared.emit(Event::Closed(conn));
    }

    /// Executor report: `data` arrived on `slot`
    ///
    /// Advances the received-byte counter (and, in manual-receive mode, the
    /// unacknowledged total) and emits [`Event::DataReceived`].
    pub fn data_received(&self, slot: usize, data: Bytes) {
        let conn = {
            let mut table = self.shared.state.lock().unwrap();
            let s = match table.slots.get_mut(slot) {
                Some(s) if s.state != SlotState::Closed => s,
                _ => return,
            };
            s.total_received += data.len() as u64;
            if self.shared.config.manual_receive {
                s.manual_unacked += data.len();
            }
            Connection {
                shared: self.shared.clone(),
                id: ConnId {
                    slot,
                    generation: s.generation,
                },
            }
        };
        trace!(id = %conn.id(), bytes = data.len(), "data received");
        self.shared.emit(Event::DataReceived { conn, data });
    }

    /// Executor report: a send on `slot` completed, transmitting `bytes`
    pub fn data_sent(&self, slot: usize, bytes: usize) {
        let conn = {
            let table = self.shared.state.lock().unwrap();
            let s = match table.slots.get(slot) {
                Some(s) if s.state != SlotState::Closed => s,
                _ => return,
            };
            Connection {
                shared: self.shared.clone(),
                id: ConnId {
                    slot,
                    generation: s.generation,
                },
            }
        };
        trace!(id = %conn.id(), bytes, "data sent");
        self.shared.emit(Event::DataSent { conn, bytes });
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack").finish_non_exhaustive()
    }
}
