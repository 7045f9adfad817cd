use std::{any::Any, fmt, sync::Arc};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::Connection;

/// Opaque application argument attached to a connection
///
/// Stored by reference and never interpreted by this layer.
pub type Arg = Arc<dyn Any + Send + Sync>;

/// Generational reference to a connection slot
///
/// The slot number is the array index the modem assigned and stays fixed for
/// the lifetime of the slot; the generation is bumped every time the slot is
/// recycled for a new logical connection. Two `ConnId`s are equal only if
/// they refer to the same occupancy of the same slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub(crate) slot: usize,
    pub(crate) generation: u8,
}

impl ConnId {
    /// Slot number, usable as an array index
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Validation counter for this occupancy of the slot
    pub fn generation(&self) -> u8 {
        self.generation
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

/// Transport type of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// TCP stream connection
    Tcp,
    /// UDP datagram connection
    Udp,
    /// TLS-wrapped TCP connection, where the modem supports it
    Ssl,
}

/// Events delivered to the application
///
/// Emitted synchronously from whichever context raised them, outside the core
/// lock, and consumed through an [`EventStream`].
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection became active
    ///
    /// For a non-blocking start this is how the application first obtains the
    /// connection handle.
    Active(Connection),
    /// A connection fully closed; its slot may be reused afterwards
    Closed(Connection),
    /// Data arrived on a connection
    DataReceived {
        /// Connection the data arrived on
        conn: Connection,
        /// Received payload
        data: Bytes,
    },
    /// A send command completed
    DataSent {
        /// Connection the data was sent on
        conn: Connection,
        /// Number of payload bytes the modem accepted
        bytes: usize,
    },
    /// Periodic poll for a still-active connection
    Poll(Connection),
}

impl Event {
    /// The connection this event concerns
    pub fn conn(&self) -> &Connection {
        match self {
            Self::Active(conn)
            | Self::Closed(conn)
            | Self::DataReceived { conn, .. }
            | Self::DataSent { conn, .. }
            | Self::Poll(conn) => conn,
        }
    }
}

/// Receiving half of the application event channel
pub struct EventStream {
    pub(crate) rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Wait for the next event
    ///
    /// Returns `None` once the [`Stack`](crate::Stack) and every outstanding
    /// handle have been dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}
