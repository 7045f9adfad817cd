//! Connection-management layer for AT-command driven cellular modems
//!
//! A GSM/GPRS modem executes AT commands one at a time over a single serial
//! channel, while exposing several logical TCP/UDP sockets. This crate is the
//! bridge between synchronous-looking application calls (`send`, `close`,
//! `write`) and that single command channel: it stages application writes into
//! modem-sized chunks, owns the per-connection lifecycle state machine, and
//! multiplexes every operation through one producer queue of [`Command`]
//! envelopes.
//!
//! The crate performs no serial I/O itself. An external command executor pulls
//! envelopes from the [`CommandQueue`], talks to the modem, and reports results
//! back through the executor-facing methods on [`Stack`]
//! ([`connection_opened`], [`connection_closed`], [`data_received`], ...).
//! Completions for blocking calls travel back through the envelope itself;
//! everything else is delivered to the application as an [`Event`].
//!
//! Connections are addressed by generational handles: a [`ConnId`] pairs the
//! fixed slot number the modem assigned with a validation counter that is
//! bumped every time the slot is recycled. A command queued against a
//! connection that has since been closed and reused is rejected by the
//! executor's [`Stack::is_current`] check instead of corrupting the slot's new
//! occupant.
//!
//! [`connection_opened`]: Stack::connection_opened
//! [`connection_closed`]: Stack::connection_closed
//! [`data_received`]: Stack::data_received

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod buffer;
mod command;
mod config;
mod connection;
mod poll;
mod shared;
mod stack;

#[cfg(test)]
mod tests;

pub use crate::command::{Command, CommandKind, CommandQueue, Outcome, StartRequest};
pub use crate::config::Config;
pub use crate::connection::Connection;
pub use crate::shared::{Arg, ConnId, ConnKind, Event, EventStream};
pub use crate::stack::Stack;

/// Result codes shared by every operation in this layer
///
/// State conflicts are detected before any command is queued and reported
/// synchronously; all other failures surface from the dispatch path. Nothing
/// is retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The operation conflicts with the connection's current state, the
    /// handle is stale, or an argument is invalid (e.g. a zero-length send)
    #[error("invalid connection state or argument")]
    InvalidState,
    /// Staging-buffer or command-envelope allocation failed
    ///
    /// Raised when the staging memory budget is exhausted while live data
    /// still needs a buffer, or when the producer queue is full.
    #[error("out of memory")]
    Memory,
    /// A blocking command did not complete before its deadline
    #[error("timed out")]
    Timeout,
    /// The command executor is gone; no further commands can complete
    #[error("command queue closed")]
    Shutdown,
}
