use std::{fmt, net::SocketAddr, time::Duration};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::connection::Connection;
use crate::shared::{Arg, ConnId, ConnKind};
use crate::Error;

/// Parameters of a queued connection start
pub struct StartRequest {
    /// Transport type to open
    pub kind: ConnKind,
    /// Remote host, as a domain name or textual IP address
    pub host: String,
    /// Remote port
    pub port: u16,
    pub(crate) arg: Option<Arg>,
}

impl fmt::Debug for StartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartRequest")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Operation carried by a [`Command`] envelope
#[derive(Debug)]
pub enum CommandKind {
    /// Open a new connection
    Start(StartRequest),
    /// Send a payload on an existing connection
    ///
    /// The payload is owned by the envelope; whoever drops the envelope (or
    /// the extracted payload) last releases the memory.
    Send {
        /// Bytes to transmit
        data: Bytes,
        /// Explicit destination for UDP sends; `None` sends to the
        /// connection's established remote
        remote: Option<SocketAddr>,
    },
    /// Close the addressed connection
    Close,
    /// Refresh the status of all connections
    Status,
}

/// Result of a completed command, delivered to a blocking waiter
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A start command completed and produced a connection
    Opened(Connection),
    /// A send command completed, transmitting this many payload bytes
    Sent(usize),
    /// The command completed without further detail
    Done,
}

/// Command envelope submitted to the producer queue
///
/// The executor inspects the envelope with [`kind`](Self::kind), re-checks
/// [`conn`](Self::conn) against the live slot via
/// [`Stack::is_current`](crate::Stack::is_current) immediately before acting,
/// and terminates the envelope with [`complete`](Self::complete). Dropping an
/// envelope without completing it fails any blocking waiter with
/// [`Error::Shutdown`].
pub struct Command {
    pub(crate) kind: CommandKind,
    pub(crate) conn: Option<ConnId>,
    pub(crate) completion: Option<oneshot::Sender<Result<Outcome, Error>>>,
}

impl Command {
    /// The operation this envelope carries
    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Connection reference captured when the command was submitted
    ///
    /// `None` for commands not addressed at a single connection. A stale
    /// reference must make the executor discard the command as a no-op.
    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    /// Report the terminal status of this command
    ///
    /// A no-op if the command was submitted in non-blocking mode or the
    /// waiter has given up.
    pub fn complete(mut self, result: Result<Outcome, Error>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("conn", &self.conn)
            .field("blocking", &self.completion.is_some())
            .finish()
    }
}

/// Consumer half of the producer queue, owned by the command executor
pub struct CommandQueue {
    pub(crate) rx: mpsc::Receiver<Command>,
}

impl CommandQueue {
    /// Wait for the next command envelope
    ///
    /// Returns `None` once every submitting handle has been dropped.
    pub async fn recv(&mut self) -> Option<Command> {
        self.rx.recv().await
    }

    /// Take the next envelope if one is already queued
    pub fn try_recv(&mut self) -> Option<Command> {
        self.rx.try_recv().ok()
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue").finish_non_exhaustive()
    }
}

/// Submitting half of the producer queue
///
/// Submission never waits for queue space: a full queue means no envelope
/// can be allocated and reports [`Error::Memory`]. Blocking mode waits for
/// the executor to complete the envelope, bounded by the per-command
/// deadline.
pub(crate) struct Dispatcher {
    tx: mpsc::Sender<Command>,
}

impl Dispatcher {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Submit without waiting for completion
    pub(crate) fn submit(&self, kind: CommandKind, conn: Option<ConnId>) -> Result<(), Error> {
        self.send(Command {
            kind,
            conn,
            completion: None,
        })
    }

    /// Submit and, in blocking mode, wait for the terminal status
    pub(crate) async fn dispatch(
        &self,
        kind: CommandKind,
        conn: Option<ConnId>,
        blocking: bool,
        deadline: Duration,
    ) -> Result<Outcome, Error> {
        if !blocking {
            self.submit(kind, conn)?;
            return Ok(Outcome::Done);
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command {
            kind,
            conn,
            completion: Some(tx),
        })?;
        match timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout),
        }
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => Error::Memory,
            TrySendError::Closed(_) => Error::Shutdown,
        })
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
