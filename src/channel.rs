//! Communication channels for sending and receiving messages between parties.
//!
//! The [`Channel`] trait is the only interface the protocol code sees; how
//! bytes actually travel (network sockets, in-memory queues, ...) is up to
//! the implementation. Every message carries a stable phase tag such as
//! `"open(x-a)"` — all parties must issue the same sequence of tagged
//! operations, and the tags double as tracing context when debugging a
//! desynchronized session.
//!
//! Messages are serialized with `bincode`. The [`SimpleChannel`] implementation
//! connects any number of in-process parties over tokio mpsc queues and is
//! what the tests and benchmarks run on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{
    mpsc::{channel, Receiver, Sender},
    Mutex,
};
use tracing::{trace, Level};

/// Errors related to sending / receiving / (de-)serializing messages.
#[derive(Debug)]
pub struct Error {
    /// The protocol phase during which the error occurred.
    pub phase: String,
    /// The specific error that was raised.
    pub reason: ErrorKind,
}

/// The specific error that occurred when trying to send / receive a message.
#[derive(Debug)]
pub enum ErrorKind {
    /// The (serialized) message could not be received over the channel.
    RecvError(String),
    /// The (serialized) message could not be sent over the channel.
    SendError(String),
    /// The message could not be serialized or deserialized.
    SerdeError(String),
    /// The message does not have the expected shape or length.
    InvalidLength,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel error during {}: {:?}", self.phase, self.reason)
    }
}

impl std::error::Error for Error {}

/// A communication channel used to send/receive messages to/from other
/// parties.
///
/// Implementations determine how messages are physically transmitted; the
/// protocol code only relies on reliable, per-peer FIFO delivery.
pub trait Channel {
    /// The error that can occur sending messages over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving messages over the channel.
    type RecvError: fmt::Debug;

    /// Sends a message to the party with the given index.
    // We allow the async_fn_in_trait lint because we don't need to place
    // additional bounds on the returned future.
    #[allow(async_fn_in_trait)]
    async fn send_bytes_to(
        &self,
        party: usize,
        msg: Vec<u8>,
        phase: &str,
    ) -> Result<(), Self::SendError>;

    /// Awaits a message from the party with the given index.
    #[allow(async_fn_in_trait)]
    async fn recv_bytes_from(&self, party: usize, phase: &str)
        -> Result<Vec<u8>, Self::RecvError>;
}

/// Serializes and sends a message to the given party.
pub(crate) async fn send_to<S: Serialize>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
    msg: &S,
) -> Result<(), Error> {
    let bytes = bincode::serialize(msg).map_err(|e| Error {
        phase: format!("sending {phase}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })?;
    channel.send_bytes_to(party, bytes, phase).await.map_err(|e| Error {
        phase: phase.to_string(),
        reason: ErrorKind::SendError(format!("{e:?}")),
    })
}

/// Receives and deserializes a message from the given party.
pub(crate) async fn recv_from<T: DeserializeOwned>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
) -> Result<T, Error> {
    let bytes = channel.recv_bytes_from(party, phase).await.map_err(|e| Error {
        phase: phase.to_string(),
        reason: ErrorKind::RecvError(format!("{e:?}")),
    })?;
    bincode::deserialize(&bytes).map_err(|e| Error {
        phase: format!("receiving {phase}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })
}

/// How long a [`SimpleChannel`] recv waits before giving up on a peer.
const RECV_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Messages buffered per link before a send blocks; collectives send at most
/// a handful of tensors per peer before the matching receives drain them.
const LINK_CAPACITY: usize = 1024;

/// One duplex in-process link to a single peer.
#[derive(Debug)]
struct Link {
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

/// A full mesh of in-process channels over tokio mpsc queues: the party at
/// `rank` holds one [`Link`] per peer, indexed by the peer's rank.
#[derive(Debug)]
pub struct SimpleChannel {
    rank: usize,
    links: Vec<Option<Link>>,
    bytes_sent: AtomicU64,
}

impl SimpleChannel {
    /// Wires up the mesh for N parties and returns one endpoint per rank.
    pub fn channels(parties: usize) -> Vec<Self> {
        let mut links: Vec<Vec<Option<Link>>> = (0..parties)
            .map(|_| (0..parties).map(|_| None).collect())
            .collect();
        for lo in 0..parties {
            for hi in (lo + 1)..parties {
                let (up_tx, up_rx) = channel(LINK_CAPACITY);
                let (down_tx, down_rx) = channel(LINK_CAPACITY);
                links[lo][hi] = Some(Link { tx: up_tx, rx: Mutex::new(down_rx) });
                links[hi][lo] = Some(Link { tx: down_tx, rx: Mutex::new(up_rx) });
            }
        }
        links
            .into_iter()
            .enumerate()
            .map(|(rank, links)| SimpleChannel {
                rank,
                links,
                bytes_sent: AtomicU64::new(0),
            })
            .collect()
    }

    /// The rank this endpoint belongs to.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the total number of bytes sent on this endpoint.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn link(&self, peer: usize) -> &Link {
        self.links[peer]
            .as_ref()
            .unwrap_or_else(|| panic!("rank {} has no link to peer {peer}", self.rank))
    }
}

/// The error raised by `recv` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum SimpleRecvError {
    /// The channel has been closed.
    Closed,
    /// No message was received before the timeout.
    TimeoutElapsed,
}

impl Channel for SimpleChannel {
    type SendError = tokio::sync::mpsc::error::SendError<Vec<u8>>;
    type RecvError = SimpleRecvError;

    #[tracing::instrument(level = Level::TRACE, skip(self, msg))]
    async fn send_bytes_to(
        &self,
        peer: usize,
        msg: Vec<u8>,
        phase: &str,
    ) -> Result<(), Self::SendError> {
        self.bytes_sent.fetch_add(msg.len() as u64, Ordering::Relaxed);
        trace!(bytes = msg.len(), "sending msg");
        self.link(peer).tx.send(msg).await
    }

    #[tracing::instrument(level = Level::TRACE, skip(self))]
    async fn recv_bytes_from(&self, peer: usize, phase: &str) -> Result<Vec<u8>, SimpleRecvError> {
        let mut rx = self.link(peer).rx.lock().await;
        match tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
            Ok(Some(msg)) => {
                trace!(bytes = msg.len(), "received msg");
                Ok(msg)
            }
            Ok(None) => Err(SimpleRecvError::Closed),
            Err(_) => Err(SimpleRecvError::TimeoutElapsed),
        }
    }
}
