//! The arithmetic kernel: stateless operation handlers over an evaluation
//! context.
//!
//! Every operation is an async free function taking a [`Semi2kContext`] plus
//! tensor operands. The context bundles the four services the handlers rely
//! on — the [`Communicator`], the party's [`PrgState`], a [`Beaver`] provider
//! and the [`BeaverCache`] — together with the vectorization switch that
//! controls whether paired openings are merged into one all-reduce.
//!
//! The parties are cooperatively lock-stepped: each one runs a single
//! evaluator that must issue the same sequence of collectives with the same
//! tags. Errors are fatal for the session — once shares are inconsistent
//! there is nothing to retry, and carrying on silently would leak or corrupt
//! secrets.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{try_join, try_join_all};

use crate::beaver::{self, Beaver};
use crate::channel::{self, recv_from, send_to, Channel, ErrorKind};
use crate::prg::PrgState;
use crate::ring::{self, ring_add, EltType, Kind, RingBuffer, RingField, RingTensor, Shape};

pub mod arith;
pub mod cache;
pub mod trunc;

pub use cache::BeaverCache;

/// A custom error type for kernel operations.
#[derive(Debug)]
pub enum Error {
    /// A structural or typing failure in the ring algebra (shape or field
    /// disagreement, malformed matrix product, bad shift vector).
    Ring(ring::Error),
    /// A message could not be sent or received.
    Channel(channel::Error),
    /// The Beaver provider failed to produce a tuple.
    Beaver(beaver::Error),
    /// An operand carried a share kind the operation does not accept.
    KindMismatch {
        /// The share kind the operation expects.
        expected: &'static str,
        /// The share kind the operand actually carried.
        actual: Kind,
    },
    /// The operands live in different rings.
    FieldMismatch {
        /// Field of the left operand.
        lhs: RingField,
        /// Field of the right operand.
        rhs: RingField,
    },
    /// A party rank appeared where it is not valid.
    InvalidRank(usize),
    /// Both private operands are owned by the same party.
    EqualOwners(usize),
    /// The truncation bit count is outside the supported range.
    InvalidTruncBits(u32),
    /// A provider buffer does not hold `numel × size_of(field)` bytes.
    ProviderViolation {
        /// The byte length the kernel expected.
        expected: usize,
        /// The byte length the provider returned.
        actual: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Ring(e) => write!(f, "ring error: {e}"),
            Error::Channel(e) => write!(f, "channel error: {e}"),
            Error::Beaver(e) => write!(f, "beaver provider error: {e}"),
            Error::KindMismatch { expected, actual } => {
                write!(f, "expected a {expected} operand, got {actual:?}")
            }
            Error::FieldMismatch { lhs, rhs } => {
                write!(f, "operands live in different rings: {lhs} vs {rhs}")
            }
            Error::InvalidRank(r) => write!(f, "invalid rank: {r}"),
            Error::EqualOwners(r) => {
                write!(f, "both private operands are owned by rank {r}")
            }
            Error::InvalidTruncBits(bits) => {
                write!(f, "unsupported truncation bits: {bits}")
            }
            Error::ProviderViolation { expected, actual } => {
                write!(f, "provider buffer holds {actual} bytes, expected {expected}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<ring::Error> for Error {
    fn from(e: ring::Error) -> Self {
        Error::Ring(e)
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Error::Channel(e)
    }
}

impl From<beaver::Error> for Error {
    fn from(e: beaver::Error) -> Self {
        Error::Beaver(e)
    }
}

/// The sign range hint for truncation operations.
///
/// Accepted by every truncation kernel; the current protocols are correct
/// for any value in the legal range and do not inspect the hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    /// Nothing is known about the sign of the secret.
    Unknown,
    /// The secret is known to be non-negative.
    Positive,
    /// The secret is known to be negative.
    Negative,
}

/// Rank-aware collectives and point-to-point messaging over a [`Channel`],
/// with communication statistics.
#[derive(Debug)]
pub struct Communicator<C: Channel> {
    channel: C,
    rank: usize,
    world: usize,
    rounds: AtomicU64,
    bytes: AtomicU64,
}

impl<C: Channel> Communicator<C> {
    /// Wraps a channel for the party with the given rank.
    pub fn new(channel: C, rank: usize, world: usize) -> Self {
        Communicator {
            channel,
            rank,
            world,
            rounds: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// This party's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The number of participating parties.
    pub fn world_size(&self) -> usize {
        self.world
    }

    /// The rank after this one, wrapping around.
    pub fn next_rank(&self) -> usize {
        (self.rank + 1) % self.world
    }

    /// The rank before this one, wrapping around.
    pub fn prev_rank(&self) -> usize {
        (self.rank + self.world - 1) % self.world
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Communication rounds counted so far.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Payload bytes counted so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Accounts communication that bypassed the collectives (point-to-point
    /// exchanges book their cost through this).
    pub fn add_comm_stats_manually(&self, rounds: u64, bits: u64) {
        self.rounds.fetch_add(rounds, Ordering::Relaxed);
        self.bytes.fetch_add(bits / 8, Ordering::Relaxed);
    }

    fn check_peer_buf(&self, buf: &RingBuffer, field: RingField, numel: usize, tag: &str) -> Result<(), Error> {
        if buf.field() != field || buf.len() != numel {
            return Err(Error::Channel(channel::Error {
                phase: tag.to_string(),
                reason: ErrorKind::InvalidLength,
            }));
        }
        Ok(())
    }

    /// Opens the sum of all parties' tensors: every party contributes its
    /// local tensor and receives the elementwise sum modulo `2^k`. One round.
    pub async fn all_reduce_add(&self, x: &RingTensor, tag: &str) -> Result<RingTensor, Error> {
        let field = x.field();
        let numel = x.numel();
        let peers: Vec<usize> = (0..self.world).filter(|&p| p != self.rank).collect();
        let sends = try_join_all(peers.iter().map(|&p| send_to(&self.channel, p, tag, x.data())));
        let recvs = try_join_all(
            peers.iter().map(|&p| recv_from::<RingBuffer>(&self.channel, p, tag)),
        );
        let (_, bufs) = try_join(sends, recvs).await?;
        let mut acc = x.clone();
        for buf in bufs {
            self.check_peer_buf(&buf, field, numel, tag)?;
            let share = RingTensor::new(buf, EltType::raw(field), x.shape().clone())?;
            acc = ring_add(&acc, &share)?.as_type(x.elt_type())?;
        }
        self.rounds.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(
            (numel * field.size_of_elem() * peers.len()) as u64,
            Ordering::Relaxed,
        );
        Ok(acc)
    }

    /// Collects every party's tensor at `root`. Returns the buffers indexed
    /// by rank on the root and `None` elsewhere. One round.
    pub async fn gather(
        &self,
        x: &RingTensor,
        root: usize,
        tag: &str,
    ) -> Result<Option<Vec<RingBuffer>>, Error> {
        let field = x.field();
        let numel = x.numel();
        let out = if self.rank == root {
            let mut bufs = Vec::with_capacity(self.world);
            for p in 0..self.world {
                if p == self.rank {
                    bufs.push(x.data().clone());
                } else {
                    let buf: RingBuffer = recv_from(&self.channel, p, tag).await?;
                    self.check_peer_buf(&buf, field, numel, tag)?;
                    bufs.push(buf);
                }
            }
            Some(bufs)
        } else {
            send_to(&self.channel, root, tag, x.data()).await?;
            None
        };
        self.rounds.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add((numel * field.size_of_elem()) as u64, Ordering::Relaxed);
        Ok(out)
    }

    /// Sends a tensor to one peer. Statistics are not booked automatically;
    /// use [`Communicator::add_comm_stats_manually`].
    pub async fn send(&self, peer: usize, x: &RingTensor, tag: &str) -> Result<(), Error> {
        send_to(&self.channel, peer, tag, x.data()).await?;
        Ok(())
    }

    /// Receives a tensor of the given type and shape from one peer.
    pub async fn recv(
        &self,
        peer: usize,
        ty: EltType,
        shape: &Shape,
        tag: &str,
    ) -> Result<RingTensor, Error> {
        let buf: RingBuffer = recv_from(&self.channel, peer, tag).await?;
        self.check_peer_buf(&buf, ty.field, shape.numel(), tag)?;
        Ok(RingTensor::new(buf, ty, shape.clone())?)
    }
}

/// The per-party evaluation context shared by all kernel operations.
#[derive(Debug)]
pub struct Semi2kContext<C: Channel, B: Beaver> {
    /// The communicator binding this party to its peers.
    pub comm: Communicator<C>,
    /// This party's pseudorandomness (private and correlated).
    pub prg: PrgState,
    /// The provider of offline Beaver tuples.
    pub beaver: B,
    /// The cache of opened masked operands, keyed by buffer identity.
    pub cache: BeaverCache,
    /// Merge paired openings into one batched all-reduce when caching does
    /// not force one-at-a-time opens.
    pub vectorize: bool,
}

impl<C: Channel, B: Beaver> Semi2kContext<C, B> {
    /// Builds a context for one party.
    pub fn new(channel: C, rank: usize, world: usize, prg: PrgState, beaver: B) -> Self {
        Semi2kContext {
            comm: Communicator::new(channel, rank, world),
            prg,
            beaver,
            cache: BeaverCache::new(),
            vectorize: true,
        }
    }

    /// This party's rank.
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// The number of participating parties.
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }
}

/// Validates a provider buffer and turns it into a tensor.
pub(crate) fn unflatten(bytes: &[u8], ty: EltType, shape: Shape) -> Result<RingTensor, Error> {
    let expected = shape.numel() * ty.field.size_of_elem();
    if bytes.len() != expected {
        return Err(Error::ProviderViolation { expected, actual: bytes.len() });
    }
    let buf = RingBuffer::from_le_bytes(ty.field, bytes).ok_or(Error::ProviderViolation {
        expected,
        actual: bytes.len(),
    })?;
    Ok(RingTensor::new(buf, ty, shape)?)
}

pub(crate) fn expect_arith(x: &RingTensor) -> Result<(), Error> {
    match x.kind() {
        Kind::Arith => Ok(()),
        actual => Err(Error::KindMismatch { expected: "additive-share", actual }),
    }
}

pub(crate) fn expect_pub(x: &RingTensor) -> Result<(), Error> {
    match x.kind() {
        Kind::Pub => Ok(()),
        actual => Err(Error::KindMismatch { expected: "public", actual }),
    }
}

pub(crate) fn expect_bit(x: &RingTensor) -> Result<(), Error> {
    match x.kind() {
        Kind::Bit => Ok(()),
        actual => Err(Error::KindMismatch { expected: "boolean-bit-share", actual }),
    }
}

pub(crate) fn owner_of(x: &RingTensor) -> Result<usize, Error> {
    match x.kind() {
        Kind::Priv(owner) => Ok(owner),
        actual => Err(Error::KindMismatch { expected: "private", actual }),
    }
}

pub(crate) fn expect_same_field(x: &RingTensor, y: &RingTensor) -> Result<(), Error> {
    if x.field() != y.field() {
        return Err(Error::FieldMismatch { lhs: x.field(), rhs: y.field() });
    }
    Ok(())
}

pub(crate) fn expect_same_shape(x: &RingTensor, y: &RingTensor) -> Result<(), Error> {
    if x.shape() != y.shape() {
        return Err(Error::Ring(ring::Error::ShapeMismatch(
            x.shape().clone(),
            y.shape().clone(),
        )));
    }
    Ok(())
}
