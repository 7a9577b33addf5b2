//! Correlated randomness for multiplication and truncation.
//!
//! A Beaver provider hands every party its additive share of offline tuples:
//! multiplication triples `(a, b, c)` with `a·b = c` (elementwise or as a
//! matrix product), squaring pairs `(a, a²)`, private-multiplication pairs
//! with `a0·a1 = c0 + c1`, truncation pairs `(r, r≫m)` and probabilistic
//! truncation triples `(r, r_c, r_b)`. Buffers cross the provider boundary
//! as flat little-endian bytes of exactly `numel × size_of(field)` bytes;
//! the consumer validates the length before use.
//!
//! [`TrustedFirstParty`] implements the trait without any runtime
//! communication: every party derives its shares from its own ChaCha20
//! stream, and rank 0 — which holds replicas of all peer streams from setup —
//! derives the one share that closes each algebraic relation. Because all
//! parties request tuples in lockstep, the replicas stay synchronized with
//! the streams they mirror.
//!
//! A [`ReplayDesc`] makes a mask reproducible: it records the stream
//! positions a mask was drawn at, so a later request can rewind and draw the
//! identical mask while leaving the streams otherwise untouched. The consumer
//! treats the descriptor as opaque metadata.

use std::fmt;

use rand::{random, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::ring::{
    self, ring_add, ring_arshift, ring_lshift, ring_mmul, ring_mul, ring_rshift, ring_sub,
    EltType, RingBuffer, RingField, RingTensor, Shape,
};

/// Whether a descriptor still has to be filled in or can replay a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayStatus {
    /// The descriptor is empty; the next request records into it.
    Init,
    /// The descriptor holds recorded seed material; requests rewind to it.
    Replay,
}

/// Seed material that lets the provider regenerate a Beaver mask.
///
/// The contents are meaningful only to the provider that recorded them; the
/// kernel stores and passes descriptors around without interpreting anything
/// beyond [`ReplayStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayDesc {
    /// Whether the descriptor is still to be recorded or ready for replay.
    pub status: ReplayStatus,
    positions: Vec<u128>,
    len: usize,
}

impl ReplayDesc {
    /// An empty descriptor, to be recorded by the next masked request.
    pub fn new() -> Self {
        ReplayDesc {
            status: ReplayStatus::Init,
            positions: Vec::new(),
            len: 0,
        }
    }
}

impl Default for ReplayDesc {
    fn default() -> Self {
        ReplayDesc::new()
    }
}

/// Errors raised by a Beaver provider.
#[derive(Debug)]
pub enum Error {
    /// Private multiplication pairs exist only in the two-party setting.
    MulPrivRequiresTwoParties(usize),
    /// A replayed mask was requested with a different element count than it
    /// was recorded with.
    ReplayLenMismatch {
        /// Element count recorded in the descriptor.
        recorded: usize,
        /// Element count of the current request.
        requested: usize,
    },
    /// Internal ring algebra failure while closing a relation.
    Ring(ring::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MulPrivRequiresTwoParties(n) => {
                write!(f, "private multiplication requires 2 parties, got {n}")
            }
            Error::ReplayLenMismatch { recorded, requested } => {
                write!(f, "replay descriptor holds {recorded} elements, request wants {requested}")
            }
            Error::Ring(e) => write!(f, "ring error in provider: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ring::Error> for Error {
    fn from(e: ring::Error) -> Self {
        Error::Ring(e)
    }
}

/// A provider of offline correlated randomness.
///
/// All parties must issue the same sequence of requests with the same
/// parameters; providers may rely on this lockstep to keep their internal
/// state synchronized.
pub trait Beaver {
    /// A multiplication triple: this party's shares of `(a, b, c)` with
    /// `a·b = c` elementwise. `x_desc` / `y_desc` record or replay the
    /// masks `a` / `b`.
    fn mul(
        &mut self,
        field: RingField,
        numel: usize,
        x_desc: Option<&mut ReplayDesc>,
        y_desc: Option<&mut ReplayDesc>,
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), Error>;

    /// A matrix-multiplication triple: shares of `a` (m×k), `b` (k×n) and
    /// `c = a·b` (m×n).
    #[allow(clippy::too_many_arguments)]
    fn dot(
        &mut self,
        field: RingField,
        m: usize,
        n: usize,
        k: usize,
        x_desc: Option<&mut ReplayDesc>,
        y_desc: Option<&mut ReplayDesc>,
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), Error>;

    /// A squaring pair: shares of `(a, a²)`.
    fn square(
        &mut self,
        field: RingField,
        numel: usize,
        x_desc: Option<&mut ReplayDesc>,
    ) -> Result<(Vec<u8>, Vec<u8>), Error>;

    /// A private-multiplication pair: rank 0 holds `(a0, c0)`, rank 1 holds
    /// `(a1, c1)`, with `a0·a1 = c0 + c1`. Two parties only.
    fn mul_priv(&mut self, field: RingField, numel: usize) -> Result<(Vec<u8>, Vec<u8>), Error>;

    /// A truncation pair: shares of `(r, r≫bits)` (arithmetic shift).
    fn trunc(
        &mut self,
        field: RingField,
        numel: usize,
        bits: u32,
    ) -> Result<(Vec<u8>, Vec<u8>), Error>;

    /// A probabilistic-truncation triple: shares of `(r, r_c, r_b)` where
    /// `r_b` is the top bit of `r` and `r_c = (r mod 2^(k-1)) ≫ bits`.
    fn trunc_pr(
        &mut self,
        field: RingField,
        numel: usize,
        bits: u32,
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), Error>;
}

/// What a masked draw should do to each stream.
#[derive(Clone, Copy, PartialEq, Eq)]
enum DrawPlan {
    /// Draw fresh material, advancing the stream.
    Fresh,
    /// Draw fresh material and record the stream positions into the
    /// descriptor.
    Record,
    /// Rewind to the recorded position, draw, and restore the stream.
    Replay,
}

fn plan_of(desc: &Option<&mut ReplayDesc>) -> DrawPlan {
    match desc {
        None => DrawPlan::Fresh,
        Some(d) if d.status == ReplayStatus::Init => DrawPlan::Record,
        Some(_) => DrawPlan::Replay,
    }
}

/// Draws `numel` elements for stream `stream_idx` (0 = own, i = replica of
/// rank i) according to the plan.
fn masked_draw(
    rng: &mut ChaCha20Rng,
    stream_idx: usize,
    plan: DrawPlan,
    desc: &mut Option<&mut ReplayDesc>,
    field: RingField,
    numel: usize,
) -> Result<RingBuffer, Error> {
    match plan {
        DrawPlan::Fresh => Ok(RingBuffer::sample(field, numel, rng)),
        DrawPlan::Record => {
            let d = desc.as_mut().expect("record plan implies a descriptor");
            if stream_idx == 0 {
                d.positions.clear();
                d.len = numel;
            }
            debug_assert_eq!(d.positions.len(), stream_idx);
            d.positions.push(rng.get_word_pos());
            Ok(RingBuffer::sample(field, numel, rng))
        }
        DrawPlan::Replay => {
            let d = desc.as_mut().expect("replay plan implies a descriptor");
            if d.len != numel {
                return Err(Error::ReplayLenMismatch {
                    recorded: d.len,
                    requested: numel,
                });
            }
            let cur = rng.get_word_pos();
            rng.set_word_pos(d.positions[stream_idx]);
            let buf = RingBuffer::sample(field, numel, rng);
            rng.set_word_pos(cur);
            Ok(buf)
        }
    }
}

fn flat(field: RingField, buf: RingBuffer, numel: usize) -> RingTensor {
    RingTensor::new(buf, EltType::raw(field), Shape::new(vec![numel]))
        .expect("provider buffers match their element count")
}

/// The default provider: a dealer that coincides with rank 0.
///
/// At setup, rank 0 learns the ChaCha20 seeds of all peers (the peers learn
/// nothing about each other's seeds or about rank 0's). Each request is then
/// served without communication: peers sample their shares, rank 0 mirrors
/// the peers' sampling on its replicas and solves for its own share.
#[derive(Debug)]
pub struct TrustedFirstParty {
    rank: usize,
    world: usize,
    own: ChaCha20Rng,
    /// Replicas of the streams of ranks `1..world`; empty on every rank
    /// except 0.
    peers: Vec<ChaCha20Rng>,
}

impl TrustedFirstParty {
    /// Creates synchronized providers for all parties in one process.
    pub fn setup_local(parties: usize) -> Vec<TrustedFirstParty> {
        let seeds: Vec<[u8; 32]> = (0..parties).map(|_| random()).collect();
        (0..parties)
            .map(|rank| TrustedFirstParty {
                rank,
                world: parties,
                own: ChaCha20Rng::from_seed(seeds[rank]),
                peers: if rank == 0 {
                    seeds[1..].iter().map(|&s| ChaCha20Rng::from_seed(s)).collect()
                } else {
                    Vec::new()
                },
            })
            .collect()
    }

    /// The rank this provider belongs to.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The number of parties the provider was set up for.
    pub fn world_size(&self) -> usize {
        self.world
    }
}

impl Beaver for TrustedFirstParty {
    fn mul(
        &mut self,
        field: RingField,
        numel: usize,
        mut x_desc: Option<&mut ReplayDesc>,
        mut y_desc: Option<&mut ReplayDesc>,
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), Error> {
        let x_plan = plan_of(&x_desc);
        let y_plan = plan_of(&y_desc);
        let a = masked_draw(&mut self.own, 0, x_plan, &mut x_desc, field, numel)?;
        let b = masked_draw(&mut self.own, 0, y_plan, &mut y_desc, field, numel)?;
        let c = if self.rank != 0 {
            RingBuffer::sample(field, numel, &mut self.own)
        } else {
            let mut a_full = flat(field, a.clone(), numel);
            let mut b_full = flat(field, b.clone(), numel);
            let mut c_rest = flat(field, RingBuffer::zeros(field, numel), numel);
            for (i, rng) in self.peers.iter_mut().enumerate() {
                let a_i = masked_draw(rng, i + 1, x_plan, &mut x_desc, field, numel)?;
                let b_i = masked_draw(rng, i + 1, y_plan, &mut y_desc, field, numel)?;
                let c_i = RingBuffer::sample(field, numel, rng);
                a_full = ring_add(&a_full, &flat(field, a_i, numel))?;
                b_full = ring_add(&b_full, &flat(field, b_i, numel))?;
                c_rest = ring_add(&c_rest, &flat(field, c_i, numel))?;
            }
            let c_full = ring_mul(&a_full, &b_full)?;
            ring_sub(&c_full, &c_rest)?.data().clone()
        };
        Ok((a.to_le_bytes(), b.to_le_bytes(), c.to_le_bytes()))
    }

    fn dot(
        &mut self,
        field: RingField,
        m: usize,
        n: usize,
        k: usize,
        mut x_desc: Option<&mut ReplayDesc>,
        mut y_desc: Option<&mut ReplayDesc>,
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), Error> {
        let x_plan = plan_of(&x_desc);
        let y_plan = plan_of(&y_desc);
        let a = masked_draw(&mut self.own, 0, x_plan, &mut x_desc, field, m * k)?;
        let b = masked_draw(&mut self.own, 0, y_plan, &mut y_desc, field, k * n)?;
        let c = if self.rank != 0 {
            RingBuffer::sample(field, m * n, &mut self.own)
        } else {
            let as_mat = |buf: RingBuffer, rows, cols| {
                RingTensor::new(buf, EltType::raw(field), Shape::new(vec![rows, cols]))
                    .expect("provider buffers match their element count")
            };
            let mut a_full = as_mat(a.clone(), m, k);
            let mut b_full = as_mat(b.clone(), k, n);
            let mut c_rest = as_mat(RingBuffer::zeros(field, m * n), m, n);
            for (i, rng) in self.peers.iter_mut().enumerate() {
                let a_i = masked_draw(rng, i + 1, x_plan, &mut x_desc, field, m * k)?;
                let b_i = masked_draw(rng, i + 1, y_plan, &mut y_desc, field, k * n)?;
                let c_i = RingBuffer::sample(field, m * n, rng);
                a_full = ring_add(&a_full, &as_mat(a_i, m, k))?;
                b_full = ring_add(&b_full, &as_mat(b_i, k, n))?;
                c_rest = ring_add(&c_rest, &as_mat(c_i, m, n))?;
            }
            let c_full = ring_mmul(&a_full, &b_full)?;
            ring_sub(&c_full, &c_rest)?.data().clone()
        };
        Ok((a.to_le_bytes(), b.to_le_bytes(), c.to_le_bytes()))
    }

    fn square(
        &mut self,
        field: RingField,
        numel: usize,
        mut x_desc: Option<&mut ReplayDesc>,
    ) -> Result<(Vec<u8>, Vec<u8>), Error> {
        let x_plan = plan_of(&x_desc);
        let a = masked_draw(&mut self.own, 0, x_plan, &mut x_desc, field, numel)?;
        let b = if self.rank != 0 {
            RingBuffer::sample(field, numel, &mut self.own)
        } else {
            let mut a_full = flat(field, a.clone(), numel);
            let mut b_rest = flat(field, RingBuffer::zeros(field, numel), numel);
            for (i, rng) in self.peers.iter_mut().enumerate() {
                let a_i = masked_draw(rng, i + 1, x_plan, &mut x_desc, field, numel)?;
                let b_i = RingBuffer::sample(field, numel, rng);
                a_full = ring_add(&a_full, &flat(field, a_i, numel))?;
                b_rest = ring_add(&b_rest, &flat(field, b_i, numel))?;
            }
            let b_full = ring_mul(&a_full, &a_full)?;
            ring_sub(&b_full, &b_rest)?.data().clone()
        };
        Ok((a.to_le_bytes(), b.to_le_bytes()))
    }

    fn mul_priv(&mut self, field: RingField, numel: usize) -> Result<(Vec<u8>, Vec<u8>), Error> {
        if self.world != 2 {
            return Err(Error::MulPrivRequiresTwoParties(self.world));
        }
        let a = RingBuffer::sample(field, numel, &mut self.own);
        let c = if self.rank != 0 {
            RingBuffer::sample(field, numel, &mut self.own)
        } else {
            let rng = &mut self.peers[0];
            let a_1 = RingBuffer::sample(field, numel, rng);
            let c_1 = RingBuffer::sample(field, numel, rng);
            let prod = ring_mul(&flat(field, a.clone(), numel), &flat(field, a_1, numel))?;
            ring_sub(&prod, &flat(field, c_1, numel))?.data().clone()
        };
        Ok((a.to_le_bytes(), c.to_le_bytes()))
    }

    fn trunc(
        &mut self,
        field: RingField,
        numel: usize,
        bits: u32,
    ) -> Result<(Vec<u8>, Vec<u8>), Error> {
        let r = RingBuffer::sample(field, numel, &mut self.own);
        let rm = if self.rank != 0 {
            RingBuffer::sample(field, numel, &mut self.own)
        } else {
            let mut r_full = flat(field, r.clone(), numel);
            let mut rm_rest = flat(field, RingBuffer::zeros(field, numel), numel);
            for rng in self.peers.iter_mut() {
                let r_i = RingBuffer::sample(field, numel, rng);
                let rm_i = RingBuffer::sample(field, numel, rng);
                r_full = ring_add(&r_full, &flat(field, r_i, numel))?;
                rm_rest = ring_add(&rm_rest, &flat(field, rm_i, numel))?;
            }
            let rm_full = ring_arshift(&r_full, &[bits])?;
            ring_sub(&rm_full, &rm_rest)?.data().clone()
        };
        Ok((r.to_le_bytes(), rm.to_le_bytes()))
    }

    fn trunc_pr(
        &mut self,
        field: RingField,
        numel: usize,
        bits: u32,
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), Error> {
        let k = field.bits();
        let r = RingBuffer::sample(field, numel, &mut self.own);
        let (rc, rb) = if self.rank != 0 {
            let rc = RingBuffer::sample(field, numel, &mut self.own);
            let rb = RingBuffer::sample(field, numel, &mut self.own);
            (rc, rb)
        } else {
            let mut r_full = flat(field, r.clone(), numel);
            let mut rc_rest = flat(field, RingBuffer::zeros(field, numel), numel);
            let mut rb_rest = rc_rest.clone();
            for rng in self.peers.iter_mut() {
                let r_i = RingBuffer::sample(field, numel, rng);
                let rc_i = RingBuffer::sample(field, numel, rng);
                let rb_i = RingBuffer::sample(field, numel, rng);
                r_full = ring_add(&r_full, &flat(field, r_i, numel))?;
                rc_rest = ring_add(&rc_rest, &flat(field, rc_i, numel))?;
                rb_rest = ring_add(&rb_rest, &flat(field, rb_i, numel))?;
            }
            // r_c = (r mod 2^(k-1)) >> bits, r_b = msb(r)
            let rc_full = ring_rshift(&ring_lshift(&r_full, &[1])?, &[1 + bits])?;
            let rb_full = ring_rshift(&r_full, &[k - 1])?;
            (
                ring_sub(&rc_full, &rc_rest)?.data().clone(),
                ring_sub(&rb_full, &rb_rest)?.data().clone(),
            )
        };
        Ok((r.to_le_bytes(), rc.to_le_bytes(), rb.to_le_bytes()))
    }
}
