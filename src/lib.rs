//! Semi-honest N-party secure computation over power-of-two rings, after the
//! protocol family of [SecureML](https://eprint.iacr.org/2017/396.pdf) and
//! [ABY3](https://eprint.iacr.org/2018/403.pdf).
//!
//! Secrets are additively shared: a value `x` in `Z_2^k` (k in {32, 64, 128})
//! is held as shares `x_0, ..., x_{N-1}` with `x = Σ x_i mod 2^k`, and every
//! operation preserves this invariant. Linear operations are local;
//! multiplication consumes offline Beaver tuples and costs one opening;
//! fixed-point truncation comes in a deterministic and two probabilistic
//! variants.
//!
//! The kernel operations live in [`kernel::arith`] and [`kernel::trunc`] and
//! run against a [`kernel::Semi2kContext`], which bundles a rank-aware
//! [`kernel::Communicator`] over any [`channel::Channel`], the party's
//! [`prg::PrgState`] randomness, a [`beaver::Beaver`] provider and the
//! open-cache. All parties execute the same sequence of tagged collectives
//! in lockstep.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod beaver;
pub mod channel;
pub mod kernel;
pub mod prg;
pub mod ring;
