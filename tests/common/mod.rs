//! Shared harness: runs N in-process parties over [`SimpleChannel`]s with
//! locally set up randomness and a trusted-first-party Beaver provider.

#![allow(dead_code)]

use std::future::Future;

use futures::future::try_join_all;
use semi2k::beaver::TrustedFirstParty;
use semi2k::channel::SimpleChannel;
use semi2k::kernel::{Error, Semi2kContext};
use semi2k::prg::PrgState;
use semi2k::ring::{EltType, RingBuffer, RingField, RingTensor, Shape};

pub type PartyCtx = Semi2kContext<SimpleChannel, TrustedFirstParty>;

/// Runs one future per party, all in the same process, and collects their
/// results in rank order.
pub async fn run_parties<T, F, Fut>(world: usize, f: F) -> Vec<T>
where
    F: Fn(PartyCtx) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let channels = SimpleChannel::channels(world);
    let prgs = PrgState::setup_local(world);
    let beavers = TrustedFirstParty::setup_local(world);
    let mut parties = Vec::new();
    for (rank, ((channel, prg), beaver)) in
        channels.into_iter().zip(prgs).zip(beavers).enumerate()
    {
        parties.push(f(Semi2kContext::new(channel, rank, world, prg, beaver)));
    }
    try_join_all(parties).await.expect("a party failed")
}

pub fn modulus_mask(field: RingField, v: u128) -> u128 {
    match field {
        RingField::F32 => v & (u32::MAX as u128),
        RingField::F64 => v & (u64::MAX as u128),
        RingField::F128 => v,
    }
}

/// Encodes a signed integer into the ring (two's complement).
pub fn encode(field: RingField, v: i128) -> u128 {
    modulus_mask(field, v as u128)
}

/// Decodes a ring element into a signed integer (two's complement).
pub fn decode(field: RingField, v: u128) -> i128 {
    let k = field.bits();
    if k == 128 {
        v as i128
    } else if v >> (k - 1) != 0 {
        (v | (u128::MAX << k)) as i128
    } else {
        v as i128
    }
}

/// A public tensor holding the given signed values.
pub fn public_tensor(field: RingField, vals: &[i128]) -> RingTensor {
    let words: Vec<u128> = vals.iter().map(|&v| encode(field, v)).collect();
    RingTensor::new(
        RingBuffer::from_u128_slice(field, &words),
        EltType::public(field),
        Shape::new(vec![vals.len()]),
    )
    .expect("values match shape")
}

/// A public matrix holding the given signed values in row-major order.
pub fn public_matrix(field: RingField, rows: usize, cols: usize, vals: &[i128]) -> RingTensor {
    let words: Vec<u128> = vals.iter().map(|&v| encode(field, v)).collect();
    RingTensor::new(
        RingBuffer::from_u128_slice(field, &words),
        EltType::public(field),
        Shape::new(vec![rows, cols]),
    )
    .expect("values match shape")
}

/// The signed values of an opened (public) tensor.
pub fn decode_tensor(t: &RingTensor) -> Vec<i128> {
    let field = t.field();
    t.to_u128_vec().into_iter().map(|v| decode(field, v)).collect()
}
