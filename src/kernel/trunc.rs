//! Fixed-point truncation of additive sharings.
//!
//! Three protocols with different trade-offs:
//!
//! - [`trunc_a`]: two parties shift their shares locally (one-bit bias for
//!   secrets within `[-2^(k-2), 2^(k-2))`); more parties use a truncation
//!   pair `(r, r≫m)` and one opening.
//! - [`trunc_a_pr`]: probabilistic truncation with at most one ulp of error,
//!   built on a triple `(r, r_c, r_b)` and a single opening of `x + r`. The
//!   signed range is shifted into the non-negative half before masking and
//!   re-encoded afterwards.
//! - [`trunc_a_pr2`]: two-party one-bit-error truncation that corrects the
//!   local share shifts with a modular-wrap indicator computed from one
//!   private multiplication in a smaller ring.

use crate::beaver::Beaver;
use crate::channel::Channel;
use crate::ring::{
    dispatch_field, ring_add, ring_add_scalar, ring_arshift, ring_sub, EltType, RingBuffer,
    RingElem, RingField, RingTensor,
};

use super::arith::mul_vvs;
use super::{expect_arith, unflatten, Error, Semi2kContext, Sign};

/// Sign bits a secret must leave unused at the top of the ring: secrets are
/// constrained to `[-2^(k-2), 2^(k-2))`.
const BITS_LEFT_OUT: u32 = 2;

/// The smallest supported ring that can hold `bits`-bit values.
fn trunc_field_for(bits: u32) -> Result<RingField, Error> {
    if bits <= 32 {
        Ok(RingField::F32)
    } else if bits <= 64 {
        Ok(RingField::F64)
    } else if bits <= 128 {
        Ok(RingField::F128)
    } else {
        Err(Error::InvalidTruncBits(bits))
    }
}

/// Truncates a sharing by `bits`, i.e. computes a sharing of `x ≫ bits`
/// (arithmetic shift on the signed interpretation).
///
/// Two parties shift locally, accepting a one-bit bias. With more parties a
/// truncation pair `(r, r≫bits)` is consumed: `x - r` is opened and rank 0
/// adds its truncated value, so the shares sum to `(r≫bits) + ((x-r)≫bits)`.
///
/// The `sign` hint is accepted for callers that know the range of the
/// secret; the protocol is correct without it.
pub async fn trunc_a<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
    bits: u32,
    _sign: Sign,
) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    let field = x.field();
    if bits > field.bits() {
        return Err(Error::InvalidTruncBits(bits));
    }

    if ctx.world_size() == 2 {
        // local truncation; the wrap error stays within one unit for secrets
        // in the legal range
        return Ok(ring_arshift(x, &[bits])?.as_type(x.elt_type())?);
    }

    let (r_buf, rm_buf) = ctx.beaver.trunc(field, x.numel(), bits)?;
    let r = unflatten(&r_buf, x.elt_type(), x.shape().clone())?;
    let rm = unflatten(&rm_buf, x.elt_type(), x.shape().clone())?;

    let x_r = ctx.comm.all_reduce_add(&ring_sub(x, &r)?, "trunc").await?;
    let mut res = rm;
    if ctx.rank() == 0 {
        res = ring_add(&res, &ring_arshift(&x_r, &[bits])?)?;
    }
    Ok(res.as_type(x.elt_type())?)
}

fn trunc_pr_combine<T: RingElem>(
    c: &[T],
    rc: &[T],
    rb: &[T],
    leader: bool,
    bits: u32,
) -> Vec<T> {
    let k = T::BITS;
    let two = T::from_u128(2);
    c.iter()
        .zip(rc)
        .zip(rb)
        .map(|((&c, &rc), &rb)| {
            let ck_1 = c.shr(k - 1);
            if leader {
                // <b> = <rb> ^ c_{k-1} = <rb> + c_{k-1} - 2*c_{k-1}*<rb>
                let b = rb.add(ck_1).sub(two.mul(ck_1).mul(rb));
                // c_hat = c / 2^m mod 2^(k-m-1)
                let c_hat = c.shl(1).shr(1 + bits);
                let y = c_hat.sub(rc).add(b.shl(k - 1 - bits));
                // re-encode negative numbers: y' = y - 2^(k-2-m)
                y.sub(T::ONE.shl(k - 2 - bits))
            } else {
                let b = rb.sub(two.mul(ck_1).mul(rb));
                T::ZERO.sub(rc).add(b.shl(k - 1 - bits))
            }
        })
        .collect()
}

/// Probabilistically truncates a sharing by `bits` with at most one ulp of
/// error.
///
/// Rank 0 biases the secret by `2^(k-2)` so the masked value `c = x + r` can
/// be opened without sign ambiguity; the wrap of the mask is corrected with
/// the top bit `r_b`, and the bias is cancelled by the final
/// `-2^(k-2-bits)` term on rank 0.
pub async fn trunc_a_pr<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
    bits: u32,
    _sign: Sign,
) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    let field = x.field();
    let k = field.bits();
    if bits > k - BITS_LEFT_OUT {
        return Err(Error::InvalidTruncBits(bits));
    }

    let (r_buf, rc_buf, rb_buf) = ctx.beaver.trunc_pr(field, x.numel(), bits)?;
    let r = unflatten(&r_buf, EltType::raw(field), x.shape().clone())?;
    let rc = unflatten(&rc_buf, EltType::raw(field), x.shape().clone())?;
    let rb = unflatten(&rb_buf, EltType::raw(field), x.shape().clone())?;

    // mask x (shifted into the non-negative half on rank 0) and open it
    let mut masked = ring_add(x, &r)?;
    if ctx.rank() == 0 {
        masked = ring_add_scalar(&masked, 1u128 << (k - BITS_LEFT_OUT))?;
    }
    let c = ctx.comm.all_reduce_add(&masked, "trunc_pr").await?;

    let leader = ctx.rank() == 0;
    let out = dispatch_field!(field, |T| {
        let c = T::unwrap_slice(c.data()).expect("field matches");
        let rc = T::unwrap_slice(rc.data()).expect("field matches");
        let rb = T::unwrap_slice(rb.data()).expect("field matches");
        T::wrap_vec(trunc_pr_combine(c, rc, rb, leader, bits))
    });
    Ok(RingTensor::new(out, x.elt_type(), x.shape().clone())?)
}

/// Computes the modular-wrap indicator `MW(x0, x1, L) = Wrap(x0, x1, L) +
/// msb(x)` as an additive sharing over the truncation field. Two parties
/// only; requires `|x| < L/4`.
async fn compute_mw<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
    bits: u32,
) -> Result<RingTensor, Error> {
    let field = x.field();
    let k = field.bits();
    let trunc_field = trunc_field_for(bits)?;
    let rank = ctx.rank();

    // per-share range indicator: rank 0 tests (x0 - L/4) >= L/2, rank 1
    // tests x1 >= L/2
    let star: Vec<u128> = dispatch_field!(field, |T| {
        let l_4 = T::ONE.shl(k - BITS_LEFT_OUT);
        let l_2 = l_4.shl(1);
        let xs = T::unwrap_slice(x.data()).expect("field matches");
        match rank {
            0 => xs.iter().map(|&v| (v.sub(l_4).to_u128() >= l_2.to_u128()) as u128).collect(),
            1 => xs.iter().map(|&v| (v.to_u128() >= l_2.to_u128()) as u128).collect(),
            r => return Err(Error::InvalidRank(r)),
        }
    });
    let star = RingBuffer::from_u128_slice(trunc_field, &star);

    let pri0 = EltType::private(trunc_field, 0);
    let pri1 = EltType::private(trunc_field, 1);
    let (xp, yp) = if rank == 0 {
        (
            RingTensor::new(star, pri0, x.shape().clone())?,
            RingTensor::placeholder(pri1, x.shape().clone()),
        )
    } else {
        (
            RingTensor::placeholder(pri0, x.shape().clone()),
            RingTensor::new(star, pri1, x.shape().clone())?,
        )
    };
    let mut mw = mul_vvs(ctx, &xp, &yp).await?;

    if rank == 0 {
        // + (1 - (x0 < L/4)) on the leader's share
        let corr: Vec<u128> = dispatch_field!(field, |T| {
            let l_4 = T::ONE.shl(k - BITS_LEFT_OUT);
            let xs = T::unwrap_slice(x.data()).expect("field matches");
            xs.iter().map(|&v| (1 - ((v.to_u128() < l_4.to_u128()) as u128))).collect()
        });
        let corr = RingTensor::new(
            RingBuffer::from_u128_slice(trunc_field, &corr),
            EltType::raw(trunc_field),
            x.shape().clone(),
        )?;
        mw = ring_add(&mw, &corr)?;
    }
    Ok(mw.as_type(EltType::arith(trunc_field))?)
}

/// Two-party truncation by `bits` with at most one bit of error, via the
/// modular-wrap indicator.
///
/// Each party shifts its own share and subtracts `MW·2^(k-bits)`; the
/// `+rank` constant contributes exactly 1 across the two parties, which
/// makes `trunc(0) = 0` instead of `-2^(-bits)`.
pub async fn trunc_a_pr2<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
    bits: u32,
    _sign: Sign,
) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    let field = x.field();
    let k = field.bits();
    let rank = ctx.rank();
    if rank > 1 {
        return Err(Error::InvalidRank(rank));
    }
    if bits > k {
        return Err(Error::InvalidTruncBits(bits));
    }

    let mw = compute_mw(ctx, x, bits).await?;
    // widen or narrow the indicator into the base ring; its values fit any
    // supported width
    let mw = RingBuffer::from_u128_slice(field, &mw.to_u128_vec());

    let out = dispatch_field!(field, |T| {
        let xs = T::unwrap_slice(x.data()).expect("field matches");
        let mws = T::unwrap_slice(&mw).expect("field matches");
        let rank_term = T::from_u128(rank as u128);
        let correction = T::ONE.shl(k - bits);
        T::wrap_vec(
            xs.iter()
                .zip(mws)
                .map(|(&v, &mw)| v.shr(bits).sub(mw.mul(correction)).add(rank_term))
                .collect(),
        )
    });
    Ok(RingTensor::new(out, x.elt_type(), x.shape().clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trunc_field_selection_is_minimal() {
        assert_eq!(trunc_field_for(1).unwrap(), RingField::F32);
        assert_eq!(trunc_field_for(32).unwrap(), RingField::F32);
        assert_eq!(trunc_field_for(33).unwrap(), RingField::F64);
        assert_eq!(trunc_field_for(64).unwrap(), RingField::F64);
        assert_eq!(trunc_field_for(128).unwrap(), RingField::F128);
        assert!(matches!(trunc_field_for(129), Err(Error::InvalidTruncBits(129))));
    }
}
