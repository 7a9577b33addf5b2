//! Share-form conversions, linear operations and the multiplication family.
//!
//! Multiplications follow the classic masked-open shape: obtain a Beaver
//! tuple, open the masked operands with an all-reduce, then combine locally
//! so that the parties' output shares sum to the product. The shared
//! `mul_open` helper also carries the open-cache logic: operands with
//! caching enabled record their mask descriptor and opened value on first
//! use and skip the open round afterwards.

use crate::beaver::{Beaver, ReplayStatus};
use crate::channel::Channel;
use crate::ring::{
    ring_add, ring_arshift, ring_bitmask, ring_lshift, ring_mmul, ring_mul, ring_mul_scalar,
    ring_neg, ring_ones, ring_sub, EltType, RingField, RingTensor, Shape,
};

use super::{
    expect_arith, expect_bit, expect_pub, expect_same_field, expect_same_shape, owner_of,
    unflatten, Error, Semi2kContext,
};

/// Samples a fresh additive sharing of a uniform secret.
///
/// The raw sample is arithmetic-right-shifted by 2, which keeps the secret
/// within `[-2^(k-2), 2^(k-2))` so that comparisons and truncations on it
/// stay sound.
pub fn rand_a<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    field: RingField,
    shape: Shape,
) -> Result<RingTensor, Error> {
    let r = ctx.prg.gen_priv(field, shape);
    Ok(ring_arshift(&r, &[2])?.as_type(EltType::arith(field))?)
}

/// Converts a public value into an additive sharing.
///
/// Every party's share is a zero-sum mask drawn from the correlated
/// randomness; rank 0 folds the public value into its share.
pub fn p2a<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
) -> Result<RingTensor, Error> {
    expect_pub(x)?;
    let field = x.field();
    let (r0, r1) = ctx.prg.gen_prss_pair(field, x.shape().clone());
    let mut share = ring_sub(&r0, &r1)?;
    if ctx.rank() == 0 {
        share = ring_add(&share, x)?;
    }
    Ok(share.as_type(EltType::arith(field))?)
}

/// Opens an additive sharing to all parties.
pub async fn a2p<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    let out = ctx.comm.all_reduce_add(x, "a2p").await?;
    Ok(out.as_type(EltType::public(x.field()))?)
}

/// Converts one party's private value into an additive sharing. Mirrors
/// [`p2a`], with the owner rather than rank 0 folding in the value.
pub fn v2a<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
) -> Result<RingTensor, Error> {
    let owner = owner_of(x)?;
    let field = x.field();
    let (r0, r1) = ctx.prg.gen_prss_pair(field, x.shape().clone());
    let mut share = ring_sub(&r0, &r1)?;
    if ctx.rank() == owner {
        share = ring_add(&share, x)?;
    }
    Ok(share.as_type(EltType::arith(field))?)
}

/// Reveals an additive sharing to a single party. The secret leaks only to
/// `rank`; the other parties return a placeholder for shape alignment.
pub async fn a2v<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
    rank: usize,
) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    if rank >= ctx.world_size() {
        return Err(Error::InvalidRank(rank));
    }
    let field = x.field();
    let out_ty = EltType::private(field, rank);
    match ctx.comm.gather(x, rank, "a2v").await? {
        Some(bufs) => {
            let mut acc = RingTensor::placeholder(EltType::raw(field), x.shape().clone());
            for buf in bufs {
                let share = RingTensor::new(buf, EltType::raw(field), x.shape().clone())?;
                acc = ring_add(&acc, &share)?;
            }
            Ok(acc.as_type(out_ty)?)
        }
        None => Ok(RingTensor::placeholder(out_ty, x.shape().clone())),
    }
}

/// Negates an additive sharing; linear and local.
pub fn negate_a(x: &RingTensor) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    Ok(ring_neg(x)?.as_type(x.elt_type())?)
}

/// Adds a public tensor to a sharing. Only rank 0 adds, so the share sum
/// gains exactly one copy of the public value.
pub fn add_ap<C: Channel, B: Beaver>(
    ctx: &Semi2kContext<C, B>,
    lhs: &RingTensor,
    rhs: &RingTensor,
) -> Result<RingTensor, Error> {
    expect_arith(lhs)?;
    expect_pub(rhs)?;
    expect_same_field(lhs, rhs)?;
    expect_same_shape(lhs, rhs)?;
    if ctx.rank() == 0 {
        Ok(ring_add(lhs, rhs)?.as_type(lhs.elt_type())?)
    } else {
        Ok(lhs.clone())
    }
}

/// Adds two sharings elementwise; local.
pub fn add_aa(lhs: &RingTensor, rhs: &RingTensor) -> Result<RingTensor, Error> {
    expect_arith(lhs)?;
    expect_arith(rhs)?;
    expect_same_field(lhs, rhs)?;
    Ok(ring_add(lhs, rhs)?.as_type(lhs.elt_type())?)
}

/// Multiplies a sharing by a public tensor elementwise; local and linear.
pub fn mul_ap(lhs: &RingTensor, rhs: &RingTensor) -> Result<RingTensor, Error> {
    expect_arith(lhs)?;
    expect_pub(rhs)?;
    expect_same_field(lhs, rhs)?;
    Ok(ring_mul(lhs, rhs)?.as_type(lhs.elt_type())?)
}

/// Matrix product of a sharing with a public matrix; local and linear.
pub fn mat_mul_ap(lhs: &RingTensor, rhs: &RingTensor) -> Result<RingTensor, Error> {
    expect_arith(lhs)?;
    expect_pub(rhs)?;
    expect_same_field(lhs, rhs)?;
    Ok(ring_mmul(lhs, rhs)?.as_type(lhs.elt_type())?)
}

/// Left-shifts a sharing; local and linear modulo `2^k`.
pub fn lshift_a(x: &RingTensor, bits: &[u32]) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    Ok(ring_lshift(x, bits)?.as_type(x.elt_type())?)
}

/// Starts caching openings of the tensor's buffer: the next multiplication
/// involving it records its Beaver mask and opened value, and later
/// multiplications reuse them without communication.
pub fn enable_cache<C: Channel, B: Beaver>(ctx: &mut Semi2kContext<C, B>, x: &RingTensor) {
    ctx.cache.enable(x);
}

/// Stops caching the tensor's buffer and drops any stored openings.
pub fn disable_cache<C: Channel, B: Beaver>(ctx: &mut Semi2kContext<C, B>, x: &RingTensor) {
    ctx.cache.disable(x);
}

/// A Beaver tuple and the opened masked operands of one multiplication.
struct MaskedOpen {
    a: RingTensor,
    b: RingTensor,
    c: RingTensor,
    x_a: RingTensor,
    y_b: RingTensor,
}

/// The shared masked-open subroutine of the multiplication family.
///
/// Fetches the Beaver tuple (replaying cached masks), opens `x - a` and
/// `y - b` — batched into one all-reduce when vectorization allows, served
/// from the cache when possible — and stores fresh openings for cached
/// operands. When the same buffer appears as both operands the second
/// operand's cache is suppressed for this call: its mask could not be
/// recorded without opening the same array twice.
async fn mul_open<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
    y: &RingTensor,
    mmul: bool,
) -> Result<MaskedOpen, Error> {
    expect_same_field(x, y)?;
    let field = x.field();
    let mut x_cache = ctx.cache.get(x, mmul);
    let mut y_cache = ctx.cache.get(y, mmul);

    if x.buffer_id() == y.buffer_id()
        && x_cache.enabled
        && x_cache.desc.status == ReplayStatus::Init
    {
        y_cache.enabled = false;
    }

    let (a_buf, b_buf, c_buf, z_shape) = if mmul {
        let (m, k) = x.shape().as_matrix().ok_or_else(|| {
            Error::Ring(crate::ring::Error::NotAMatrixProduct(
                x.shape().clone(),
                y.shape().clone(),
            ))
        })?;
        let (k2, n) = y.shape().as_matrix().ok_or_else(|| {
            Error::Ring(crate::ring::Error::NotAMatrixProduct(
                x.shape().clone(),
                y.shape().clone(),
            ))
        })?;
        if k != k2 {
            return Err(Error::Ring(crate::ring::Error::NotAMatrixProduct(
                x.shape().clone(),
                y.shape().clone(),
            )));
        }
        let x_desc = if x_cache.enabled { Some(&mut x_cache.desc) } else { None };
        let y_desc = if y_cache.enabled { Some(&mut y_cache.desc) } else { None };
        let (a, b, c) = ctx.beaver.dot(field, m, n, k, x_desc, y_desc)?;
        (a, b, c, Shape::new(vec![m, n]))
    } else {
        expect_same_shape(x, y)?;
        let x_desc = if x_cache.enabled { Some(&mut x_cache.desc) } else { None };
        let y_desc = if y_cache.enabled { Some(&mut y_cache.desc) } else { None };
        let (a, b, c) = ctx.beaver.mul(field, x.numel(), x_desc, y_desc)?;
        (a, b, c, x.shape().clone())
    };

    let a = unflatten(&a_buf, x.elt_type(), x.shape().clone())?;
    let b = unflatten(&b_buf, y.elt_type(), y.shape().clone())?;
    let c = unflatten(&c_buf, x.elt_type(), z_shape)?;

    let x_hit = x_cache.desc.status != ReplayStatus::Init;
    let y_hit = y_cache.desc.status != ReplayStatus::Init;

    let (x_a, y_b) = if !ctx.vectorize || x_hit || y_hit {
        let x_a = if x_hit {
            x_cache.open.take().expect("replayed cache entry holds the opened value")
        } else {
            ctx.comm.all_reduce_add(&ring_sub(x, &a)?, "open(x-a)").await?
        };
        let y_b = if y_hit {
            y_cache.open.take().expect("replayed cache entry holds the opened value")
        } else {
            ctx.comm.all_reduce_add(&ring_sub(y, &b)?, "open(y-b)").await?
        };
        (x_a, y_b)
    } else {
        // one batched all-reduce for both masked operands
        let xa = ring_sub(x, &a)?;
        let yb = ring_sub(y, &b)?;
        let joined = xa.data().concat(yb.data())?;
        let joined = RingTensor::new(
            joined,
            EltType::raw(field),
            Shape::new(vec![xa.numel() + yb.numel()]),
        )?;
        let opened = ctx.comm.all_reduce_add(&joined, "open(x-a,y-b)").await?;
        let (xa_buf, yb_buf) = opened.data().split_at(xa.numel());
        (
            RingTensor::new(xa_buf, EltType::raw(field), x.shape().clone())?,
            RingTensor::new(yb_buf, EltType::raw(field), y.shape().clone())?,
        )
    };

    if x_cache.enabled && x_cache.desc.status == ReplayStatus::Init {
        ctx.cache.set(x, mmul, x_cache.desc.clone(), x_a.clone());
    }
    if y_cache.enabled && y_cache.desc.status == ReplayStatus::Init {
        ctx.cache.set(y, mmul, y_cache.desc.clone(), y_b.clone());
    }

    Ok(MaskedOpen { a, b, c, x_a, y_b })
}

/// Multiplies two additive sharings elementwise.
///
/// Each party outputs `c_i + (x-a)·b_i + a_i·(y-b)`, with rank 0 absorbing
/// the public cross term `(x-a)·(y-b)`; the shares sum to `x·y`.
pub async fn mul_aa<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
    y: &RingTensor,
) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    expect_arith(y)?;
    let MaskedOpen { a, b, c, x_a, y_b } = mul_open(ctx, x, y, false).await?;
    let mut z = ring_add(&ring_add(&ring_mul(&b, &x_a)?, &ring_mul(&a, &y_b)?)?, &c)?;
    if ctx.rank() == 0 {
        z = ring_add(&z, &ring_mul(&x_a, &y_b)?)?;
    }
    Ok(z.as_type(x.elt_type())?)
}

/// Squares an additive sharing with a squaring pair `(a, a²)`, costing a
/// single opening: `z_i = a²_i + 2·(x-a)·a_i`, plus `(x-a)²` on rank 0.
pub async fn square_a<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    let field = x.field();
    let mut x_cache = ctx.cache.get(x, false);

    let x_desc = if x_cache.enabled { Some(&mut x_cache.desc) } else { None };
    let (a_buf, b_buf) = ctx.beaver.square(field, x.numel(), x_desc)?;
    let a = unflatten(&a_buf, x.elt_type(), x.shape().clone())?;
    let b = unflatten(&b_buf, x.elt_type(), x.shape().clone())?;

    let x_a = if x_cache.desc.status != ReplayStatus::Init {
        x_cache.open.take().expect("replayed cache entry holds the opened value")
    } else {
        ctx.comm.all_reduce_add(&ring_sub(x, &a)?, "open(x-a)").await?
    };
    if x_cache.enabled && x_cache.desc.status == ReplayStatus::Init {
        ctx.cache.set(x, false, x_cache.desc.clone(), x_a.clone());
    }

    let mut z = ring_add(&ring_mul_scalar(&ring_mul(&a, &x_a)?, 2)?, &b)?;
    if ctx.rank() == 0 {
        z = ring_add(&z, &ring_mul(&x_a, &x_a)?)?;
    }
    Ok(z.as_type(x.elt_type())?)
}

/// Matrix product of two additive sharings via a matrix Beaver triple.
pub async fn mat_mul_aa<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
    y: &RingTensor,
) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    expect_arith(y)?;
    let MaskedOpen { a, b, c, x_a, y_b } = mul_open(ctx, x, y, true).await?;
    let mut z = ring_add(&ring_add(&ring_mmul(&x_a, &b)?, &ring_mmul(&a, &y_b)?)?, &c)?;
    if ctx.rank() == 0 {
        z = ring_add(&z, &ring_mmul(&x_a, &y_b)?)?;
    }
    Ok(z.as_type(x.elt_type())?)
}

/// Multiplies an additive sharing by a 1-bit boolean sharing.
///
/// With `xx_i = (1-2·y_i)·x_i` and `yy_i = y_i`, the XOR turns into ring
/// arithmetic: `(x0+x1)·(y0⊕y1) = Σ z_i - xx_i·yy_i + x_i·yy_i` where the
/// `z_i` come from the standard masked-open multiplication of `xx` and `yy`.
/// The boolean word may carry garbage above bit 0 and is masked first.
pub async fn mul_a1b<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
    y: &RingTensor,
) -> Result<RingTensor, Error> {
    expect_arith(x)?;
    expect_bit(y)?;
    expect_same_field(x, y)?;
    expect_same_shape(x, y)?;
    let field = x.field();

    let yy = ring_bitmask(y, 0, 1)?;
    let xx = ring_mul(
        &ring_sub(&ring_ones(field, x.shape().clone()), &ring_lshift(&yy, &[1])?)?,
        x,
    )?;

    let MaskedOpen { a, b, c, x_a: xx_a, y_b: yy_b } = mul_open(ctx, &xx, &yy, false).await?;

    let mut z = ring_add(&ring_add(&ring_mul(&b, &xx_a)?, &ring_mul(&a, &yy_b)?)?, &c)?;
    z = ring_sub(&z, &ring_mul(&xx, &yy)?)?;
    if ctx.rank() == 0 {
        z = ring_add(&z, &ring_mul(&xx_a, &yy_b)?)?;
    }
    z = ring_add(&z, &ring_mul(x, &yy)?)?;
    Ok(z.as_type(x.elt_type())?)
}

/// Multiplies two private values held by different parties into an additive
/// sharing. Two parties only.
///
/// With a pair `a0·a1 = c0 + c1`, each party sends its masked input
/// `a + input` to the other; rank 0 outputs `tmp·x + c0` and rank 1 outputs
/// `-a·tmp + c1`, which sum to `x·y`.
pub async fn mul_vvs<C: Channel, B: Beaver>(
    ctx: &mut Semi2kContext<C, B>,
    x: &RingTensor,
    y: &RingTensor,
) -> Result<RingTensor, Error> {
    let x_rank = owner_of(x)?;
    let y_rank = owner_of(y)?;
    if x_rank == y_rank {
        return Err(Error::EqualOwners(x_rank));
    }
    expect_same_field(x, y)?;
    expect_same_shape(x, y)?;
    let field = x.field();
    let numel = x.numel();
    let rank = ctx.rank();

    let input = if rank == x_rank {
        x
    } else if rank == y_rank {
        y
    } else {
        return Err(Error::InvalidRank(rank));
    };

    let (a_buf, c_buf) = ctx.beaver.mul_priv(field, numel)?;
    let a = unflatten(&a_buf, EltType::raw(field), x.shape().clone())?;
    let c = unflatten(&c_buf, EltType::raw(field), x.shape().clone())?;

    let a_x = ring_add(&a, input)?;
    ctx.comm.send(ctx.comm.next_rank(), &a_x, "a0+x_or_a1+y").await?;
    let tmp = ctx
        .comm
        .recv(ctx.comm.prev_rank(), EltType::raw(field), x.shape(), "a0+x_or_a1+y")
        .await?;
    ctx.comm
        .add_comm_stats_manually(1, (field.size_of_elem() * 8 * numel) as u64);

    let z = match rank {
        0 => ring_add(&ring_mul(&tmp, input)?, &c)?,
        1 => ring_add(&ring_mul(&tmp, &ring_neg(&a)?)?, &c)?,
        r => return Err(Error::InvalidRank(r)),
    };
    Ok(z.as_type(EltType::arith(field))?)
}
