//! Multi-party tests for share conversions, linear operations and the
//! multiplication family: every operation is exercised end to end over
//! in-process channels and checked against plaintext ring arithmetic.

mod common;

use common::{decode_tensor, encode, public_matrix, public_tensor, run_parties};
use semi2k::kernel::arith::{
    a2p, a2v, add_aa, add_ap, disable_cache, enable_cache, lshift_a, mat_mul_aa, mat_mul_ap,
    mul_a1b, mul_aa, mul_ap, mul_vvs, negate_a, p2a, rand_a, square_a, v2a,
};
use semi2k::kernel::Error;
use semi2k::ring::{EltType, Kind, RingBuffer, RingField, RingTensor, Shape};

const ALL_FIELDS: [RingField; 3] = [RingField::F32, RingField::F64, RingField::F128];

#[tokio::test]
async fn public_round_trip_over_all_fields() {
    for field in ALL_FIELDS {
        for world in [2, 3] {
            let outs = run_parties(world, |mut ctx| async move {
                let x = p2a(&mut ctx, &public_tensor(field, &[7, -3, 0]))?;
                a2p(&mut ctx, &x).await
            })
            .await;
            for out in outs {
                assert_eq!(decode_tensor(&out), vec![7, -3, 0], "{field}, {world} parties");
            }
        }
    }
}

#[tokio::test]
async fn shares_of_a_public_value_sum_to_it() {
    let shares = run_parties(3, |mut ctx| async move {
        p2a(&mut ctx, &public_tensor(RingField::F64, &[42]))
    })
    .await;
    let total: u128 = shares.iter().map(|s| s.to_u128_vec()[0]).fold(0, u128::wrapping_add);
    assert_eq!(total & (u64::MAX as u128), 42);
    // no single share is the plaintext (the masks are uniform; 42 would be a
    // 2^-64 coincidence)
    for share in &shares {
        assert_ne!(share.to_u128_vec()[0], 42);
    }
}

#[tokio::test]
async fn private_values_convert_and_reveal() {
    let outs = run_parties(3, |mut ctx| async move {
        let field = RingField::F64;
        let ty = EltType::private(field, 1);
        let x = if ctx.rank() == 1 {
            RingTensor::new(
                RingBuffer::from_u128_slice(field, &[encode(field, -99)]),
                ty,
                Shape::new(vec![1]),
            )?
        } else {
            RingTensor::placeholder(ty, Shape::new(vec![1]))
        };
        let shared = v2a(&mut ctx, &x)?;
        let revealed = a2v(&mut ctx, &shared, 1).await?;
        Ok((ctx.rank(), revealed))
    })
    .await;
    for (rank, revealed) in outs {
        assert_eq!(revealed.kind(), Kind::Priv(1));
        if rank == 1 {
            assert_eq!(decode_tensor(&revealed), vec![-99]);
        }
    }
}

#[tokio::test]
async fn linear_operations_reconstruct_correctly() {
    let outs = run_parties(2, |mut ctx| async move {
        let field = RingField::F64;
        let x = p2a(&mut ctx, &public_tensor(field, &[10, -4, 3]))?;
        let y = p2a(&mut ctx, &public_tensor(field, &[1, 2, -3]))?;
        let p = public_tensor(field, &[5, -1, 2]);

        let sum = a2p(&mut ctx, &add_aa(&x, &y)?).await?;
        let biased = add_ap(&ctx, &x, &p)?;
        let sum_p = a2p(&mut ctx, &biased).await?;
        let neg = a2p(&mut ctx, &negate_a(&x)?).await?;
        let prod_p = a2p(&mut ctx, &mul_ap(&x, &p)?).await?;
        let shifted = a2p(&mut ctx, &lshift_a(&x, &[3])?).await?;
        Ok((sum, sum_p, neg, prod_p, shifted))
    })
    .await;
    for (sum, sum_p, neg, prod_p, shifted) in outs {
        assert_eq!(decode_tensor(&sum), vec![11, -2, 0]);
        assert_eq!(decode_tensor(&sum_p), vec![15, -5, 5]);
        assert_eq!(decode_tensor(&neg), vec![-10, 4, -3]);
        assert_eq!(decode_tensor(&prod_p), vec![50, 4, 6]);
        assert_eq!(decode_tensor(&shifted), vec![80, -32, 24]);
    }
}

#[tokio::test]
async fn multiplication_reconstructs_the_product() {
    for field in ALL_FIELDS {
        for world in [2, 3] {
            let outs = run_parties(world, |mut ctx| async move {
                let x = p2a(&mut ctx, &public_tensor(field, &[5, -7, 0, 11]))?;
                let y = p2a(&mut ctx, &public_tensor(field, &[-3, -2, 9, 11]))?;
                let z = mul_aa(&mut ctx, &x, &y).await?;
                a2p(&mut ctx, &z).await
            })
            .await;
            for out in outs {
                assert_eq!(
                    decode_tensor(&out),
                    vec![-15, 14, 0, 121],
                    "{field}, {world} parties"
                );
            }
        }
    }
}

#[tokio::test]
async fn squaring_matches_the_plain_square() {
    let outs = run_parties(2, |mut ctx| async move {
        let x = p2a(&mut ctx, &public_tensor(RingField::F64, &[2, -6, 0]))?;
        let z = square_a(&mut ctx, &x).await?;
        a2p(&mut ctx, &z).await
    })
    .await;
    for out in outs {
        assert_eq!(decode_tensor(&out), vec![4, 36, 0]);
    }
}

#[tokio::test]
async fn matrix_multiplication_by_the_identity() {
    let outs = run_parties(2, |mut ctx| async move {
        let field = RingField::F64;
        let id = p2a(
            &mut ctx,
            &public_matrix(field, 3, 3, &[1, 0, 0, 0, 1, 0, 0, 0, 1]),
        )?;
        let v = p2a(&mut ctx, &public_matrix(field, 3, 1, &[1, 2, 3]))?;
        let z = mat_mul_aa(&mut ctx, &id, &v).await?;
        a2p(&mut ctx, &z).await
    })
    .await;
    for out in outs {
        assert_eq!(decode_tensor(&out), vec![1, 2, 3]);
        assert_eq!(out.shape().dims(), &[3, 1]);
    }
}

#[tokio::test]
async fn matrix_multiplication_against_plaintext() {
    let outs = run_parties(3, |mut ctx| async move {
        let field = RingField::F32;
        let a = p2a(&mut ctx, &public_matrix(field, 2, 3, &[1, 2, 3, 4, 5, 6]))?;
        let b = p2a(&mut ctx, &public_matrix(field, 3, 2, &[7, 8, 9, 10, -11, -12]))?;
        let z = mat_mul_aa(&mut ctx, &a, &b).await?;
        let z = mat_mul_ap(&z, &public_matrix(field, 2, 2, &[1, 0, 0, 1]))?;
        a2p(&mut ctx, &z).await
    })
    .await;
    // [1 2 3; 4 5 6] * [7 8; 9 10; -11 -12] = [-8 -8; 7 10]
    for out in outs {
        assert_eq!(decode_tensor(&out), vec![-8, -8, 7, 10]);
    }
}

#[tokio::test]
async fn arithmetic_times_boolean_bit() {
    for bit in [0u128, 1] {
        let outs = run_parties(2, |mut ctx| async move {
            let field = RingField::F64;
            let x = p2a(&mut ctx, &public_tensor(field, &[7, -5]))?;
            // bit shares with garbage above bit 0: the kernel must mask it
            let word = if ctx.rank() == 0 {
                0xABCD_EF00u128 | 1
            } else {
                0x1234_5600u128 | bit
            };
            let y = RingTensor::new(
                RingBuffer::from_u128_slice(field, &[word, word]),
                EltType::bit(field),
                Shape::new(vec![2]),
            )?;
            let z = mul_a1b(&mut ctx, &x, &y).await?;
            a2p(&mut ctx, &z).await
        })
        .await;
        // rank 0 holds bit 1, rank 1 holds `bit`, so the shared bit is 1^bit
        let expected = if bit == 1 { vec![0, 0] } else { vec![7, -5] };
        for out in outs {
            assert_eq!(decode_tensor(&out), expected, "bit = {bit}");
        }
    }
}

#[tokio::test]
async fn private_times_private_for_both_owner_layouts() {
    for (owner_x, owner_y) in [(0usize, 1usize), (1, 0)] {
        let outs = run_parties(2, |mut ctx| async move {
            let field = RingField::F64;
            let make = |owner: usize, value: i128, ctx_rank: usize| -> Result<RingTensor, Error> {
                let ty = EltType::private(field, owner);
                if ctx_rank == owner {
                    Ok(RingTensor::new(
                        RingBuffer::from_u128_slice(field, &[encode(field, value)]),
                        ty,
                        Shape::new(vec![1]),
                    )?)
                } else {
                    Ok(RingTensor::placeholder(ty, Shape::new(vec![1])))
                }
            };
            let x = make(owner_x, 9, ctx.rank())?;
            let y = make(owner_y, 4, ctx.rank())?;
            let z = mul_vvs(&mut ctx, &x, &y).await?;
            a2p(&mut ctx, &z).await
        })
        .await;
        for out in outs {
            assert_eq!(decode_tensor(&out), vec![36], "owners ({owner_x},{owner_y})");
        }
    }
}

#[tokio::test]
async fn private_times_private_rejects_equal_owners() {
    let outs = run_parties(2, |mut ctx| async move {
        let field = RingField::F64;
        let ty = EltType::private(field, 0);
        let x = RingTensor::placeholder(ty, Shape::new(vec![1]));
        let y = RingTensor::placeholder(ty, Shape::new(vec![1]));
        Ok(matches!(
            mul_vvs(&mut ctx, &x, &y).await,
            Err(Error::EqualOwners(0))
        ))
    })
    .await;
    assert!(outs.into_iter().all(|ok| ok));
}

#[tokio::test]
async fn random_sharings_stay_in_the_signed_range() {
    let outs = run_parties(2, |mut ctx| async move {
        let field = RingField::F64;
        let x = rand_a(&mut ctx, field, Shape::new(vec![64]))?;
        a2p(&mut ctx, &x).await
    })
    .await;
    let bound = 1i128 << 62;
    for out in outs {
        for v in decode_tensor(&out) {
            assert!(-bound <= v && v < bound, "sample {v} outside [-2^62, 2^62)");
        }
    }
}

#[tokio::test]
async fn aliased_multiplication_equals_squaring() {
    let outs = run_parties(2, |mut ctx| async move {
        let field = RingField::F64;
        let x = p2a(&mut ctx, &public_tensor(field, &[6, -9]))?;
        enable_cache(&mut ctx, &x);
        // x * x with the cache enabled: the aliasing guard must keep the two
        // mask openings apart
        let via_mul = mul_aa(&mut ctx, &x, &x).await?;
        let rounds_before_square = ctx.comm.rounds();
        let via_square = square_a(&mut ctx, &x).await?;
        let square_rounds = ctx.comm.rounds() - rounds_before_square;
        disable_cache(&mut ctx, &x);
        let m = a2p(&mut ctx, &via_mul).await?;
        let s = a2p(&mut ctx, &via_square).await?;
        Ok((m, s, square_rounds))
    })
    .await;
    for (m, s, square_rounds) in outs {
        assert_eq!(decode_tensor(&m), vec![36, 81]);
        assert_eq!(decode_tensor(&s), vec![36, 81]);
        // the squaring replayed the cached opening: no communication at all
        assert_eq!(square_rounds, 0);
    }
}

#[tokio::test]
async fn cache_replay_saves_one_opening_round() {
    let outs = run_parties(2, |mut ctx| async move {
        ctx.vectorize = false;
        let field = RingField::F64;
        let x = p2a(&mut ctx, &public_tensor(field, &[3, 5]))?;
        let y1 = p2a(&mut ctx, &public_tensor(field, &[2, 4]))?;
        let y2 = p2a(&mut ctx, &public_tensor(field, &[-7, 9]))?;

        enable_cache(&mut ctx, &x);
        let start = ctx.comm.rounds();
        let z1 = mul_aa(&mut ctx, &x, &y1).await?;
        let z2 = mul_aa(&mut ctx, &x, &y2).await?;
        let cached_rounds = ctx.comm.rounds() - start;
        disable_cache(&mut ctx, &x);

        let start = ctx.comm.rounds();
        let w1 = mul_aa(&mut ctx, &x, &y1).await?;
        let w2 = mul_aa(&mut ctx, &x, &y2).await?;
        let uncached_rounds = ctx.comm.rounds() - start;

        let z1 = a2p(&mut ctx, &z1).await?;
        let z2 = a2p(&mut ctx, &z2).await?;
        let w1 = a2p(&mut ctx, &w1).await?;
        let w2 = a2p(&mut ctx, &w2).await?;
        Ok((cached_rounds, uncached_rounds, z1, z2, w1, w2))
    })
    .await;
    for (cached_rounds, uncached_rounds, z1, z2, w1, w2) in outs {
        assert_eq!(decode_tensor(&z1), vec![6, 20]);
        assert_eq!(decode_tensor(&z2), vec![-21, 45]);
        assert_eq!(decode_tensor(&w1), vec![6, 20]);
        assert_eq!(decode_tensor(&w2), vec![-21, 45]);
        assert_eq!(cached_rounds, uncached_rounds - 1, "replay must skip one open");
    }
}

#[tokio::test]
async fn kind_mismatches_are_rejected() {
    let outs = run_parties(2, |mut ctx| async move {
        let field = RingField::F64;
        let p = public_tensor(field, &[1]);
        // a2p requires an additive sharing
        let err = a2p(&mut ctx, &p).await;
        Ok(matches!(err, Err(Error::KindMismatch { .. })))
    })
    .await;
    assert!(outs.into_iter().all(|ok| ok));
}

#[tokio::test]
async fn shape_mismatches_are_rejected() {
    let outs = run_parties(2, |mut ctx| async move {
        let field = RingField::F64;
        let x = p2a(&mut ctx, &public_tensor(field, &[1, 2]))?;
        let y = p2a(&mut ctx, &public_tensor(field, &[1, 2, 3]))?;
        Ok(matches!(mul_aa(&mut ctx, &x, &y).await, Err(Error::Ring(_))))
    })
    .await;
    assert!(outs.into_iter().all(|ok| ok));
}
