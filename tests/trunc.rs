//! Multi-party tests for the truncation protocols: results are compared to
//! the plaintext arithmetic shift with the documented error tolerances.

mod common;

use common::{decode_tensor, public_tensor, run_parties};
use semi2k::kernel::arith::{a2p, p2a};
use semi2k::kernel::trunc::{trunc_a, trunc_a_pr, trunc_a_pr2};
use semi2k::kernel::{Error, Sign};
use semi2k::ring::RingField;

fn assert_within_one(actual: &[i128], expected: &[i128], what: &str) {
    for (a, e) in actual.iter().zip(expected) {
        assert!(
            (a - e).abs() <= 1,
            "{what}: got {a}, expected {e} (±1)"
        );
    }
}

#[tokio::test]
async fn two_party_truncation_shifts_locally() {
    let outs = run_parties(2, |mut ctx| async move {
        let x = p2a(&mut ctx, &public_tensor(RingField::F64, &[1 << 20, -(1 << 20), 4095]))?;
        let z = trunc_a(&mut ctx, &x, 10, Sign::Unknown).await?;
        a2p(&mut ctx, &z).await
    })
    .await;
    for out in outs {
        assert_within_one(&decode_tensor(&out), &[1024, -1024, 3], "local truncation");
    }
}

#[tokio::test]
async fn many_party_truncation_uses_pairs() {
    // magnitudes stay far below 2^(k-2): the pair method fails with
    // probability ~|x| / 2^k when the opened difference wraps
    for field in [RingField::F32, RingField::F64, RingField::F128] {
        let outs = run_parties(3, |mut ctx| async move {
            let x = p2a(&mut ctx, &public_tensor(field, &[1 << 10, -(1 << 10), 0]))?;
            let z = trunc_a(&mut ctx, &x, 5, Sign::Unknown).await?;
            a2p(&mut ctx, &z).await
        })
        .await;
        for out in outs {
            assert_within_one(&decode_tensor(&out), &[32, -32, 0], "pair truncation");
        }
    }
}

#[tokio::test]
async fn truncation_accepts_a_sign_hint() {
    let outs = run_parties(2, |mut ctx| async move {
        let x = p2a(&mut ctx, &public_tensor(RingField::F64, &[1 << 16]))?;
        let z = trunc_a(&mut ctx, &x, 8, Sign::Positive).await?;
        a2p(&mut ctx, &z).await
    })
    .await;
    for out in outs {
        assert_within_one(&decode_tensor(&out), &[256], "hinted truncation");
    }
}

#[tokio::test]
async fn probabilistic_truncation_of_zero_is_exact() {
    for world in [2, 3] {
        let outs = run_parties(world, |mut ctx| async move {
            let x = p2a(&mut ctx, &public_tensor(RingField::F64, &[0, 0, 0, 0]))?;
            let z = trunc_a_pr(&mut ctx, &x, 18, Sign::Unknown).await?;
            a2p(&mut ctx, &z).await
        })
        .await;
        for out in outs {
            assert_eq!(decode_tensor(&out), vec![0, 0, 0, 0], "{world} parties");
        }
    }
}

#[tokio::test]
async fn probabilistic_truncation_is_off_by_at_most_one() {
    for field in [RingField::F32, RingField::F64, RingField::F128] {
        let outs = run_parties(2, |mut ctx| async move {
            let vals: Vec<i128> = vec![1 << 20, -(1 << 20), 123_456, -77, 1, -1];
            let expected: Vec<i128> = vals.iter().map(|v| v >> 10).collect();
            let x = p2a(&mut ctx, &public_tensor(field, &vals))?;
            let z = trunc_a_pr(&mut ctx, &x, 10, Sign::Unknown).await?;
            let opened = a2p(&mut ctx, &z).await?;
            Ok((opened, expected))
        })
        .await;
        for (out, expected) in outs {
            assert_within_one(&decode_tensor(&out), &expected, "probabilistic truncation");
        }
    }
}

#[tokio::test]
async fn geometric_truncation_of_zero_is_exact() {
    // the +1 path is taken only when a share split lands on a multiple of
    // 2^bits, which at 40 bits happens with probability 2^-40
    let outs = run_parties(2, |mut ctx| async move {
        let x = p2a(&mut ctx, &public_tensor(RingField::F64, &[0, 0]))?;
        let z = trunc_a_pr2(&mut ctx, &x, 40, Sign::Unknown).await?;
        a2p(&mut ctx, &z).await
    })
    .await;
    for out in outs {
        assert_eq!(decode_tensor(&out), vec![0, 0]);
    }
}

#[tokio::test]
async fn geometric_truncation_is_off_by_at_most_one() {
    // bit widths on both sides of the trunc-field boundary
    for bits in [10u32, 40] {
        let outs = run_parties(2, |mut ctx| async move {
            let vals: Vec<i128> = vec![1 << 50, -(1 << 50), 987_654_321, -42];
            let expected: Vec<i128> = vals.iter().map(|v| v >> bits).collect();
            let x = p2a(&mut ctx, &public_tensor(RingField::F64, &vals))?;
            let z = trunc_a_pr2(&mut ctx, &x, bits, Sign::Unknown).await?;
            let opened = a2p(&mut ctx, &z).await?;
            Ok((opened, expected))
        })
        .await;
        for (out, expected) in outs {
            assert_within_one(&decode_tensor(&out), &expected, "geometric truncation");
        }
    }
}

#[tokio::test]
async fn oversized_bit_counts_are_rejected() {
    let outs = run_parties(2, |mut ctx| async move {
        let x = p2a(&mut ctx, &public_tensor(RingField::F32, &[1]))?;
        let a = trunc_a(&mut ctx, &x, 200, Sign::Unknown).await;
        let b = trunc_a_pr(&mut ctx, &x, 31, Sign::Unknown).await;
        let c = trunc_a_pr2(&mut ctx, &x, 200, Sign::Unknown).await;
        Ok((
            matches!(a, Err(Error::InvalidTruncBits(200))),
            matches!(b, Err(Error::InvalidTruncBits(31))),
            matches!(c, Err(Error::InvalidTruncBits(200))),
        ))
    })
    .await;
    for (a, b, c) in outs {
        assert!(a && b && c);
    }
}
