//! Party-local pseudorandomness: a private stream plus correlated streams
//! shared with the two neighbouring parties.
//!
//! The correlated setup arranges the parties in a ring: every adjacent pair
//! (i, i+1) holds a jointly sampled ChaCha20 seed. When all parties draw a
//! pair `(r0, r1)` — `r0` from the seed shared with the next rank, `r1` from
//! the seed shared with the previous rank — the differences `r0 - r1`
//! telescope to zero across the ring. That is exactly the zero-sum masking
//! the share conversions need, and it requires no communication after setup.
//!
//! All parties must draw in lockstep (same fields, same shapes, same order);
//! the correlated streams advance together and a desynchronized draw leaves
//! the session unusable.

use rand::{random, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::channel::{self, recv_from, send_to, Channel};
use crate::ring::{EltType, RingBuffer, RingField, RingTensor, Shape};

/// One party's sources of pseudorandomness.
#[derive(Debug)]
pub struct PrgState {
    priv_rng: ChaCha20Rng,
    /// Stream of the seed shared with the next rank (this party is "first").
    next_rng: ChaCha20Rng,
    /// Stream of the seed shared with the previous rank (this party is "second").
    prev_rng: ChaCha20Rng,
}

impl PrgState {
    /// Creates correlated states for all parties in one process, for tests
    /// and local simulations. The analogue of
    /// [`SimpleChannel::channels`](crate::channel::SimpleChannel::channels).
    pub fn setup_local(parties: usize) -> Vec<PrgState> {
        let seeds: Vec<[u8; 32]> = (0..parties).map(|_| random()).collect();
        (0..parties)
            .map(|i| PrgState {
                priv_rng: ChaCha20Rng::from_seed(random()),
                next_rng: ChaCha20Rng::from_seed(seeds[i]),
                prev_rng: ChaCha20Rng::from_seed(seeds[(i + parties - 1) % parties]),
            })
            .collect()
    }

    /// Establishes the correlated seeds over the wire: every party samples a
    /// seed, shares it with its next neighbour and receives one from its
    /// previous neighbour.
    pub async fn setup(
        channel: &impl Channel,
        rank: usize,
        parties: usize,
    ) -> Result<PrgState, channel::Error> {
        let next = (rank + 1) % parties;
        let prev = (rank + parties - 1) % parties;
        let seed: [u8; 32] = random();
        let (_, prev_seed): ((), [u8; 32]) = futures::future::try_join(
            send_to(channel, next, "prss seed", &seed),
            recv_from(channel, prev, "prss seed"),
        )
        .await?;
        Ok(PrgState {
            priv_rng: ChaCha20Rng::from_seed(random()),
            next_rng: ChaCha20Rng::from_seed(seed),
            prev_rng: ChaCha20Rng::from_seed(prev_seed),
        })
    }

    /// Draws a tensor of uniform ring elements only this party knows.
    pub fn gen_priv(&mut self, field: RingField, shape: Shape) -> RingTensor {
        let data = RingBuffer::sample(field, shape.numel(), &mut self.priv_rng);
        RingTensor::new(data, EltType::raw(field), shape).expect("sampled buffer matches shape")
    }

    /// Draws a correlated pair `(r0, r1)`: `r0` is also known to the next
    /// rank, `r1` to the previous rank. Across all parties the differences
    /// `r0 - r1` sum to zero. Both streams always advance, keeping the
    /// parties' counters aligned.
    pub fn gen_prss_pair(&mut self, field: RingField, shape: Shape) -> (RingTensor, RingTensor) {
        let numel = shape.numel();
        let r0 = RingBuffer::sample(field, numel, &mut self.next_rng);
        let r1 = RingBuffer::sample(field, numel, &mut self.prev_rng);
        let ty = EltType::raw(field);
        (
            RingTensor::new(r0, ty, shape.clone()).expect("sampled buffer matches shape"),
            RingTensor::new(r1, ty, shape).expect("sampled buffer matches shape"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring_sub;

    #[test]
    fn prss_differences_sum_to_zero() {
        for parties in [2, 3, 5] {
            let mut states = PrgState::setup_local(parties);
            let shape = Shape::new(vec![4]);
            let mut total = vec![0u128; 4];
            for state in &mut states {
                let (r0, r1) = state.gen_prss_pair(RingField::F64, shape.clone());
                let diff = ring_sub(&r0, &r1).unwrap();
                for (t, v) in total.iter_mut().zip(diff.to_u128_vec()) {
                    *t = (*t + v) % (1u128 << 64);
                }
            }
            assert_eq!(total, vec![0; 4], "non-zero masking sum for {parties} parties");
        }
    }

    #[test]
    fn prss_pairs_are_correlated_with_neighbours() {
        let mut states = PrgState::setup_local(3);
        let shape = Shape::new(vec![8]);
        let pairs: Vec<_> = states
            .iter_mut()
            .map(|s| s.gen_prss_pair(RingField::F32, shape.clone()))
            .collect();
        for i in 0..3 {
            let next = (i + 1) % 3;
            assert_eq!(pairs[i].0.to_u128_vec(), pairs[next].1.to_u128_vec());
        }
    }

    #[test]
    fn private_draws_differ_between_parties() {
        let mut states = PrgState::setup_local(2);
        let shape = Shape::new(vec![16]);
        let a = states[0].gen_priv(RingField::F64, shape.clone());
        let b = states[1].gen_priv(RingField::F64, shape);
        assert_ne!(a.to_u128_vec(), b.to_u128_vec());
    }
}
