//! The per-context cache of opened masked operands.
//!
//! Caching a tensor makes its Beaver mask reproducible: the first
//! multiplication involving the tensor records the mask's replay descriptor
//! and stores the opened `x - a`, and later multiplications rewind the mask
//! instead of opening again, saving a communication round per reuse. Only
//! the opened value — which is already public — is retained.
//!
//! Entries are keyed by buffer identity (not value), separately for
//! elementwise and matrix masks, because the two shapes of mask material are
//! not interchangeable. Cached buffers must not be mutated; the tensor type
//! has no mutating primitives, so enabling the cache on a tensor is always
//! sound.

use std::collections::{HashMap, HashSet};

use crate::beaver::{ReplayDesc, ReplayStatus};
use crate::ring::RingTensor;

/// A snapshot of the cache state for one operand of one multiplication.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    /// Whether caching is active for the operand's buffer.
    pub enabled: bool,
    /// The mask descriptor: `Init` until an opening has been stored.
    pub desc: ReplayDesc,
    /// The opened `x - a`, present once stored.
    pub open: Option<RingTensor>,
}

/// The cache of opened masked operands, owned by the evaluation context.
#[derive(Debug, Default)]
pub struct BeaverCache {
    enabled: HashSet<u64>,
    entries: HashMap<(u64, bool), (ReplayDesc, RingTensor)>,
}

impl BeaverCache {
    /// An empty cache.
    pub fn new() -> Self {
        BeaverCache::default()
    }

    /// Starts caching openings of the tensor's buffer.
    pub fn enable(&mut self, x: &RingTensor) {
        self.enabled.insert(x.buffer_id());
    }

    /// Stops caching the tensor's buffer and drops any stored openings.
    pub fn disable(&mut self, x: &RingTensor) {
        let id = x.buffer_id();
        self.enabled.remove(&id);
        self.entries.remove(&(id, false));
        self.entries.remove(&(id, true));
    }

    /// Drops every entry and disables all buffers.
    pub fn clear(&mut self) {
        self.enabled.clear();
        self.entries.clear();
    }

    pub(crate) fn get(&self, x: &RingTensor, mmul: bool) -> CacheEntry {
        let id = x.buffer_id();
        let enabled = self.enabled.contains(&id);
        match self.entries.get(&(id, mmul)) {
            Some((desc, open)) if enabled => CacheEntry {
                enabled,
                desc: desc.clone(),
                open: Some(open.clone()),
            },
            _ => CacheEntry { enabled, desc: ReplayDesc::new(), open: None },
        }
    }

    pub(crate) fn set(&mut self, x: &RingTensor, mmul: bool, mut desc: ReplayDesc, opened: RingTensor) {
        desc.status = ReplayStatus::Replay;
        self.entries.insert((x.buffer_id(), mmul), (desc, opened));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{EltType, RingBuffer, RingField, RingTensor, Shape};

    fn tensor(vals: &[u128]) -> RingTensor {
        RingTensor::new(
            RingBuffer::from_u128_slice(RingField::F64, vals),
            EltType::arith(RingField::F64),
            Shape::new(vec![vals.len()]),
        )
        .unwrap()
    }

    #[test]
    fn entries_follow_the_enable_store_disable_lifecycle() {
        let mut cache = BeaverCache::new();
        let x = tensor(&[1, 2, 3]);
        assert!(!cache.get(&x, false).enabled);

        cache.enable(&x);
        let entry = cache.get(&x, false);
        assert!(entry.enabled);
        assert_eq!(entry.desc.status, ReplayStatus::Init);
        assert!(entry.open.is_none());

        let opened = tensor(&[7, 8, 9]);
        cache.set(&x, false, ReplayDesc::new(), opened);
        let entry = cache.get(&x, false);
        assert_eq!(entry.desc.status, ReplayStatus::Replay);
        assert!(entry.open.is_some());
        // the matrix keyspace is independent
        assert_eq!(cache.get(&x, true).desc.status, ReplayStatus::Init);

        cache.disable(&x);
        let entry = cache.get(&x, false);
        assert!(!entry.enabled);
        assert!(entry.open.is_none());
    }

    #[test]
    fn retagged_views_share_the_entry() {
        let mut cache = BeaverCache::new();
        let x = tensor(&[4, 5]);
        let view = x.as_type(EltType::raw(RingField::F64)).unwrap();
        cache.enable(&x);
        assert!(cache.get(&view, false).enabled);
    }
}
