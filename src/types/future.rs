//! Futures, future maps, and reduction operators.
//!
//! Task results are opaque byte payloads. An individual launch produces one
//! future; an index launch produces either a future map (one entry per point)
//! or a single future folded through a reduction operator.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::domain::DomainPoint;
use crate::types::id::RedopId;

/// An opaque task result payload.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FutureValue {
    payload: Arc<[u8]>,
}

impl FutureValue {
    /// An empty (void) result.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            payload: Arc::from(bytes),
        }
    }

    /// Convenience constructor for little-endian u64 payloads, the common
    /// shape in tests and reductions.
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    /// The raw payload bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Interprets the payload as a little-endian u64, if it is 8 bytes.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.payload.as_ref().try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    /// True if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// One future per domain point, in lexicographic point order.
#[derive(Clone, Debug, Default)]
pub struct FutureMap {
    entries: BTreeMap<DomainPoint, FutureValue>,
}

impl FutureMap {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result for `point`. Returns the previous value if the
    /// point had already reported, which the fan-in protocol treats as a
    /// protocol violation.
    pub fn insert(&mut self, point: DomainPoint, value: FutureValue) -> Option<FutureValue> {
        self.entries.insert(point, value)
    }

    /// The result for `point`, if it has arrived.
    #[must_use]
    pub fn get(&self, point: DomainPoint) -> Option<&FutureValue> {
        self.entries.get(&point)
    }

    /// Number of points that have reported.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no points have reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in lexicographic point order.
    pub fn iter(&self) -> impl Iterator<Item = (DomainPoint, &FutureValue)> {
        self.entries.iter().map(|(p, v)| (*p, v))
    }
}

/// A fold-style reduction operator over future payloads.
///
/// Implementations must be associative; deterministic index reductions
/// additionally rely on the engine folding in a fixed point order, so
/// operators need not be commutative there.
pub trait ReductionOp: Send + Sync {
    /// The identity payload.
    fn identity(&self) -> FutureValue;

    /// Folds `rhs` into `acc`.
    fn fold(&self, acc: &mut FutureValue, rhs: &FutureValue);
}

/// Registry of reduction operators keyed by id.
#[derive(Clone, Default)]
pub struct RedopRegistry {
    ops: HashMap<RedopId, Arc<dyn ReductionOp>>,
}

impl RedopRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `op` under `id`, replacing any previous registration.
    pub fn register(&mut self, id: RedopId, op: Arc<dyn ReductionOp>) {
        self.ops.insert(id, op);
    }

    /// Looks up the operator registered under `id`.
    #[must_use]
    pub fn get(&self, id: RedopId) -> Option<Arc<dyn ReductionOp>> {
        self.ops.get(&id).cloned()
    }
}

impl std::fmt::Debug for RedopRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedopRegistry")
            .field("registered", &self.ops.len())
            .finish()
    }
}

/// Wrapping u64 sum, the stock operator used throughout the tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumU64;

impl ReductionOp for SumU64 {
    fn identity(&self) -> FutureValue {
        FutureValue::from_u64(0)
    }

    fn fold(&self, acc: &mut FutureValue, rhs: &FutureValue) {
        let lhs = acc.as_u64().unwrap_or(0);
        let rhs = rhs.as_u64().unwrap_or(0);
        *acc = FutureValue::from_u64(lhs.wrapping_add(rhs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_round_trip() {
        let v = FutureValue::from_u64(0xdead_beef);
        assert_eq!(v.as_u64(), Some(0xdead_beef));
        assert!(FutureValue::empty().as_u64().is_none());
    }

    #[test]
    fn future_map_orders_points() {
        let mut map = FutureMap::new();
        map.insert(DomainPoint::p1(3), FutureValue::from_u64(3));
        map.insert(DomainPoint::p1(1), FutureValue::from_u64(1));
        map.insert(DomainPoint::p1(2), FutureValue::from_u64(2));
        let order: Vec<i64> = map.iter().map(|(p, _)| p.coord(0)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_point_is_reported() {
        let mut map = FutureMap::new();
        assert!(map
            .insert(DomainPoint::p1(0), FutureValue::from_u64(1))
            .is_none());
        assert!(map
            .insert(DomainPoint::p1(0), FutureValue::from_u64(2))
            .is_some());
    }

    #[test]
    fn sum_redop_folds() {
        let op = SumU64;
        let mut acc = op.identity();
        op.fold(&mut acc, &FutureValue::from_u64(4));
        op.fold(&mut acc, &FutureValue::from_u64(6));
        assert_eq!(acc.as_u64(), Some(10));
    }
}
