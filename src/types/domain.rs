//! Index-space domains and domain points.
//!
//! An index launch runs over a dense rectangle of up to three dimensions.
//! Point iteration is lexicographic; the deterministic-reduction fold relies
//! on this being the one canonical order for a domain.

use core::fmt;
use serde::Serialize;

/// Maximum supported dimensionality.
pub const MAX_DIM: usize = 3;

/// One concrete point of an index domain.
///
/// Coordinates beyond `dim` are always zero, so derived equality, ordering
/// and hashing see a canonical form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DomainPoint {
    coords: [i64; MAX_DIM],
    dim: u8,
}

impl DomainPoint {
    /// A 1-D point.
    #[must_use]
    pub const fn p1(x: i64) -> Self {
        Self {
            coords: [x, 0, 0],
            dim: 1,
        }
    }

    /// A 2-D point.
    #[must_use]
    pub const fn p2(x: i64, y: i64) -> Self {
        Self {
            coords: [x, y, 0],
            dim: 2,
        }
    }

    /// A 3-D point.
    #[must_use]
    pub const fn p3(x: i64, y: i64, z: i64) -> Self {
        Self {
            coords: [x, y, z],
            dim: 3,
        }
    }

    /// Dimensionality of the point.
    #[must_use]
    pub const fn dim(&self) -> u8 {
        self.dim
    }

    /// The coordinate along `axis` (zero beyond `dim`).
    #[must_use]
    pub const fn coord(&self, axis: usize) -> i64 {
        self.coords[axis]
    }

    pub(crate) const fn from_raw(coords: [i64; MAX_DIM], dim: u8) -> Self {
        Self { coords, dim }
    }

    pub(crate) const fn raw_coords(&self) -> [i64; MAX_DIM] {
        self.coords
    }
}

impl fmt::Debug for DomainPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for axis in 0..self.dim as usize {
            if axis > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", self.coords[axis])?;
        }
        write!(f, ")")
    }
}

/// A dense, inclusive rectangle `[lo, hi]` of up to three dimensions.
///
/// An empty domain has `hi < lo` along some axis.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IndexDomain {
    lo: [i64; MAX_DIM],
    hi: [i64; MAX_DIM],
    dim: u8,
}

impl IndexDomain {
    /// A 1-D inclusive range `[lo, hi]`.
    #[must_use]
    pub const fn d1(lo: i64, hi: i64) -> Self {
        Self {
            lo: [lo, 0, 0],
            hi: [hi, 0, 0],
            dim: 1,
        }
    }

    /// A 2-D inclusive rectangle.
    #[must_use]
    pub const fn d2(lo: (i64, i64), hi: (i64, i64)) -> Self {
        Self {
            lo: [lo.0, lo.1, 0],
            hi: [hi.0, hi.1, 0],
            dim: 2,
        }
    }

    /// A 3-D inclusive box.
    #[must_use]
    pub const fn d3(lo: (i64, i64, i64), hi: (i64, i64, i64)) -> Self {
        Self {
            lo: [lo.0, lo.1, lo.2],
            hi: [hi.0, hi.1, hi.2],
            dim: 3,
        }
    }

    /// Dimensionality of the domain.
    #[must_use]
    pub const fn dim(&self) -> u8 {
        self.dim
    }

    /// Lower bound along `axis`.
    #[must_use]
    pub const fn lo(&self, axis: usize) -> i64 {
        self.lo[axis]
    }

    /// Upper bound along `axis`.
    #[must_use]
    pub const fn hi(&self, axis: usize) -> i64 {
        self.hi[axis]
    }

    /// True if the domain contains no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        (0..self.dim as usize).any(|axis| self.hi[axis] < self.lo[axis])
    }

    /// Number of points in the domain.
    #[must_use]
    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (0..self.dim as usize)
            .map(|axis| (self.hi[axis] - self.lo[axis] + 1) as u64)
            .product()
    }

    /// True if `point` lies inside the domain (and dimensions agree).
    #[must_use]
    pub fn contains(&self, point: DomainPoint) -> bool {
        point.dim() == self.dim
            && (0..self.dim as usize)
                .all(|axis| self.lo[axis] <= point.coord(axis) && point.coord(axis) <= self.hi[axis])
    }

    /// True if the two domains share at least one point.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.dim != other.dim || self.is_empty() || other.is_empty() {
            return false;
        }
        (0..self.dim as usize)
            .all(|axis| self.lo[axis] <= other.hi[axis] && other.lo[axis] <= self.hi[axis])
    }

    /// Iterates every point in lexicographic order.
    #[must_use]
    pub fn points(&self) -> PointIter {
        PointIter {
            domain: *self,
            next: if self.is_empty() {
                None
            } else {
                Some(self.lo)
            },
        }
    }

    /// Splits the domain into at most `parts` contiguous pieces along its
    /// first axis. Used by the default mapper; any decomposition whose
    /// volumes sum to the whole is acceptable to the engine.
    #[must_use]
    pub fn split_even(&self, parts: u64) -> Vec<Self> {
        if self.is_empty() || parts == 0 {
            return Vec::new();
        }
        let extent = (self.hi[0] - self.lo[0] + 1) as u64;
        let parts = parts.min(extent);
        let base = extent / parts;
        let extra = extent % parts;
        let mut pieces = Vec::with_capacity(parts as usize);
        let mut start = self.lo[0];
        for piece in 0..parts {
            let len = base + u64::from(piece < extra);
            let mut sub = *self;
            sub.lo[0] = start;
            sub.hi[0] = start + len as i64 - 1;
            start = sub.hi[0] + 1;
            pieces.push(sub);
        }
        pieces
    }

    pub(crate) const fn from_raw(lo: [i64; MAX_DIM], hi: [i64; MAX_DIM], dim: u8) -> Self {
        Self { lo, hi, dim }
    }

    pub(crate) const fn raw_bounds(&self) -> ([i64; MAX_DIM], [i64; MAX_DIM]) {
        (self.lo, self.hi)
    }
}

impl fmt::Debug for IndexDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}..{:?}]",
            DomainPoint::from_raw(self.lo, self.dim),
            DomainPoint::from_raw(self.hi, self.dim)
        )
    }
}

/// Lexicographic point iterator over an [`IndexDomain`].
#[derive(Debug, Clone)]
pub struct PointIter {
    domain: IndexDomain,
    next: Option<[i64; MAX_DIM]>,
}

impl Iterator for PointIter {
    type Item = DomainPoint;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let point = DomainPoint::from_raw(current, self.domain.dim);
        // Advance the last axis first, carrying toward axis 0.
        let mut coords = current;
        let dim = self.domain.dim as usize;
        let mut axis = dim;
        loop {
            if axis == 0 {
                self.next = None;
                break;
            }
            axis -= 1;
            if coords[axis] < self.domain.hi[axis] {
                coords[axis] += 1;
                self.next = Some(coords);
                break;
            }
            coords[axis] = self.domain.lo[axis];
        }
        Some(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_and_emptiness() {
        assert_eq!(IndexDomain::d1(0, 7).volume(), 8);
        assert_eq!(IndexDomain::d2((0, 0), (3, 1)).volume(), 8);
        assert!(IndexDomain::d1(4, 3).is_empty());
        assert_eq!(IndexDomain::d1(4, 3).volume(), 0);
    }

    #[test]
    fn points_are_lexicographic() {
        let pts: Vec<DomainPoint> = IndexDomain::d2((0, 0), (1, 1)).points().collect();
        assert_eq!(
            pts,
            vec![
                DomainPoint::p2(0, 0),
                DomainPoint::p2(0, 1),
                DomainPoint::p2(1, 0),
                DomainPoint::p2(1, 1),
            ]
        );
    }

    #[test]
    fn point_count_matches_volume() {
        let domain = IndexDomain::d3((0, -1, 2), (2, 1, 3));
        assert_eq!(domain.points().count() as u64, domain.volume());
    }

    #[test]
    fn split_even_partitions_volume() {
        let domain = IndexDomain::d1(0, 7);
        let pieces = domain.split_even(3);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces.iter().map(IndexDomain::volume).sum::<u64>(), 8);
        for (i, a) in pieces.iter().enumerate() {
            for b in &pieces[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
    }

    #[test]
    fn split_never_produces_empty_pieces() {
        let domain = IndexDomain::d1(0, 2);
        let pieces = domain.split_even(8);
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| !p.is_empty()));
    }

    #[test]
    fn overlap_detection() {
        let a = IndexDomain::d1(0, 3);
        let b = IndexDomain::d1(3, 5);
        let c = IndexDomain::d1(4, 5);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
