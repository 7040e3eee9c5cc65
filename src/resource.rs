//! Resource tracking for task side effects.
//!
//! A task may create or delete regions, fields, field spaces, index spaces
//! and index partitions while it runs. The tracker accumulates those records
//! so they can be merged into the parent context at completion, or shipped
//! across nodes when the task executed remotely.
//!
//! Created-region and created-field entries carry a "local only" flag: a
//! resource created and fully consumed on the executing node needs no
//! cross-node return, and the outward wire form filters such entries.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::types::{FieldId, FieldSpaceId, IndexPartitionId, IndexSpaceId, LogicalRegion};
use crate::wire::{WireReader, WireWriter};

/// A field paired with its field space, the unit of field creation.
pub type SpacedField = (FieldSpaceId, FieldId);

/// Accumulated creation and deletion records for the five resource kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTracker {
    created_regions: BTreeMap<LogicalRegion, bool>,
    deleted_regions: BTreeSet<LogicalRegion>,
    created_fields: BTreeMap<SpacedField, bool>,
    deleted_fields: BTreeSet<SpacedField>,
    created_field_spaces: BTreeSet<FieldSpaceId>,
    deleted_field_spaces: BTreeSet<FieldSpaceId>,
    created_index_spaces: BTreeSet<IndexSpaceId>,
    deleted_index_spaces: BTreeSet<IndexSpaceId>,
    created_index_partitions: BTreeSet<IndexPartitionId>,
    deleted_index_partitions: BTreeSet<IndexPartitionId>,
}

impl ResourceTracker {
    /// An empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no records have accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created_regions.is_empty()
            && self.deleted_regions.is_empty()
            && self.created_fields.is_empty()
            && self.deleted_fields.is_empty()
            && self.created_field_spaces.is_empty()
            && self.deleted_field_spaces.is_empty()
            && self.created_index_spaces.is_empty()
            && self.deleted_index_spaces.is_empty()
            && self.created_index_partitions.is_empty()
            && self.deleted_index_partitions.is_empty()
    }

    /// Records a region creation. `local_only` marks regions that never need
    /// a cross-node return.
    pub fn record_region_created(&mut self, region: LogicalRegion, local_only: bool) {
        // A key appears in the created set at most once; a second record
        // can only tighten the return requirement.
        self.created_regions
            .entry(region)
            .and_modify(|l| *l &= local_only)
            .or_insert(local_only);
    }

    /// Records a region deletion.
    pub fn record_region_deleted(&mut self, region: LogicalRegion) {
        self.deleted_regions.insert(region);
    }

    /// Records a field creation.
    pub fn record_field_created(&mut self, space: FieldSpaceId, field: FieldId, local_only: bool) {
        self.created_fields
            .entry((space, field))
            .and_modify(|l| *l &= local_only)
            .or_insert(local_only);
    }

    /// Records a field deletion.
    pub fn record_field_deleted(&mut self, space: FieldSpaceId, field: FieldId) {
        self.deleted_fields.insert((space, field));
    }

    /// Records a field-space creation.
    pub fn record_field_space_created(&mut self, space: FieldSpaceId) {
        self.created_field_spaces.insert(space);
    }

    /// Records a field-space deletion.
    pub fn record_field_space_deleted(&mut self, space: FieldSpaceId) {
        self.deleted_field_spaces.insert(space);
    }

    /// Records an index-space creation.
    pub fn record_index_space_created(&mut self, space: IndexSpaceId) {
        self.created_index_spaces.insert(space);
    }

    /// Records an index-space deletion.
    pub fn record_index_space_deleted(&mut self, space: IndexSpaceId) {
        self.deleted_index_spaces.insert(space);
    }

    /// Records an index-partition creation.
    pub fn record_index_partition_created(&mut self, partition: IndexPartitionId) {
        self.created_index_partitions.insert(partition);
    }

    /// Records an index-partition deletion.
    pub fn record_index_partition_deleted(&mut self, partition: IndexPartitionId) {
        self.deleted_index_partitions.insert(partition);
    }

    /// True if `region` is recorded as created here.
    #[must_use]
    pub fn region_created(&self, region: LogicalRegion) -> bool {
        self.created_regions.contains_key(&region)
    }

    /// True if `region` is recorded as deleted here.
    #[must_use]
    pub fn region_deleted(&self, region: LogicalRegion) -> bool {
        self.deleted_regions.contains(&region)
    }

    /// Total number of accumulated records across all kinds.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.created_regions.len()
            + self.deleted_regions.len()
            + self.created_fields.len()
            + self.deleted_fields.len()
            + self.created_field_spaces.len()
            + self.deleted_field_spaces.len()
            + self.created_index_spaces.len()
            + self.deleted_index_spaces.len()
            + self.created_index_partitions.len()
            + self.deleted_index_partitions.len()
    }

    /// Merges `child` into `self`.
    ///
    /// Set union per kind; merging the same child twice cannot duplicate a
    /// key, and a creation meeting a deletion leaves both observable for the
    /// parent to reconcile.
    pub fn merge(&mut self, child: &Self) {
        for (&region, &local_only) in &child.created_regions {
            self.record_region_created(region, local_only);
        }
        self.deleted_regions.extend(&child.deleted_regions);
        for (&field, &local_only) in &child.created_fields {
            self.created_fields
                .entry(field)
                .and_modify(|l| *l &= local_only)
                .or_insert(local_only);
        }
        self.deleted_fields.extend(&child.deleted_fields);
        self.created_field_spaces.extend(&child.created_field_spaces);
        self.deleted_field_spaces.extend(&child.deleted_field_spaces);
        self.created_index_spaces.extend(&child.created_index_spaces);
        self.deleted_index_spaces.extend(&child.deleted_index_spaces);
        self.created_index_partitions
            .extend(&child.created_index_partitions);
        self.deleted_index_partitions
            .extend(&child.deleted_index_partitions);
    }

    /// Encodes the tracker in fixed kind order.
    ///
    /// With `return_only_non_local` set (the outward cross-node form),
    /// created regions and fields flagged local-only are filtered out.
    pub fn encode(&self, w: &mut WireWriter, return_only_non_local: bool) {
        let regions: Vec<_> = self
            .created_regions
            .iter()
            .filter(|(_, &local)| !(return_only_non_local && local))
            .collect();
        w.put_u32(regions.len() as u32);
        for (region, &local_only) in regions {
            encode_region(w, *region);
            w.put_bool(local_only);
        }
        w.put_u32(self.deleted_regions.len() as u32);
        for &region in &self.deleted_regions {
            encode_region(w, region);
        }

        let fields: Vec<_> = self
            .created_fields
            .iter()
            .filter(|(_, &local)| !(return_only_non_local && local))
            .collect();
        w.put_u32(fields.len() as u32);
        for (&(space, field), &local_only) in fields {
            w.put_u32(space.0);
            w.put_u32(field.0);
            w.put_bool(local_only);
        }
        w.put_u32(self.deleted_fields.len() as u32);
        for &(space, field) in &self.deleted_fields {
            w.put_u32(space.0);
            w.put_u32(field.0);
        }

        encode_id_set(w, self.created_field_spaces.iter().map(|s| s.0));
        encode_id_set(w, self.deleted_field_spaces.iter().map(|s| s.0));
        encode_id_set(w, self.created_index_spaces.iter().map(|s| s.0));
        encode_id_set(w, self.deleted_index_spaces.iter().map(|s| s.0));
        encode_id_set(w, self.created_index_partitions.iter().map(|p| p.0));
        encode_id_set(w, self.deleted_index_partitions.iter().map(|p| p.0));
    }

    /// Decodes a tracker written by [`encode`](Self::encode).
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let mut tracker = Self::new();
        for _ in 0..r.get_u32()? {
            let region = decode_region(r)?;
            let local_only = r.get_bool()?;
            tracker.record_region_created(region, local_only);
        }
        for _ in 0..r.get_u32()? {
            tracker.record_region_deleted(decode_region(r)?);
        }
        for _ in 0..r.get_u32()? {
            let space = FieldSpaceId(r.get_u32()?);
            let field = FieldId(r.get_u32()?);
            let local_only = r.get_bool()?;
            tracker.record_field_created(space, field, local_only);
        }
        for _ in 0..r.get_u32()? {
            let space = FieldSpaceId(r.get_u32()?);
            let field = FieldId(r.get_u32()?);
            tracker.record_field_deleted(space, field);
        }
        for _ in 0..r.get_u32()? {
            tracker.record_field_space_created(FieldSpaceId(r.get_u32()?));
        }
        for _ in 0..r.get_u32()? {
            tracker.record_field_space_deleted(FieldSpaceId(r.get_u32()?));
        }
        for _ in 0..r.get_u32()? {
            tracker.record_index_space_created(IndexSpaceId(r.get_u32()?));
        }
        for _ in 0..r.get_u32()? {
            tracker.record_index_space_deleted(IndexSpaceId(r.get_u32()?));
        }
        for _ in 0..r.get_u32()? {
            tracker.record_index_partition_created(IndexPartitionId(r.get_u32()?));
        }
        for _ in 0..r.get_u32()? {
            tracker.record_index_partition_deleted(IndexPartitionId(r.get_u32()?));
        }
        Ok(tracker)
    }
}

fn encode_region(w: &mut WireWriter, region: LogicalRegion) {
    w.put_u32(region.tree);
    w.put_u32(region.index_space.0);
    w.put_u32(region.field_space.0);
}

fn decode_region(r: &mut WireReader<'_>) -> Result<LogicalRegion> {
    Ok(LogicalRegion::new(
        r.get_u32()?,
        IndexSpaceId(r.get_u32()?),
        FieldSpaceId(r.get_u32()?),
    ))
}

fn encode_id_set(w: &mut WireWriter, ids: impl ExactSizeIterator<Item = u32>) {
    w.put_u32(ids.len() as u32);
    for id in ids {
        w.put_u32(id);
    }
}
