//! Node-to-node task migration, stealing, and result routing.
//!
//! Messages are framed with magic bytes, a version, a tag, and an FNV-1a
//! payload checksum. A migrated slice dissolves locally; its reports come
//! back addressed to the owning index task's unique id. A migrated single
//! task leaves its record behind as the origin-side proxy and routes its
//! result back through a [`RemoteOpId`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::context::ParentContext;
use crate::error::{Error, ErrorKind, Result, WireFault};
use crate::record::{
    IndividualState, KindState, OpCell, OpFlags, OpState, SliceOwner, SliceState, Stage,
};
use crate::resource::ResourceTracker;
use crate::types::{
    Coherence, DomainPoint, FieldId, FieldSpaceId, FutureValue, IndexDomain, IndexPartitionId,
    IndexSpaceId, LogicalPartition, LogicalRegion, NodeId, ProcId, ProcKind, Privilege, ProjectionId,
    RedopId, RegionRequirement, RegionSelection, RemoteOpId, TaskFuncId, UniqueId,
};
use crate::wire::{fnv1a, WireReader, WireWriter};

use super::TaskEngine;

const MAGIC: [u8; 4] = *b"TGRD";
const VERSION: u8 = 1;

const TAG_TASK: u8 = 1;
const TAG_SLICE_MAPPED: u8 = 2;
const TAG_SLICE_COMPLETE: u8 = 3;
const TAG_SLICE_COMMIT: u8 = 4;
const TAG_TASK_RESULT: u8 = 5;

const KIND_SINGLE: u8 = 0;
const KIND_SLICE: u8 = 1;

/// Delivers framed messages between nodes.
pub trait Transport: Send + Sync {
    /// Sends one framed message from `from` to `to`.
    fn send(&self, from: NodeId, to: NodeId, payload: Vec<u8>) -> Result<()>;
}

/// In-process transport: every registered engine is reachable and delivery
/// is synchronous on the sender's thread.
#[derive(Default)]
pub struct LoopbackRouter {
    nodes: Mutex<HashMap<NodeId, Arc<TaskEngine>>>,
}

impl LoopbackRouter {
    /// An empty router.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `engine` under its configured node id.
    pub fn register(&self, engine: &Arc<TaskEngine>) {
        self.nodes.lock().insert(engine.node(), Arc::clone(engine));
    }
}

impl Transport for LoopbackRouter {
    fn send(&self, from: NodeId, to: NodeId, payload: Vec<u8>) -> Result<()> {
        let engine = self
            .nodes
            .lock()
            .get(&to)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NoRoute).with_node(from))?;
        engine.receive_message(&payload)
    }
}

/// Context for records received over the wire: the real parent lives on the
/// origin node, so every parent-surface call is a no-op here. Results and
/// privilege state route back through [`RemoteOpId`] messages instead.
struct DetachedContext;

impl ParentContext for DetachedContext {
    fn increment_outstanding(&self) {}

    fn decrement_outstanding(&self) {}

    fn find_parent_requirement(&self, _parent_region: LogicalRegion) -> Option<RegionRequirement> {
        None
    }

    fn return_privilege_state(&self, _child: UniqueId, _tracker: &ResourceTracker) {}

    fn receive_future(&self, _child: UniqueId, _value: FutureValue) {}
}

fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_raw(&MAGIC);
    w.put_u8(VERSION);
    w.put_u8(tag);
    w.put_u64(fnv1a(payload));
    w.put_bytes(payload);
    w.finish()
}

impl TaskEngine {
    fn send_to(&self, to: NodeId, message: Vec<u8>) -> Result<()> {
        let transport = self.transport.lock().clone();
        let transport = transport.ok_or_else(|| {
            Error::new(ErrorKind::NoRoute).with_node(self.config.node)
        })?;
        transport.send(self.config.node, to, message)
    }

    /// Ships a ready task to its target node. Slices dissolve locally (their
    /// reports address the index task's unique id); single tasks keep their
    /// record as the origin-side proxy.
    pub(crate) fn distribute_task(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let (to, payload) = {
            let mut state = cell.state.lock();
            state.sends += 1;
            let payload = self.encode_task(cell, &mut state)?;
            (state.target_proc.node, payload)
        };
        debug!(op = %cell.unique, %to, kind = cell.kind_name(), "migrating task");
        self.send_to(to, frame(TAG_TASK, &payload))?;
        if matches!(&cell.state.lock().kind, KindState::Slice(_)) {
            self.deactivate(cell.id);
        }
        Ok(())
    }

    fn encode_task(&self, cell: &Arc<OpCell>, state: &mut OpState) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        w.put_u64(cell.unique.0);
        w.put_u32(cell.func.0);
        w.put_bytes(cell.name.as_bytes());
        encode_proc(&mut w, state.target_proc);
        encode_flags(&mut w, state.flags);
        w.put_bytes(&state.arg);
        w.put_u32(state.requirements.len() as u32);
        for req in &state.requirements {
            encode_requirement(&mut w, req);
        }
        match &mut state.kind {
            KindState::Individual(_) | KindState::Point(_) => {
                w.put_u8(KIND_SINGLE);
                let origin = state.remote_of.unwrap_or(RemoteOpId {
                    owner: self.config.node,
                    unique: cell.unique,
                });
                encode_remote(&mut w, origin);
            }
            KindState::Slice(s) => {
                // Rewrite a local owner into a proxy handle before the slice
                // leaves this node.
                if let SliceOwner::Local(index) = s.owner {
                    let index_cell = self.with_op(index)?;
                    s.owner = SliceOwner::Remote(RemoteOpId {
                        owner: self.config.node,
                        unique: index_cell.unique,
                    });
                }
                let SliceOwner::Remote(owner) = s.owner else {
                    unreachable!("owner rewritten above")
                };
                w.put_u8(KIND_SLICE);
                encode_domain(&mut w, s.domain);
                w.put_u64(s.denominator);
                encode_remote(&mut w, owner);
                w.put_bool(s.stealable);
                w.put_bool(s.recurse);
            }
            KindState::Index(_) | KindState::Shard(_) => {
                return Err(Error::new(ErrorKind::Internal)
                    .with_unique_id(cell.unique)
                    .with_node(self.config.node));
            }
        }
        Ok(w.finish())
    }

    /// Routes a finished remote task's result back to the origin record.
    pub(crate) fn send_remote_result(
        &self,
        owner: RemoteOpId,
        result: &FutureValue,
        tracker: &ResourceTracker,
    ) -> Result<()> {
        let mut w = WireWriter::new();
        w.put_u64(owner.unique.0);
        w.put_bytes(result.bytes());
        tracker.encode(&mut w, true);
        self.send_to(owner.owner, frame(TAG_TASK_RESULT, &w.finish()))
    }

    pub(crate) fn send_slice_mapped(
        &self,
        owner: RemoteOpId,
        denominator: u64,
        points: u64,
    ) -> Result<()> {
        let mut w = WireWriter::new();
        w.put_u64(owner.unique.0);
        w.put_u64(denominator);
        w.put_u64(points);
        self.send_to(owner.owner, frame(TAG_SLICE_MAPPED, &w.finish()))
    }

    pub(crate) fn send_slice_complete(
        &self,
        owner: RemoteOpId,
        points: u64,
        results: &[(DomainPoint, FutureValue)],
        tracker: &ResourceTracker,
    ) -> Result<()> {
        let mut w = WireWriter::new();
        w.put_u64(owner.unique.0);
        w.put_u64(points);
        w.put_u32(results.len() as u32);
        for (point, value) in results {
            encode_point(&mut w, *point);
            w.put_bytes(value.bytes());
        }
        tracker.encode(&mut w, true);
        self.send_to(owner.owner, frame(TAG_SLICE_COMPLETE, &w.finish()))
    }

    pub(crate) fn send_slice_commit(&self, owner: RemoteOpId, points: u64) -> Result<()> {
        let mut w = WireWriter::new();
        w.put_u64(owner.unique.0);
        w.put_u64(points);
        self.send_to(owner.owner, frame(TAG_SLICE_COMMIT, &w.finish()))
    }

    /// Decodes and applies one framed message from another node.
    pub fn receive_message(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        let mut r = WireReader::new(bytes);
        for expected in MAGIC {
            if r.get_u8()? != expected {
                return Err(Error::new(WireFault::BadMagic).with_node(self.config.node));
            }
        }
        let version = r.get_u8()?;
        if version != VERSION {
            return Err(Error::new(WireFault::BadVersion(version)).with_node(self.config.node));
        }
        let tag = r.get_u8()?;
        let checksum = r.get_u64()?;
        let payload = r.get_bytes()?;
        if fnv1a(payload) != checksum {
            return Err(Error::new(WireFault::ChecksumMismatch).with_node(self.config.node));
        }
        let mut r = WireReader::new(payload);
        match tag {
            TAG_TASK => self.receive_task(&mut r),
            TAG_SLICE_MAPPED => {
                let unique = UniqueId(r.get_u64()?);
                let denominator = r.get_u64()?;
                let points = r.get_u64()?;
                match self.lookup_unique(unique) {
                    Some(index) => self.return_slice_mapped(index, denominator, points),
                    None => {
                        warn!(%unique, "slice-mapped report for an unknown launch");
                        Ok(())
                    }
                }
            }
            TAG_SLICE_COMPLETE => {
                let unique = UniqueId(r.get_u64()?);
                let points = r.get_u64()?;
                let count = r.get_u32()?;
                let mut results = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let point = decode_point(&mut r)?;
                    let value = FutureValue::from_bytes(r.get_bytes()?);
                    results.push((point, value));
                }
                let tracker = ResourceTracker::decode(&mut r)?;
                match self.lookup_unique(unique) {
                    Some(index) => self.return_slice_complete(index, points, results, tracker),
                    None => {
                        warn!(%unique, "slice-complete report for an unknown launch");
                        Ok(())
                    }
                }
            }
            TAG_SLICE_COMMIT => {
                let unique = UniqueId(r.get_u64()?);
                let points = r.get_u64()?;
                match self.lookup_unique(unique) {
                    Some(index) => self.return_slice_commit(index, points),
                    None => {
                        warn!(%unique, "slice-commit report for an unknown launch");
                        Ok(())
                    }
                }
            }
            TAG_TASK_RESULT => {
                let unique = UniqueId(r.get_u64()?);
                let result = FutureValue::from_bytes(r.get_bytes()?);
                let tracker = ResourceTracker::decode(&mut r)?;
                self.receive_task_result(unique, result, tracker)
            }
            other => Err(Error::new(WireFault::BadTag(other)).with_node(self.config.node)),
        }
    }

    fn receive_task(self: &Arc<Self>, r: &mut WireReader<'_>) -> Result<()> {
        let unique = UniqueId(r.get_u64()?);
        let func = TaskFuncId(r.get_u32()?);
        let name = String::from_utf8_lossy(r.get_bytes()?).into_owned();
        let target = decode_proc(r)?;
        let flags = decode_flags(r)?;
        let arg: Arc<[u8]> = Arc::from(r.get_bytes()?);
        let count = r.get_u32()?;
        let mut requirements = Vec::with_capacity(count as usize);
        for _ in 0..count {
            requirements.push(decode_requirement(r)?);
        }
        let (kind, remote_of) = match r.get_u8()? {
            KIND_SINGLE => {
                let origin = decode_remote(r)?;
                (
                    KindState::Individual(IndividualState::default()),
                    Some(origin),
                )
            }
            KIND_SLICE => {
                let domain = decode_domain(r)?;
                let denominator = r.get_u64()?;
                let owner = decode_remote(r)?;
                let stealable = r.get_bool()?;
                let recurse = r.get_bool()?;
                let mut s =
                    SliceState::new(domain, denominator, SliceOwner::Remote(owner), stealable);
                s.recurse = recurse;
                (KindState::Slice(s), None)
            }
            other => {
                return Err(Error::new(WireFault::BadTag(other)).with_node(self.config.node));
            }
        };
        let mut state = OpState::new(kind, target);
        state.requirements = requirements;
        state.arg = arg;
        state.flags = flags;
        state.remote_of = remote_of;
        let id = self.insert_cell_with_unique(unique, |id, unique| OpCell {
            id,
            unique,
            func,
            name: name.clone(),
            context: Arc::new(DetachedContext),
            state: Mutex::new(state),
        });
        trace!(op = %unique, name = %name, "received migrated task");
        self.enqueue_ready(id);
        Ok(())
    }

    fn receive_task_result(
        self: &Arc<Self>,
        unique: UniqueId,
        result: FutureValue,
        tracker: ResourceTracker,
    ) -> Result<()> {
        let Some(op) = self.lookup_unique(unique) else {
            warn!(%unique, "result for an unknown launch");
            return Ok(());
        };
        let cell = self.with_op(op)?;
        // A stolen point mapped on the thief's node; its slice still needs
        // the local mapped callback before the completion path runs.
        let pending_map = {
            let mut state = cell.state.lock();
            match &state.kind {
                KindState::Point(s) if state.lifecycle.stage() < Stage::Mapped => {
                    let slice = s.slice;
                    state.lifecycle.advance(Stage::Mapped);
                    let mapped_event = state.mapped_event;
                    Some((slice, mapped_event))
                }
                _ => None,
            }
        };
        if let Some((slice, mapped_event)) = pending_map {
            self.events.trigger(mapped_event);
            self.record_point_mapped(slice)?;
        }
        self.complete_execution(op, result, tracker)
    }

    /// Pops one steal-eligible ready task and ships it to `thief`. Returns
    /// the stolen launch id, or `None` when the queue head is ineligible
    /// (no retry; the head goes back).
    pub fn try_steal(self: &Arc<Self>, thief: NodeId) -> Result<Option<UniqueId>> {
        let Some(op) = self.ready.pop() else {
            return Ok(None);
        };
        let Ok(cell) = self.with_op(op) else {
            return Ok(None);
        };
        let eligible = {
            let state = cell.state.lock();
            state.lifecycle.stage() == Stage::Ready
                && state.flags.stealable
                && !matches!(state.kind, KindState::Index(_) | KindState::Shard(_))
        };
        if !eligible {
            self.ready.push(op);
            return Ok(None);
        }
        {
            let mut state = cell.state.lock();
            state.target_proc = ProcId::cpu(thief, 0);
        }
        debug!(op = %cell.unique, %thief, "task stolen");
        self.distribute_task(&cell)?;
        Ok(Some(cell.unique))
    }
}

fn encode_flags(w: &mut WireWriter, flags: OpFlags) {
    let mut bits = 0u8;
    bits |= u8::from(flags.stealable);
    bits |= u8::from(flags.origin_mapped) << 1;
    bits |= u8::from(flags.speculated) << 2;
    bits |= u8::from(flags.replicated) << 3;
    w.put_u8(bits);
}

fn decode_flags(r: &mut WireReader<'_>) -> Result<OpFlags> {
    let bits = r.get_u8()?;
    Ok(OpFlags {
        stealable: bits & 1 != 0,
        origin_mapped: bits & 2 != 0,
        speculated: bits & 4 != 0,
        replicated: bits & 8 != 0,
    })
}

fn encode_proc(w: &mut WireWriter, proc: ProcId) {
    w.put_u32(proc.node.0);
    w.put_u32(proc.local);
    w.put_u8(proc.kind.as_u8());
}

fn decode_proc(r: &mut WireReader<'_>) -> Result<ProcId> {
    let node = NodeId(r.get_u32()?);
    let local = r.get_u32()?;
    let raw = r.get_u8()?;
    let kind = ProcKind::from_u8(raw).ok_or(Error::new(WireFault::BadTag(raw)))?;
    Ok(ProcId::new(node, local, kind))
}

fn encode_remote(w: &mut WireWriter, remote: RemoteOpId) {
    w.put_u32(remote.owner.0);
    w.put_u64(remote.unique.0);
}

fn decode_remote(r: &mut WireReader<'_>) -> Result<RemoteOpId> {
    Ok(RemoteOpId {
        owner: NodeId(r.get_u32()?),
        unique: UniqueId(r.get_u64()?),
    })
}

fn encode_point(w: &mut WireWriter, point: DomainPoint) {
    w.put_u8(point.dim());
    for coord in point.raw_coords() {
        w.put_i64(coord);
    }
}

fn decode_point(r: &mut WireReader<'_>) -> Result<DomainPoint> {
    let dim = r.get_u8()?;
    let mut coords = [0i64; crate::types::MAX_DIM];
    for coord in &mut coords {
        *coord = r.get_i64()?;
    }
    Ok(DomainPoint::from_raw(coords, dim))
}

fn encode_domain(w: &mut WireWriter, domain: IndexDomain) {
    let (lo, hi) = domain.raw_bounds();
    w.put_u8(domain.dim());
    for coord in lo {
        w.put_i64(coord);
    }
    for coord in hi {
        w.put_i64(coord);
    }
}

fn decode_domain(r: &mut WireReader<'_>) -> Result<IndexDomain> {
    let dim = r.get_u8()?;
    let mut lo = [0i64; crate::types::MAX_DIM];
    let mut hi = [0i64; crate::types::MAX_DIM];
    for coord in &mut lo {
        *coord = r.get_i64()?;
    }
    for coord in &mut hi {
        *coord = r.get_i64()?;
    }
    Ok(IndexDomain::from_raw(lo, hi, dim))
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

fn encode_requirement(w: &mut WireWriter, req: &RegionRequirement) {
    match req.selection {
        RegionSelection::Singular(region) => {
            w.put_u8(0);
            encode_region(w, region);
        }
        RegionSelection::PartitionProjection(partition, projection) => {
            w.put_u8(1);
            w.put_u32(partition.tree);
            w.put_u32(partition.index_partition.0);
            w.put_u32(partition.field_space.0);
            w.put_u32(projection.0);
        }
        RegionSelection::RegionProjection(region, projection) => {
            w.put_u8(2);
            encode_region(w, region);
            w.put_u32(projection.0);
        }
    }
    w.put_u8(req.privilege.as_u8());
    w.put_u8(req.coherence.as_u8());
    match req.redop {
        Some(redop) => {
            w.put_bool(true);
            w.put_u32(redop.0);
        }
        None => w.put_bool(false),
    }
    w.put_u32(req.fields.len() as u32);
    for field in &req.fields {
        w.put_u32(field.0);
    }
    encode_region(w, req.parent);
    w.put_bool(req.allow_virtual);
}

fn decode_requirement(r: &mut WireReader<'_>) -> Result<RegionRequirement> {
    let selection = match r.get_u8()? {
        0 => RegionSelection::Singular(decode_region(r)?),
        1 => {
            let partition = LogicalPartition::new(
                r.get_u32()?,
                IndexPartitionId(r.get_u32()?),
                FieldSpaceId(r.get_u32()?),
            );
            RegionSelection::PartitionProjection(partition, ProjectionId(r.get_u32()?))
        }
        2 => {
            let region = decode_region(r)?;
            RegionSelection::RegionProjection(region, ProjectionId(r.get_u32()?))
        }
        other => return Err(Error::new(WireFault::BadTag(other))),
    };
    let raw = r.get_u8()?;
    let privilege = Privilege::from_u8(raw).ok_or(Error::new(WireFault::BadTag(raw)))?;
    let raw = r.get_u8()?;
    let coherence = Coherence::from_u8(raw).ok_or(Error::new(WireFault::BadTag(raw)))?;
    let redop = if r.get_bool()? {
        Some(RedopId(r.get_u32()?))
    } else {
        None
    };
    let mut fields = crate::types::FieldSet::new();
    for _ in 0..r.get_u32()? {
        fields.push(FieldId(r.get_u32()?));
    }
    let parent = decode_region(r)?;
    let allow_virtual = r.get_bool()?;
    Ok(RegionRequirement {
        selection,
        privilege,
        coherence,
        redop,
        fields,
        parent,
        parent_req_index: None,
        allow_virtual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldSet;

    #[test]
    fn frame_round_trip_checks_integrity() {
        let framed = frame(TAG_SLICE_COMMIT, b"payload");
        assert_eq!(&framed[..4], b"TGRD");

        let mut corrupted = framed.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        let mut r = WireReader::new(&corrupted);
        for _ in 0..4 {
            r.get_u8().unwrap();
        }
        r.get_u8().unwrap();
        r.get_u8().unwrap();
        let checksum = r.get_u64().unwrap();
        let payload = r.get_bytes().unwrap();
        assert_ne!(fnv1a(payload), checksum);
    }

    #[test]
    fn requirement_round_trip() {
        let mut fields = FieldSet::new();
        fields.push(FieldId(3));
        fields.push(FieldId(9));
        let req = RegionRequirement {
            selection: RegionSelection::PartitionProjection(
                LogicalPartition::new(1, IndexPartitionId(2), FieldSpaceId(4)),
                ProjectionId(7),
            ),
            privilege: Privilege::Reduce,
            coherence: Coherence::Atomic,
            redop: Some(RedopId(5)),
            fields,
            parent: LogicalRegion::new(1, IndexSpaceId(0), FieldSpaceId(4)),
            parent_req_index: Some(2),
            allow_virtual: true,
        };

        let mut w = WireWriter::new();
        encode_requirement(&mut w, &req);
        let buf = w.finish();
        let mut r = WireReader::new(&buf);
        let decoded = decode_requirement(&mut r).unwrap();
        assert_eq!(decoded.selection, req.selection);
        assert_eq!(decoded.privilege, req.privilege);
        assert_eq!(decoded.coherence, req.coherence);
        assert_eq!(decoded.redop, req.redop);
        assert_eq!(decoded.fields, req.fields);
        assert_eq!(decoded.parent, req.parent);
        // Parent bookkeeping never travels.
        assert_eq!(decoded.parent_req_index, None);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn domain_and_point_round_trip() {
        let domain = IndexDomain::d3((0, -2, 5), (3, 2, 5));
        let mut w = WireWriter::new();
        encode_domain(&mut w, domain);
        encode_point(&mut w, DomainPoint::p3(1, -1, 5));
        let buf = w.finish();
        let mut r = WireReader::new(&buf);
        assert_eq!(decode_domain(&mut r).unwrap(), domain);
        assert_eq!(decode_point(&mut r).unwrap(), DomainPoint::p3(1, -1, 5));
    }

    #[test]
    fn flags_round_trip() {
        let flags = OpFlags {
            stealable: true,
            origin_mapped: false,
            speculated: true,
            replicated: false,
        };
        let mut w = WireWriter::new();
        encode_flags(&mut w, flags);
        let buf = w.finish();
        let decoded = decode_flags(&mut WireReader::new(&buf)).unwrap();
        assert!(decoded.stealable && decoded.speculated);
        assert!(!decoded.origin_mapped && !decoded.replicated);
    }

    #[test]
    fn stolen_point_maps_through_its_returning_result() {
        use crate::context::RecordingContext;
        use crate::engine::{IndexLaunch, TaskDesc};
        use crate::record::Stage;
        use crate::region_tree::MockRegionTree;
        use crate::test_utils::ScriptedMapper;
        use crate::types::{RedopRegistry, SumU64};

        crate::test_utils::init_test_logging();
        let mut mapper = ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0));
        mapper.slice_stealable = true;
        let mut redops = RedopRegistry::new();
        redops.register(RedopId(1), Arc::new(SumU64));
        let engine0 = crate::test_utils::engine_with_redops(
            NodeId(0),
            mapper,
            MockRegionTree::new(),
            redops,
        );
        let engine1 = crate::test_utils::engine_on(NodeId(1));
        let router = LoopbackRouter::new();
        router.register(&engine0);
        router.register(&engine1);
        engine0.set_transport(router.clone());
        engine1.set_transport(router);

        let ctx = Arc::new(RecordingContext::new());
        let desc = TaskDesc::new(TaskFuncId(1), "steal-target", ctx.clone());
        engine0
            .launch_index(
                desc,
                IndexLaunch::reduction(IndexDomain::d1(0, 1), RedopId(1), false),
            )
            .unwrap();

        // Dispatch the index and its slice by hand so the enumerated points
        // sit in the ready queue still unmapped.
        engine0.events.drain();
        let index = engine0.ready.pop().unwrap();
        engine0.dispatch_op(index).unwrap();
        let slice = engine0.ready.pop().unwrap();
        engine0.dispatch_op(slice).unwrap();

        let stolen = engine0.try_steal(NodeId(1)).unwrap().expect("stealable point");
        let origin = engine0.lookup_unique(stolen).unwrap();
        assert!(engine0.stage_of(origin).unwrap() < Stage::Mapped);

        // The thief maps and runs it; the returning result must advance the
        // origin proxy through its pending mapped callback first.
        engine1.pump().unwrap();
        let thief_op = engine1
            .live_ops()
            .into_iter()
            .find(|(_, _, stage)| *stage == Stage::Executing)
            .map(|(op, _, _)| op)
            .unwrap();
        engine1
            .complete_execution(thief_op, FutureValue::from_u64(10), ResourceTracker::new())
            .unwrap();

        // The local sibling still maps and runs normally.
        engine0.pump().unwrap();
        let local_op = engine0
            .live_ops()
            .into_iter()
            .find(|(_, kind, stage)| *kind == "point" && *stage == Stage::Executing)
            .map(|(op, _, _)| op)
            .unwrap();
        engine0
            .complete_execution(local_op, FutureValue::from_u64(5), ResourceTracker::new())
            .unwrap();
        engine0.pump().unwrap();

        let futures = ctx.returned_futures();
        assert_eq!(futures.len(), 1);
        assert_eq!(futures[0].1.as_u64(), Some(15));
        assert_eq!(ctx.outstanding(), 0);
        assert!(engine0.live_ops().is_empty());
        assert!(engine1.live_ops().is_empty());
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut framed = frame(TAG_TASK, b"x");
        framed[4] = 99;
        let engine = crate::test_utils::engine_on(NodeId(0));
        let err = engine.receive_message(&framed).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Wire(WireFault::BadVersion(99)));
    }
}
