//! Engine configuration.
//!
//! All knobs the original runtime kept in ambient globals live here and are
//! passed explicitly to [`TaskEngine`](crate::engine::TaskEngine).

use crate::types::NodeId;

/// Configuration for one node's task engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's id (address space).
    pub node: NodeId,
    /// Skip mapper-output validation for trusted policies. The checks in
    /// `finalize_map_task_output` and `slice_index_space` become no-ops.
    pub unsafe_mapper: bool,
    /// Initial operation-pool capacity.
    pub pool_capacity: usize,
    /// How many times a transient instance-acquisition race is retried
    /// (with a warning) before the engine treats the instance as collected.
    pub acquire_retries: u32,
}

impl EngineConfig {
    /// Configuration for `node` with defaults everywhere else.
    #[must_use]
    pub fn for_node(node: NodeId) -> Self {
        Self {
            node,
            unsafe_mapper: false,
            pool_capacity: 256,
            acquire_retries: 1,
        }
    }

    /// Disables mapper-output validation.
    #[must_use]
    pub const fn with_unsafe_mapper(mut self) -> Self {
        self.unsafe_mapper = true;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::for_node(NodeId(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let cfg = EngineConfig::default();
        assert!(!cfg.unsafe_mapper);
        assert_eq!(cfg.node, NodeId(0));
        assert!(cfg.acquire_retries >= 1);
    }

    #[test]
    fn unsafe_mapper_builder() {
        let cfg = EngineConfig::for_node(NodeId(2)).with_unsafe_mapper();
        assert!(cfg.unsafe_mapper);
        assert_eq!(cfg.node, NodeId(2));
    }
}
