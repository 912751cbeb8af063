//! Static routing taxonomy over block kinds, consulted by the scheduler and
//! the path tracker.

use crate::workflow::{BlockKind, Handle};

/// Routing category of a block kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Chooses among outgoing targets (router, condition).
    Routing,
    /// Governs iteration rather than value flow (loop, parallel).
    FlowControl,
    /// Produces a value and activates its downstream on success.
    Regular,
}

impl BlockKind {
    pub const fn category(self) -> Category {
        match self {
            BlockKind::Router | BlockKind::Condition => Category::Routing,
            BlockKind::Loop | BlockKind::Parallel => Category::FlowControl,
            _ => Category::Regular,
        }
    }
}

/// Whether executing this kind requires the block to be on the active path.
/// Routing and flow-control blocks must never fire from an inactive branch.
pub const fn requires_active_path_check(kind: BlockKind) -> bool {
    !matches!(kind.category(), Category::Regular)
}

/// Whether this kind activates its downstream closure on success. Routing
/// blocks choose targets themselves; flow-control blocks manage their children.
pub const fn should_activate_downstream(kind: BlockKind) -> bool {
    matches!(kind.category(), Category::Regular)
}

/// Whether a connection must be skipped during downstream activation: handles
/// owned by flow-control managers or gated on an error state never activate
/// eagerly, regardless of the target kind.
pub fn should_skip_connection(handle: &Handle, _target_kind: BlockKind) -> bool {
    matches!(
        handle,
        Handle::Error
            | Handle::LoopStart
            | Handle::LoopEnd
            | Handle::ParallelStart
            | Handle::ParallelEnd
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_matches_block_kinds() {
        assert_eq!(BlockKind::Router.category(), Category::Routing);
        assert_eq!(BlockKind::Condition.category(), Category::Routing);
        assert_eq!(BlockKind::Loop.category(), Category::FlowControl);
        assert_eq!(BlockKind::Parallel.category(), Category::FlowControl);
        for kind in [
            BlockKind::Starter,
            BlockKind::Agent,
            BlockKind::Function,
            BlockKind::Api,
            BlockKind::Evaluator,
            BlockKind::Response,
            BlockKind::Workflow,
            BlockKind::Generic,
        ] {
            assert_eq!(kind.category(), Category::Regular);
        }
    }

    #[test]
    fn active_path_check_required_for_non_regular() {
        assert!(requires_active_path_check(BlockKind::Router));
        assert!(requires_active_path_check(BlockKind::Loop));
        assert!(!requires_active_path_check(BlockKind::Function));
    }

    #[test]
    fn downstream_activation_only_for_regular() {
        assert!(should_activate_downstream(BlockKind::Agent));
        assert!(!should_activate_downstream(BlockKind::Router));
        assert!(!should_activate_downstream(BlockKind::Parallel));
    }

    #[test]
    fn skips_manager_owned_handles() {
        assert!(should_skip_connection(&Handle::Error, BlockKind::Function));
        assert!(should_skip_connection(&Handle::LoopStart, BlockKind::Function));
        assert!(should_skip_connection(&Handle::LoopEnd, BlockKind::Response));
        assert!(!should_skip_connection(&Handle::Source, BlockKind::Function));
        assert!(!should_skip_connection(
            &Handle::Condition("c".into()),
            BlockKind::Function
        ));
    }
}
