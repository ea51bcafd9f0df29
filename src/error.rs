//! Fatal assertion kinds raised by graph-invariant violations.
//!
//! Every kind here corresponds to a programmer error (calling the API from the wrong place, or
//! building a graph with a genuine structural problem), never to a recoverable runtime
//! condition. Internal code threads these through as `Result` so call sites can attach context;
//! the public entry points turn them into panics, matching how the rest of the crate treats its
//! own invariants (see e.g. the cycle check in `graph::order_behaviors`).

use crate::behavior::BehaviorId;
use crate::resource::ResourceId;

/// A violation of one of the graph's structural or scheduling invariants.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// An edge, extent, or resource mutation was attempted while no event was in progress.
    #[error("graph mutated outside of an action")]
    GraphMutationOutsideAction,
    /// `requireSync` action submitted while an event was already in progress.
    #[error("a synchronous action was requested while an event was already in progress")]
    SyncActionInsideEvent,
    /// Two behaviors both declared the same resource as a supply.
    #[error("resource {resource:?} is already supplied by behavior {existing:?}, cannot also be supplied by {attempted:?}")]
    MultipleSuppliers {
        resource: ResourceId,
        existing: BehaviorId,
        attempted: BehaviorId,
    },
    /// The topological sort's DFS encountered a behavior still on the traversal stack.
    #[error("dependency cycle detected among behaviors: {0:?}")]
    DependencyCycle(Vec<BehaviorId>),
    /// A resource was updated by a behavior other than its declared supplier.
    #[error("resource {0:?} was updated by a behavior that is not its declared supplier")]
    UpdatedByNonSupplier(ResourceId),
    /// A resource with a declared supplier was updated directly from an action block.
    #[error("resource {0:?} has a supplier and cannot be updated from an action block")]
    UpdatedOutsideBehavior(ResourceId),
    /// A side effect was created outside of any event while leak assertions are enabled.
    #[error("side effect created outside of any event")]
    LeakedSideEffect,
    /// A behavior declared a demand or supply on a resource whose extent was never added.
    #[error("resource {0:?} cannot be demanded or supplied before its extent is added to the graph")]
    ResourceNotAdded(ResourceId),
}

impl GraphError {
    /// Convert into a panic. All of these errors represent a programmer error, never a
    /// recoverable condition, so this is how every public entry point reports them.
    #[track_caller]
    pub(crate) fn fail(self) -> ! {
        panic!("{self}")
    }
}

/// A `Result` alias used internally for operations that may raise a [`GraphError`].
pub(crate) type GraphResult<T> = Result<T, GraphError>;
