//! Behaviors: the nodes of the dependency graph.
//!
//! A behavior is a block of user code plus the sets of resources it demands and supplies. The
//! graph never calls a behavior's `run` closure directly from user-facing code; it only runs
//! during the run phase of an event, in topological order (see `graph::Graph::reorder_all`).

use slotmap::{new_key_type, SlotMap};

use crate::event::Sequence;
use crate::extent::ExtentId;
use crate::graph::Graph;
use crate::resource::ResourceId;

new_key_type! {
    /// A stable, generational reference to a [`BehaviorData`] slot.
    pub struct BehaviorId;
}

pub(crate) type BehaviorArena = SlotMap<BehaviorId, BehaviorData>;

/// Tri-color mark used by the structure phase's DFS (`Graph::reorder_all`) to detect cycles
/// during a topological walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrderingState {
    /// Not visited by the current ordering pass.
    Unordered,
    /// On the DFS stack: visiting a node already in this state means a cycle.
    Ordering,
    /// Assigned a final `order` by the current pass.
    Ordered,
}

/// The definition of a behavior's dynamic demand/supply links, installed via
/// `ExtentBuilder::dynamic_behavior` (§6). Re-evaluated at the start of every run in which the
/// behavior is scheduled, immediately before its `run` closure executes.
pub(crate) struct DynamicLinksSpec {
    pub switches: Vec<ResourceId>,
    #[allow(clippy::type_complexity)]
    pub relink: Box<dyn FnMut() -> (Vec<ResourceId>, Vec<ResourceId>)>,
}

/// The arena-owned backing storage for a behavior.
pub(crate) struct BehaviorData {
    pub extent: ExtentId,
    pub demands: Vec<ResourceId>,
    pub supplies: Vec<ResourceId>,
    /// Staged by `Behavior::set_demands`/`add_demand`/`remove_demand`; applied, and cleared, by
    /// the graph's structure phase (`Graph::apply_modified_edges`).
    pub pending_demands: Option<Vec<ResourceId>>,
    /// Staged by `Behavior::set_supplies`; applied the same way as `pending_demands`.
    pub pending_supplies: Option<Vec<ResourceId>>,
    pub order: u64,
    pub ordering_state: OrderingState,
    /// The sequence at which this behavior was last pushed onto the run queue; used to avoid
    /// enqueuing the same behavior twice within one event.
    pub enqueued_sequence: Sequence,
    /// The sequence of the event this behavior last actually ran in.
    pub last_update_sequence: Sequence,
    /// Set when the behavior's extent is removed; `0` while still live.
    pub removed_sequence: Sequence,
    pub run: Option<Box<dyn FnMut(&'static Graph)>>,
    pub dynamic_links: Option<DynamicLinksSpec>,
    pub debug_name: Option<&'static str>,
}

impl BehaviorData {
    pub fn new(extent: ExtentId, demands: Vec<ResourceId>, supplies: Vec<ResourceId>) -> Self {
        Self {
            extent,
            demands,
            supplies,
            pending_demands: None,
            pending_supplies: None,
            order: 0,
            ordering_state: OrderingState::Unordered,
            enqueued_sequence: 0,
            last_update_sequence: 0,
            removed_sequence: 0,
            run: None,
            dynamic_links: None,
            debug_name: None,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed_sequence != 0
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        use slotmap::Key;
        Self::new(ExtentId::null(), Vec::new(), Vec::new())
    }
}

/// A reference to a behavior registered with a [`Graph`]. Exposes only what a supplier/dependent
/// extent needs externally; the `run` closure and ordering bookkeeping stay private to the arena.
#[derive(Clone, Copy)]
pub struct Behavior {
    pub(crate) id: BehaviorId,
    pub(crate) graph: &'static Graph,
}

impl Behavior {
    pub(crate) fn new(id: BehaviorId, graph: &'static Graph) -> Self {
        Self { id, graph }
    }

    pub fn id(&self) -> BehaviorId {
        self.id
    }

    /// The topological order last assigned to this behavior. Mainly useful for diagnostics and
    /// the `profile`-feature profiler.
    pub fn order(&self) -> u64 {
        self.graph
            .with_behaviors(|behaviors| behaviors.get(self.id).map(|b| b.order).unwrap_or(u64::MAX))
    }

    pub fn set_debug_name(&self, name: &'static str) {
        self.graph.with_behaviors_mut(|behaviors| {
            if let Some(data) = behaviors.get_mut(self.id) {
                data.debug_name = Some(name);
            }
        });
    }

    pub fn debug_name(&self) -> Option<&'static str> {
        self.graph
            .with_behaviors(|behaviors| behaviors.get(self.id).and_then(|b| b.debug_name))
    }

    fn effective_demands(&self) -> Vec<ResourceId> {
        self.graph.with_behaviors(|behaviors| {
            let b = &behaviors[self.id];
            b.pending_demands.clone().unwrap_or_else(|| b.demands.clone())
        })
    }

    /// Replace this behavior's demand set (§4.3). Staged on the behavior; applied, along with
    /// any other edge change pending this event, by the graph's structure phase before the next
    /// behavior is popped off the run queue.
    pub fn set_demands(&self, demands: &[ResourceId]) {
        self.graph.stage_demands(self.id, demands.to_vec());
    }

    /// Add `resource` to this behavior's demand set, if not already present.
    pub fn add_demand(&self, resource: ResourceId) {
        let mut demands = self.effective_demands();
        if !demands.contains(&resource) {
            demands.push(resource);
            self.graph.stage_demands(self.id, demands);
        }
    }

    /// Remove `resource` from this behavior's demand set, if present.
    pub fn remove_demand(&self, resource: ResourceId) {
        let demands: Vec<ResourceId> = self.effective_demands().into_iter().filter(|r| *r != resource).collect();
        self.graph.stage_demands(self.id, demands);
    }

    /// Replace this behavior's supply set (§4.3). Staged the same way as
    /// [`Behavior::set_demands`].
    pub fn set_supplies(&self, supplies: &[ResourceId]) {
        self.graph.stage_supplies(self.id, supplies.to_vec());
    }
}
