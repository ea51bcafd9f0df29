//! Extents: the unit of lifecycle for a group of resources and behaviors (§5).

use slotmap::{new_key_type, SlotMap};

use crate::behavior::{Behavior, BehaviorData, BehaviorId, DynamicLinksSpec};
use crate::graph::Graph;
use crate::resource::{Moment, PlainResource, ResourceData, ResourceId, ResourceKind, State};

new_key_type! {
    /// A stable, generational reference to an [`ExtentData`] slot.
    pub struct ExtentId;
}

pub(crate) type ExtentArena = SlotMap<ExtentId, ExtentData>;

/// The arena-owned bookkeeping for an extent: which resources and behaviors it owns, and
/// whether it has been added to / removed from the graph.
pub(crate) struct ExtentData {
    pub resources: Vec<ResourceId>,
    pub behaviors: Vec<BehaviorId>,
    pub added: bool,
    pub removed: bool,
    pub debug_name: Option<&'static str>,
}

impl ExtentData {
    fn new() -> Self {
        Self {
            resources: Vec::new(),
            behaviors: Vec::new(),
            added: false,
            removed: false,
            debug_name: None,
        }
    }
}

/// Accumulates the resources and behaviors a caller declares for a not-yet-added extent.
/// Constructed internally by [`Graph::build_extent`]; a behavior/resource created through it is
/// only linked into the graph's arenas once [`ExtentHandle::add_to_graph`] runs.
pub struct ExtentBuilder {
    pub(crate) id: ExtentId,
    pub(crate) graph: &'static Graph,
}

impl ExtentBuilder {
    /// A plain dependency hook with no payload (§3).
    pub fn plain_resource(&self) -> PlainResource {
        self.moment::<()>()
    }

    /// A transient-value resource (§3).
    pub fn moment<T: 'static>(&self) -> Moment<T> {
        let id = self
            .graph
            .with_resources_mut(|resources| resources.insert(ResourceData::new(self.id, ResourceKind::Moment)));
        self.graph.with_extents_mut(|extents| {
            extents[self.id].resources.push(id);
        });
        Moment(crate::resource::ResourceHandle::new(id, self.graph))
    }

    /// A persistent-value resource seeded with `initial` (§3).
    pub fn state<T: 'static>(&self, initial: T) -> State<T> {
        let id = self
            .graph
            .with_resources_mut(|resources| resources.insert(ResourceData::new(self.id, ResourceKind::State)));
        self.graph.with_resources_mut(|resources| {
            resources[id].value = Some(Box::new(initial));
        });
        self.graph.with_extents_mut(|extents| {
            extents[self.id].resources.push(id);
        });
        State(crate::resource::ResourceHandle::new(id, self.graph))
    }

    /// A behavior with a static demand and supply list, run when any demand updates (§4).
    pub fn behavior(
        &self,
        demands: &[ResourceId],
        supplies: &[ResourceId],
        run: impl FnMut(&'static Graph) + 'static,
    ) -> Behavior {
        let mut data = BehaviorData::new(self.id, demands.to_vec(), supplies.to_vec());
        data.run = Some(Box::new(run));
        let id = self.graph.with_behaviors_mut(|behaviors| behaviors.insert(data));
        self.graph.with_extents_mut(|extents| {
            extents[self.id].behaviors.push(id);
        });
        Behavior::new(id, self.graph)
    }

    /// A behavior whose demand/supply lists are recomputed whenever one of `switches` updates
    /// (§6, DynamicLinks). `relink` returns the new `(demands, supplies)` pair and is invoked
    /// once up front (to establish the initial links) and again at the start of every run this
    /// behavior is scheduled for, before `run` executes.
    pub fn dynamic_behavior(
        &self,
        switches: &[ResourceId],
        mut relink: impl FnMut() -> (Vec<ResourceId>, Vec<ResourceId>) + 'static,
        run: impl FnMut(&'static Graph) + 'static,
    ) -> Behavior {
        let (demands, supplies) = relink();
        let mut data = BehaviorData::new(self.id, demands, supplies);
        data.run = Some(Box::new(run));
        data.dynamic_links = Some(DynamicLinksSpec {
            switches: switches.to_vec(),
            relink: Box::new(relink),
        });
        let id = self.graph.with_behaviors_mut(|behaviors| behaviors.insert(data));
        self.graph.with_extents_mut(|extents| {
            extents[self.id].behaviors.push(id);
        });
        Behavior::new(id, self.graph)
    }
}

/// A live handle to an extent's resources, returned by the closure passed to
/// [`Graph::build_extent`]. The extent must be added with [`ExtentHandle::add_to_graph`]
/// before any of its resources can be demanded or supplied by anything outside itself.
pub struct ExtentHandle<T> {
    pub(crate) id: ExtentId,
    pub(crate) graph: &'static Graph,
    pub(crate) data: T,
}

impl<T> Clone for ExtentHandle<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            graph: self.graph,
            data: self.data.clone(),
        }
    }
}

impl<T> Copy for ExtentHandle<T> where T: Copy {}

impl<T> ExtentHandle<T> {
    pub fn id(&self) -> ExtentId {
        self.id
    }

    /// The value returned by the extent's construction closure: typically a struct of
    /// `Moment`/`State`/`Behavior` handles.
    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn set_debug_name(&self, name: &'static str) {
        self.graph.with_extents_mut(|extents| {
            extents[self.id].debug_name = Some(name);
        });
    }

    /// Links this extent's resources and behaviors into the graph, making them eligible to be
    /// demanded/supplied by other extents and ordered into the schedule. A no-op data-model
    /// operation outside of an event boundary by itself, but must be called from inside an
    /// `action`/`side_effect` per §8 invariant 1 (enforced by `Graph::add_extent`).
    pub fn add_to_graph(&self) {
        self.graph.add_extent(self.id);
    }

    /// Unlinks this extent's resources and behaviors from the graph. Existing demand/supply
    /// edges referencing them are left dangling and resolved lazily (a removed behavior sorts
    /// last in the priority queue and is simply skipped if popped).
    pub fn remove_from_graph(&self) {
        self.graph.remove_extent(self.id);
    }
}

impl ExtentData {
    pub(crate) fn fresh() -> Self {
        Self::new()
    }
}
