//! The central scheduler: owns every arena and drives the action/propagation/side-effect cycle
//! described in §4.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;

use indexmap::IndexSet;

use crate::behavior::{Behavior, BehaviorArena, BehaviorId, OrderingState};
use crate::error::GraphError;
use crate::event::{DateProvider, Event, Sequence, SystemDateProvider};
use crate::extent::{ExtentArena, ExtentBuilder, ExtentData, ExtentHandle, ExtentId};
use crate::priority_queue::BehaviorQueue;
use crate::resource::{ResourceArena, ResourceData, ResourceId, ResourceKind, State};

#[cfg(feature = "profile")]
use crate::profiler::Profiler;

/// Knobs controlling graph behavior that aren't part of the reactive data model itself.
#[derive(Debug, Clone, Copy)]
pub struct GraphConfig {
    /// If `true`, a [`Graph::side_effect`] queued with no event active runs immediately rather
    /// than panicking. If `false`, such a call is a [`GraphError::LeakedSideEffect`].
    pub assert_on_leaked_side_effects: bool,
    /// Whether a nested [`Graph::action`] call (one made while an event is already in progress)
    /// panics with [`GraphError::SyncActionInsideEvent`] instead of queueing behind the current
    /// event.
    pub default_require_sync: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            assert_on_leaked_side_effects: false,
            default_require_sync: false,
        }
    }
}

struct Inner {
    resources: ResourceArena,
    behaviors: BehaviorArena,
    extents: ExtentArena,
    queue: BehaviorQueue,
    current_event: Option<Event>,
    last_event: Event,
    next_sequence: Sequence,
    current_behavior: Option<BehaviorId>,
    /// Backing resource for `Graph::current_event_resource`, owned by an internal extent that is
    /// always considered added.
    current_event_resource: ResourceId,
    action_queue: VecDeque<Box<dyn FnOnce()>>,
    side_effect_queue: VecDeque<Box<dyn FnOnce()>>,
    /// Drained once per event, after side effects (§4.6 end-of-event cleanup).
    after_change_queue: VecDeque<Box<dyn FnOnce()>>,
    /// Behaviors whose `dynamic_links` need relinking before they next run (populated when a
    /// switch resource updates, consumed right before a behavior's `run` executes).
    pending_relink: IndexSet<BehaviorId>,
    /// Behaviors with a staged `set_demands`/`add_demand`/`remove_demand`/`set_supplies` call
    /// pending, consumed by `Graph::apply_modified_edges` at the start of every propagation
    /// iteration.
    modified_behaviors: IndexSet<BehaviorId>,
    /// Extents removed this event, whose behaviors/resources stay in the arena (readable, but
    /// inert) until this is drained at end-of-event cleanup.
    deferred_release: Vec<ExtentId>,
}

/// `true` iff `rid`'s owning extent has been added to the graph.
fn resource_extent_added(inner: &Inner, rid: ResourceId) -> bool {
    inner
        .resources
        .get(rid)
        .map(|data| inner.extents.get(data.extent).map(|e| e.added).unwrap_or(false))
        .unwrap_or(false)
}

/// The runtime that owns every extent, resource, and behavior, and drives propagation.
///
/// Always used through a `&'static Graph` obtained from [`Graph::new`]: the scheduler's
/// callback-heavy API (behaviors and side effects captured as boxed closures) is far simpler to
/// express without lifetime parameters threaded through every handle, at the cost of every graph
/// living for the rest of the process.
pub struct Graph {
    inner: RefCell<Inner>,
    config: GraphConfig,
    date_provider: Box<dyn DateProvider>,
    #[cfg(feature = "profile")]
    profiler: RefCell<Profiler>,
}

impl Graph {
    /// A graph with default configuration and a system-clock date provider.
    pub fn new() -> &'static Graph {
        Self::new_with(GraphConfig::default(), SystemDateProvider)
    }

    /// A graph with explicit configuration and date provider.
    pub fn new_with(config: GraphConfig, date_provider: impl DateProvider + 'static) -> &'static Graph {
        let mut resources = ResourceArena::default();
        let mut extents = ExtentArena::default();
        // An internal, always-added extent whose sole purpose is owning `current_event_resource`
        // (§6): it needs the same "extent must be added before it can be demanded" treatment as
        // any user resource, without going through the public add_to_graph path.
        let root_extent = extents.insert(ExtentData::fresh());
        extents[root_extent].added = true;
        let current_event_resource = resources.insert(ResourceData::new(root_extent, ResourceKind::State));
        resources[current_event_resource].value = Some(Box::new(Event::unknown_past()));

        let graph = Graph {
            inner: RefCell::new(Inner {
                resources,
                behaviors: BehaviorArena::default(),
                extents,
                queue: BehaviorQueue::default(),
                current_event: None,
                last_event: Event::unknown_past(),
                next_sequence: 1,
                current_behavior: None,
                current_event_resource,
                action_queue: VecDeque::new(),
                side_effect_queue: VecDeque::new(),
                after_change_queue: VecDeque::new(),
                pending_relink: IndexSet::new(),
                modified_behaviors: IndexSet::new(),
                deferred_release: Vec::new(),
            }),
            config,
            date_provider: Box::new(date_provider),
            #[cfg(feature = "profile")]
            profiler: RefCell::new(Profiler::default()),
        };
        Box::leak(Box::new(graph))
    }

    // -- arena access -----------------------------------------------------------------------

    pub(crate) fn with_resources<R>(&self, f: impl FnOnce(&ResourceArena) -> R) -> R {
        f(&self.inner.borrow().resources)
    }
    pub(crate) fn with_resources_mut<R>(&self, f: impl FnOnce(&mut ResourceArena) -> R) -> R {
        f(&mut self.inner.borrow_mut().resources)
    }
    pub(crate) fn with_behaviors<R>(&self, f: impl FnOnce(&BehaviorArena) -> R) -> R {
        f(&self.inner.borrow().behaviors)
    }
    pub(crate) fn with_behaviors_mut<R>(&self, f: impl FnOnce(&mut BehaviorArena) -> R) -> R {
        f(&mut self.inner.borrow_mut().behaviors)
    }
    pub(crate) fn with_extents_mut<R>(&self, f: impl FnOnce(&mut ExtentArena) -> R) -> R {
        f(&mut self.inner.borrow_mut().extents)
    }

    /// Sequence number of the currently active event, or `0` if no event is active. Used by
    /// resource handles to compute `just_updated`/`just_added` without exposing `Event` itself.
    pub(crate) fn current_event_sequence(&self) -> Sequence {
        self.inner.borrow().current_event.map(|e| e.sequence()).unwrap_or(0)
    }

    /// The event most recently completed, or [`Event::unknown_past`] if none has run yet.
    pub fn last_event(&self) -> Event {
        self.inner.borrow().last_event
    }

    /// The event currently being processed, if any.
    pub fn current_event(&self) -> Option<Event> {
        self.inner.borrow().current_event
    }

    /// The behavior currently running its `run` block, if any (§6).
    pub fn current_behavior(&'static self) -> Option<Behavior> {
        self.inner.borrow().current_behavior.map(|id| Behavior::new(id, self))
    }

    /// A state resource holding the current event while one is in progress, and the last
    /// completed event otherwise (§6). Demandable like any other resource.
    pub fn current_event_resource(&'static self) -> State<Event> {
        let id = self.inner.borrow().current_event_resource;
        State(crate::resource::ResourceHandle::new(id, self))
    }

    // -- extent lifecycle ---------------------------------------------------------------------

    /// Begin building a new extent. The closure receives an [`ExtentBuilder`] used to declare
    /// resources and behaviors; its return value (typically a struct of handles) is stashed in
    /// the returned [`ExtentHandle`]. The extent is inert until [`ExtentHandle::add_to_graph`].
    pub fn build_extent<T>(&'static self, build: impl FnOnce(&ExtentBuilder) -> T) -> ExtentHandle<T> {
        let id = self.inner.borrow_mut().extents.insert(ExtentData::fresh());
        let builder = ExtentBuilder { id, graph: self };
        let data = build(&builder);
        ExtentHandle { id, graph: self, data }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub(crate) fn add_extent(&'static self, id: ExtentId) {
        self.require_event_active(GraphError::GraphMutationOutsideAction);
        {
            let mut inner = self.inner.borrow_mut();
            let sequence = inner.current_event.map(|e| e.sequence()).unwrap_or(0);
            let resource_ids = inner.extents[id].resources.clone();
            for rid in &resource_ids {
                inner.resources[*rid].added = inner.current_event.unwrap();
            }
            inner.extents[id].added = true;
            let _ = sequence;
        }
        self.link_supplies(id);
        if let Err(e) = self.reorder_all() {
            e.fail();
        }
    }

    /// Unlinks this extent's resources and behaviors from the graph. Its behaviors' edges into
    /// *other* extents' resources (subsequents/supplier back-pointers) are dropped immediately;
    /// the extent's own resources and behaviors are only staged into `deferred_release` (§4.5,
    /// §9), so anything still holding a handle into them — a behavior later in this same event's
    /// run, or a queued side effect — can keep reading them until the event ends.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub(crate) fn remove_extent(&'static self, id: ExtentId) {
        self.require_event_active(GraphError::GraphMutationOutsideAction);
        let mut inner = self.inner.borrow_mut();
        let sequence = inner.current_event.map(|e| e.sequence()).unwrap_or(0).max(1);
        let behavior_ids = inner.extents[id].behaviors.clone();

        for bid in &behavior_ids {
            let (demands, supplies) = {
                let b = &inner.behaviors[*bid];
                (b.demands.clone(), b.supplies.clone())
            };
            for rid in &demands {
                if let Some(r) = inner.resources.get_mut(*rid) {
                    r.subsequents.retain(|b| b != bid);
                }
            }
            for rid in &supplies {
                if let Some(r) = inner.resources.get_mut(*rid) {
                    if r.supplier == Some(*bid) {
                        r.supplier = None;
                    }
                }
            }
            if let Some(b) = inner.behaviors.get_mut(*bid) {
                b.removed_sequence = sequence;
            }
        }

        inner.extents[id].removed = true;
        inner.deferred_release.push(id);
    }

    /// Actually frees a removed extent's behaviors and resources from their arenas. Called once
    /// per event, after side effects and `afterChanges` have run (§4.6 end-of-event cleanup).
    fn release_deferred(&'static self) {
        let mut inner = self.inner.borrow_mut();
        let ids: Vec<ExtentId> = inner.deferred_release.drain(..).collect();
        for id in ids {
            let resource_ids = inner.extents[id].resources.clone();
            let behavior_ids = inner.extents[id].behaviors.clone();
            for rid in resource_ids {
                inner.resources.remove(rid);
            }
            for bid in behavior_ids {
                inner.behaviors.remove(bid);
            }
        }
    }

    /// Register every behavior's supply list as the owning resource's `supplier`, failing on
    /// conflicting double-supply (§4.5) unless the prior supplier was removed this event. Also
    /// wires each resource's `subsequents` from demanding behaviors. Fails with
    /// **ResourceNotAdded** if any demanded/supplied resource's extent hasn't been added yet.
    fn link_supplies(&self, id: ExtentId) {
        let mut inner = self.inner.borrow_mut();
        let behavior_ids = inner.extents[id].behaviors.clone();
        for bid in &behavior_ids {
            let (demands, supplies) = {
                let b = &inner.behaviors[*bid];
                (b.demands.clone(), b.supplies.clone())
            };
            for rid in &supplies {
                if !resource_extent_added(&inner, *rid) {
                    let err = GraphError::ResourceNotAdded(*rid);
                    drop(inner);
                    err.fail();
                }
                if let Some(existing) = inner.resources[*rid].supplier {
                    let existing_removed = inner.behaviors.get(existing).map(|b| b.is_removed()).unwrap_or(true);
                    if existing != *bid && !existing_removed {
                        let err = GraphError::MultipleSuppliers {
                            resource: *rid,
                            existing,
                            attempted: *bid,
                        };
                        drop(inner);
                        err.fail();
                    }
                }
                inner.resources[*rid].supplier = Some(*bid);
            }
            for rid in &demands {
                if !resource_extent_added(&inner, *rid) {
                    let err = GraphError::ResourceNotAdded(*rid);
                    drop(inner);
                    err.fail();
                }
                if !inner.resources[*rid].subsequents.contains(bid) {
                    inner.resources[*rid].subsequents.push(*bid);
                }
            }
        }
    }

    /// Removes `bid` from every resource in `old` that isn't also in `new`, and adds it to every
    /// resource in `new` that wasn't already in `old`.
    fn diff_demands(inner: &mut Inner, bid: BehaviorId, old: &[ResourceId], new: &[ResourceId]) {
        for rid in old {
            if !new.contains(rid) {
                if let Some(r) = inner.resources.get_mut(*rid) {
                    r.subsequents.retain(|b| *b != bid);
                }
            }
        }
        for rid in new {
            if !old.contains(rid) {
                if let Some(r) = inner.resources.get_mut(*rid) {
                    if !r.subsequents.contains(&bid) {
                        r.subsequents.push(bid);
                    }
                }
            }
        }
    }

    /// Clears `bid` as supplier from every resource in `old` that isn't also in `new` (if it's
    /// still the supplier of record), and sets it as supplier for every resource in `new` that
    /// wasn't already in `old`.
    fn diff_supplies(inner: &mut Inner, bid: BehaviorId, old: &[ResourceId], new: &[ResourceId]) {
        for rid in old {
            if !new.contains(rid) {
                if let Some(r) = inner.resources.get_mut(*rid) {
                    if r.supplier == Some(bid) {
                        r.supplier = None;
                    }
                }
            }
        }
        for rid in new {
            if !old.contains(rid) {
                if let Some(r) = inner.resources.get_mut(*rid) {
                    r.supplier = Some(bid);
                }
            }
        }
    }

    /// Stages `demands` as the new demand set for behavior `bid`, to be applied by
    /// [`Self::apply_modified_edges`] (§4.3).
    pub(crate) fn stage_demands(&'static self, bid: BehaviorId, demands: Vec<ResourceId>) {
        self.require_event_active(GraphError::GraphMutationOutsideAction);
        let mut inner = self.inner.borrow_mut();
        if let Some(b) = inner.behaviors.get_mut(bid) {
            b.pending_demands = Some(demands);
        }
        inner.modified_behaviors.insert(bid);
    }

    /// Stages `supplies` as the new supply set for behavior `bid`, to be applied by
    /// [`Self::apply_modified_edges`] (§4.3).
    pub(crate) fn stage_supplies(&'static self, bid: BehaviorId, supplies: Vec<ResourceId>) {
        self.require_event_active(GraphError::GraphMutationOutsideAction);
        let mut inner = self.inner.borrow_mut();
        if let Some(b) = inner.behaviors.get_mut(bid) {
            b.pending_supplies = Some(supplies);
        }
        inner.modified_behaviors.insert(bid);
    }

    /// Applies every behavior's staged `set_demands`/`set_supplies` edge change (§4.3, §4.6 step
    /// 1): diffs the old and new edge sets, fixes up `subsequents`/`supplier` back-pointers
    /// accordingly, and reorders if anything changed. Called at the start of every propagation
    /// iteration, so a behavior's edges take effect before the next one is popped off the run
    /// queue.
    fn apply_modified_edges(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.modified_behaviors.is_empty() {
            return;
        }
        let ids: Vec<BehaviorId> = inner.modified_behaviors.drain(..).collect();
        let mut changed = false;
        for bid in ids {
            if inner.behaviors.get(bid).map(|b| b.is_removed()).unwrap_or(true) {
                continue;
            }
            let (old_demands, old_supplies, new_demands, new_supplies) = {
                let b = &inner.behaviors[bid];
                (
                    b.demands.clone(),
                    b.supplies.clone(),
                    b.pending_demands.clone(),
                    b.pending_supplies.clone(),
                )
            };

            if let Some(new_demands) = &new_demands {
                for rid in new_demands {
                    if !old_demands.contains(rid) && !resource_extent_added(&inner, *rid) {
                        let err = GraphError::ResourceNotAdded(*rid);
                        drop(inner);
                        err.fail();
                    }
                }
            }
            if let Some(new_supplies) = &new_supplies {
                for rid in new_supplies {
                    if old_supplies.contains(rid) {
                        continue;
                    }
                    if !resource_extent_added(&inner, *rid) {
                        let err = GraphError::ResourceNotAdded(*rid);
                        drop(inner);
                        err.fail();
                    }
                    if let Some(existing) = inner.resources.get(*rid).and_then(|r| r.supplier) {
                        let existing_removed = inner.behaviors.get(existing).map(|b| b.is_removed()).unwrap_or(true);
                        if existing != bid && !existing_removed {
                            let err = GraphError::MultipleSuppliers {
                                resource: *rid,
                                existing,
                                attempted: bid,
                            };
                            drop(inner);
                            err.fail();
                        }
                    }
                }
            }

            if let Some(new_demands) = new_demands {
                Self::diff_demands(&mut inner, bid, &old_demands, &new_demands);
                inner.behaviors[bid].demands = new_demands;
                inner.behaviors[bid].pending_demands = None;
                changed = true;
            }
            if let Some(new_supplies) = new_supplies {
                Self::diff_supplies(&mut inner, bid, &old_supplies, &new_supplies);
                inner.behaviors[bid].supplies = new_supplies;
                inner.behaviors[bid].pending_supplies = None;
                changed = true;
            }
        }
        if changed {
            drop(inner);
            if let Err(e) = self.reorder_all() {
                e.fail();
            }
        }
    }

    // -- topological ordering (structure phase, §4.6.1) ----------------------------------------

    /// Reassigns every live behavior's `order` via reverse-postorder DFS over the "feeds" graph
    /// (behavior -> behaviors demanding anything it supplies).
    fn reorder_all(&self) -> Result<(), GraphError> {
        let mut inner = self.inner.borrow_mut();
        let ids: Vec<BehaviorId> = inner
            .behaviors
            .iter()
            .filter(|(_, b)| !b.is_removed())
            .map(|(id, _)| id)
            .collect();
        for id in &ids {
            inner.behaviors[*id].ordering_state = OrderingState::Unordered;
        }
        let mut postorder = Vec::with_capacity(ids.len());
        let mut stack_trace = Vec::new();
        for id in &ids {
            if inner.behaviors[*id].ordering_state == OrderingState::Unordered {
                Self::dfs_visit(&mut inner, *id, &mut postorder, &mut stack_trace)?;
            }
        }
        for (order, id) in postorder.into_iter().rev().enumerate() {
            inner.behaviors[id].order = order as u64;
        }
        inner.queue.needs_resort();
        Ok(())
    }

    fn dfs_visit(
        inner: &mut Inner,
        id: BehaviorId,
        postorder: &mut Vec<BehaviorId>,
        stack_trace: &mut Vec<BehaviorId>,
    ) -> Result<(), GraphError> {
        inner.behaviors[id].ordering_state = OrderingState::Ordering;
        stack_trace.push(id);

        let supplies = inner.behaviors[id].supplies.clone();
        let mut subsequents = Vec::new();
        for rid in &supplies {
            if let Some(data) = inner.resources.get(*rid) {
                subsequents.extend(data.subsequents.iter().copied());
            }
        }

        for next in subsequents {
            if inner.behaviors.get(next).map(|b| b.is_removed()).unwrap_or(true) {
                continue;
            }
            match inner.behaviors[next].ordering_state {
                OrderingState::Unordered => Self::dfs_visit(inner, next, postorder, stack_trace)?,
                OrderingState::Ordering => {
                    let mut cycle = stack_trace.clone();
                    cycle.push(next);
                    return Err(GraphError::DependencyCycle(cycle));
                }
                OrderingState::Ordered => {}
            }
        }

        stack_trace.pop();
        inner.behaviors[id].ordering_state = OrderingState::Ordered;
        postorder.push(id);
        Ok(())
    }

    // -- events, actions, side effects (§4.6) ---------------------------------------------------

    fn require_event_active(&self, err: GraphError) {
        if self.inner.borrow().current_event.is_none() {
            err.fail();
        }
    }

    /// Run `body` as an action: opens a new event, runs `body`, propagates, runs queued side
    /// effects, then drains any actions queued (via nested `action` calls, or calls made from a
    /// running behavior) while this one ran. If an event is already active when called, the
    /// action is queued behind it unless `GraphConfig::default_require_sync` is set, in which
    /// case it panics with [`GraphError::SyncActionInsideEvent`] instead.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(impulse)))]
    pub fn action(&'static self, impulse: Option<&'static str>, body: impl FnOnce() + 'static) {
        if self.inner.borrow().current_event.is_some() {
            if self.config.default_require_sync {
                GraphError::SyncActionInsideEvent.fail();
            }
            self.inner.borrow_mut().action_queue.push_back(Box::new(move || {
                // Each queued action gets processed by `run_queued_actions` as its own event.
                body();
            }));
            return;
        }
        self.run_one_event(impulse, body);
        self.drain_queues();
    }

    fn run_one_event(&'static self, impulse: Option<&'static str>, body: impl FnOnce()) {
        let event = {
            let mut inner = self.inner.borrow_mut();
            let seq = inner.next_sequence;
            inner.next_sequence += 1;
            let event = Event::new(seq, self.date_provider.current_date(), impulse);
            inner.current_event = Some(event);
            event
        };
        let current_event_resource = self.inner.borrow().current_event_resource;
        self.force_update_value(current_event_resource, Box::new(event));

        body();
        self.run_propagation();
        // Side effects and afterChanges both run while `currentEvent` is still the event that
        // just propagated (§4.6): `current_event()`/`current_event_resource()` must still report
        // it for the duration of both phases, not `None`.
        self.run_side_effects();
        self.run_after_changes();
        {
            let mut inner = self.inner.borrow_mut();
            inner.last_event = inner.current_event.take().unwrap();
        }
        self.release_deferred();
    }

    fn drain_queues(&'static self) {
        loop {
            let next_action = self.inner.borrow_mut().action_queue.pop_front();
            match next_action {
                Some(action) => self.run_one_event(None, action),
                None => break,
            }
        }
    }

    /// Queue `body` to run after the current event's propagation finishes, or immediately if no
    /// event is active and `assert_on_leaked_side_effects` is `false`. If that flag is `true`
    /// and no event is active, panics with [`GraphError::LeakedSideEffect`] (§4.6, step 5).
    pub fn side_effect(&'static self, body: impl FnOnce() + 'static) {
        if self.inner.borrow().current_event.is_some() {
            self.inner.borrow_mut().side_effect_queue.push_back(Box::new(body));
        } else if self.config.assert_on_leaked_side_effects {
            GraphError::LeakedSideEffect.fail();
        } else {
            body();
        }
    }

    fn run_side_effects(&'static self) {
        loop {
            let next = self.inner.borrow_mut().side_effect_queue.pop_front();
            match next {
                Some(effect) => effect(),
                None => break,
            }
        }
    }

    /// Queue `body` to run once, after side effects, as part of this event's end-of-event
    /// cleanup (§3 `afterChanges`, §4.6). Unlike `side_effect`, there is no "leaked" case: calling
    /// this with no event active just queues the block for whichever event's cleanup runs next.
    pub fn after_change(&'static self, body: impl FnOnce() + 'static) {
        self.inner.borrow_mut().after_change_queue.push_back(Box::new(body));
    }

    fn run_after_changes(&'static self) {
        loop {
            let next = self.inner.borrow_mut().after_change_queue.pop_front();
            match next {
                Some(f) => f(),
                None => break,
            }
        }
    }

    // -- propagation (run phase, §4.6 steps 2-4) -------------------------------------------------

    fn run_propagation(&'static self) {
        loop {
            self.apply_modified_edges();
            let next = {
                let mut inner = self.inner.borrow_mut();
                inner.queue.pop(&inner.behaviors)
            };
            let Some(bid) = next else { break };
            self.run_behavior(bid);
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    fn run_behavior(&'static self, bid: BehaviorId) {
        let removed = self
            .inner
            .borrow()
            .behaviors
            .get(bid)
            .map(|b| b.is_removed())
            .unwrap_or(true);
        if removed {
            return;
        }

        self.relink_if_needed(bid);

        let mut run = {
            let mut inner = self.inner.borrow_mut();
            inner.current_behavior = Some(bid);
            inner.behaviors[bid].run.take()
        };

        #[cfg(feature = "profile")]
        let start = self.profiler.borrow().should_time().then(std::time::Instant::now);

        if let Some(run_fn) = &mut run {
            run_fn(self);
        }

        #[cfg(feature = "profile")]
        if let Some(start) = start {
            self.profiler.borrow_mut().record(bid, start.elapsed());
        }

        let mut inner = self.inner.borrow_mut();
        inner.current_behavior = None;
        if let Some(b) = inner.behaviors.get_mut(bid) {
            b.run = run;
            b.last_update_sequence = inner.current_event.map(|e| e.sequence()).unwrap_or(0);
        }
    }

    fn relink_if_needed(&'static self, bid: BehaviorId) {
        let needs = self.inner.borrow_mut().pending_relink.shift_remove(&bid);
        if !needs {
            return;
        }
        let mut relink = {
            let mut inner = self.inner.borrow_mut();
            inner.behaviors[bid].dynamic_links.take()
        };
        if let Some(links) = &mut relink {
            let (new_demands, new_supplies) = (links.relink)();
            let mut inner = self.inner.borrow_mut();

            for rid in new_demands.iter().chain(new_supplies.iter()) {
                if !resource_extent_added(&inner, *rid) {
                    let err = GraphError::ResourceNotAdded(*rid);
                    drop(inner);
                    err.fail();
                }
            }

            let (old_demands, old_supplies) = {
                let b = &inner.behaviors[bid];
                (b.demands.clone(), b.supplies.clone())
            };
            for rid in &new_supplies {
                if old_supplies.contains(rid) {
                    continue;
                }
                if let Some(existing) = inner.resources.get(*rid).and_then(|r| r.supplier) {
                    let existing_removed = inner.behaviors.get(existing).map(|b| b.is_removed()).unwrap_or(true);
                    if existing != bid && !existing_removed {
                        let err = GraphError::MultipleSuppliers {
                            resource: *rid,
                            existing,
                            attempted: bid,
                        };
                        drop(inner);
                        err.fail();
                    }
                }
            }

            Self::diff_demands(&mut inner, bid, &old_demands, &new_demands);
            Self::diff_supplies(&mut inner, bid, &old_supplies, &new_supplies);
            inner.behaviors[bid].demands = new_demands;
            inner.behaviors[bid].supplies = new_supplies;
        }
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(b) = inner.behaviors.get_mut(bid) {
                b.dynamic_links = relink;
            }
        }
        if let Err(e) = self.reorder_all() {
            e.fail();
        }
    }

    // -- resource updates (§4.2, §4.7) -----------------------------------------------------------

    /// Set a resource's value unconditionally and schedule its subsequents. Internal: typed
    /// handles (`Moment`/`State`) are responsible for the coalescing check and for validating
    /// that the call site is allowed to update this resource.
    #[track_caller]
    pub(crate) fn force_update_value(&'static self, id: crate::resource::ResourceId, value: Box<dyn Any>) {
        self.require_event_active(GraphError::GraphMutationOutsideAction);
        self.validate_update_site(id);

        let sequence = self.inner.borrow().current_event.unwrap().sequence();
        let subsequents = {
            let mut inner = self.inner.borrow_mut();
            let event = inner.current_event.unwrap();
            let data = &mut inner.resources[id];
            data.previous_value = data.value.take();
            data.previous_event = data.event;
            data.value = Some(value);
            data.event = event;
            data.subsequents.clone()
        };

        for bid in subsequents {
            let mut inner = self.inner.borrow_mut();
            if inner.behaviors.get(bid).map(|b| b.is_removed()).unwrap_or(true) {
                continue;
            }
            if inner.behaviors[bid].enqueued_sequence == sequence {
                continue;
            }
            inner.behaviors[bid].enqueued_sequence = sequence;
            let behaviors_snapshot = &inner.behaviors;
            inner.queue.push(bid, behaviors_snapshot);
        }

        // A switch resource updating means any behavior keyed on it needs relinking before its
        // next run, even if it isn't itself a subsequent of this resource.
        let mut inner = self.inner.borrow_mut();
        let switch_watchers: Vec<BehaviorId> = inner
            .behaviors
            .iter()
            .filter(|(_, b)| {
                b.dynamic_links
                    .as_ref()
                    .map(|links| links.switches.contains(&id))
                    .unwrap_or(false)
            })
            .map(|(bid, _)| bid)
            .collect();
        for bid in switch_watchers {
            inner.pending_relink.insert(bid);
        }
    }

    /// Enforces §4.7's update-site rule: a resource with no declared supplier may only be
    /// updated from inside an action body (`current_behavior` is `None`); a resource with a
    /// declared supplier may only be updated by that exact behavior.
    fn validate_update_site(&self, id: crate::resource::ResourceId) {
        let inner = self.inner.borrow();
        let supplier = inner.resources.get(id).and_then(|r| r.supplier);
        match (supplier, inner.current_behavior) {
            (None, Some(_)) => {
                drop(inner);
                GraphError::UpdatedOutsideBehavior(id).fail();
            }
            (Some(expected), Some(actual)) if expected != actual => {
                drop(inner);
                GraphError::UpdatedByNonSupplier(id).fail();
            }
            (Some(_), None) => {
                drop(inner);
                GraphError::UpdatedOutsideBehavior(id).fail();
            }
            _ => {}
        }
    }
}

#[cfg(feature = "profile")]
impl Graph {
    /// Start timing every behavior run. Off by default: timing every run has a real cost and
    /// most hosts only want it while diagnosing a specific slowdown.
    pub fn enable_profiling(&self) {
        self.profiler.borrow_mut().enable();
    }

    pub fn disable_profiling(&self) {
        self.profiler.borrow_mut().disable();
    }

    pub fn clear_profiling(&self) {
        self.profiler.borrow_mut().clear();
    }

    pub fn behavior_stats(&self, behavior: crate::behavior::Behavior) -> Option<crate::profiler::BehaviorStats> {
        self.profiler.borrow().stats_for(behavior.id())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::extent::ExtentBuilder;

    #[test]
    fn behavior_runs_after_its_demand_updates() {
        let graph = Graph::new();
        #[derive(Clone, Copy)]
        struct Data {
            a: crate::resource::Moment<i32>,
            b: crate::resource::State<i32>,
        }
        let ext = graph.build_extent(|bld: &ExtentBuilder| {
            let a = bld.moment::<i32>();
            let b = bld.state(0);
            bld.behavior(&[a.id()], &[b.id()], move |_g| {
                if let Some(v) = a.value() {
                    b.update_value(v * 2);
                }
            });
            Data { a, b }
        });
        graph.action(None, move || ext.add_to_graph());
        let data = ext.data();
        let (a, b) = (data.a, data.b);
        graph.action(None, move || a.update_value(21));
        assert_eq!(b.value(), 42);
    }

    #[test]
    fn cycle_is_detected() {
        let graph = Graph::new();
        let ext = graph.build_extent(|bld: &ExtentBuilder| {
            let r1 = bld.moment::<()>();
            let r2 = bld.moment::<()>();
            bld.behavior(&[r1.id()], &[r2.id()], |_| {});
            bld.behavior(&[r2.id()], &[r1.id()], |_| {});
            (r1, r2)
        });
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            graph.action(None, move || ext.add_to_graph());
        }));
        assert!(result.is_err());
    }

    #[test]
    fn diamond_dependency_runs_in_topological_order() {
        let graph = Graph::new();
        #[derive(Clone, Copy)]
        struct Data {
            top: crate::resource::Moment<()>,
            left: crate::resource::State<i32>,
            right: crate::resource::State<i32>,
            bottom: crate::resource::State<i32>,
        }
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let order_left = order.clone();
        let order_right = order.clone();
        let order_bottom = order.clone();
        let ext = graph.build_extent(|bld: &ExtentBuilder| {
            let top = bld.moment::<()>();
            let left = bld.state(0);
            let right = bld.state(0);
            let bottom = bld.state(0);
            bld.behavior(&[top.id()], &[left.id()], move |_g| {
                order_left.borrow_mut().push("left");
                left.update_value(1);
            });
            bld.behavior(&[top.id()], &[right.id()], move |_g| {
                order_right.borrow_mut().push("right");
                right.update_value(1);
            });
            bld.behavior(&[left.id(), right.id()], &[bottom.id()], move |_g| {
                order_bottom.borrow_mut().push("bottom");
                bottom.update_value(left.value() + right.value());
            });
            Data { top, left, right, bottom }
        });
        graph.action(None, move || ext.add_to_graph());
        let data = *ext.data();
        graph.action(None, move || data.top.update());
        assert_eq!(*order.borrow(), vec!["left", "right", "bottom"]);
        assert_eq!(data.bottom.value(), 2);
    }

    #[test]
    fn multiple_suppliers_panics() {
        let graph = Graph::new();
        let ext = graph.build_extent(|bld: &ExtentBuilder| {
            let r = bld.state(0);
            let trigger1 = bld.moment::<()>();
            let trigger2 = bld.moment::<()>();
            bld.behavior(&[trigger1.id()], &[r.id()], move |_g| {
                r.update_value_force(1);
            });
            bld.behavior(&[trigger2.id()], &[r.id()], move |_g| {
                r.update_value_force(2);
            });
        });
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            graph.action(None, move || ext.add_to_graph());
        }));
        assert!(result.is_err());
    }

    #[test]
    fn mutation_outside_action_panics() {
        let graph = Graph::new();
        let ext = graph.build_extent(|bld: &ExtentBuilder| bld.state(0));
        graph.action(None, move || ext.add_to_graph());
        let s = *ext.data();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            s.update_value(5);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn updated_by_non_supplier_panics() {
        let graph = Graph::new();
        #[derive(Clone, Copy)]
        struct Data {
            r: crate::resource::State<i32>,
            other_trigger: crate::resource::Moment<()>,
        }
        let ext = graph.build_extent(|bld: &ExtentBuilder| {
            let r = bld.state(0);
            let supplier_trigger = bld.moment::<()>();
            let other_trigger = bld.moment::<()>();
            bld.behavior(&[supplier_trigger.id()], &[r.id()], move |_g| {
                r.update_value(1);
            });
            bld.behavior(&[other_trigger.id()], &[], move |_g| {
                r.update_value(2);
            });
            Data { r, other_trigger }
        });
        graph.action(None, move || ext.add_to_graph());
        let data = *ext.data();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            graph.action(None, move || data.other_trigger.update());
        }));
        assert!(result.is_err());
    }

    #[test]
    fn sync_action_inside_event_panics() {
        let graph = Graph::new_with(
            GraphConfig {
                default_require_sync: true,
                ..Default::default()
            },
            SystemDateProvider,
        );
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            graph.action(None, move || {
                graph.action(None, move || {});
            });
        }));
        assert!(result.is_err());
    }

    #[test]
    fn leaked_side_effect_panics_when_configured() {
        let graph = Graph::new_with(
            GraphConfig {
                assert_on_leaked_side_effects: true,
                ..Default::default()
            },
            SystemDateProvider,
        );
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            graph.side_effect(|| {});
        }));
        assert!(result.is_err());
    }

    #[test]
    fn demanding_unadded_resource_panics() {
        let graph = Graph::new();
        let never_added = graph.build_extent(|bld: &ExtentBuilder| bld.state(0));
        let r_id = never_added.data().id();
        let other = graph.build_extent(|bld: &ExtentBuilder| {
            let trigger = bld.moment::<()>();
            bld.behavior(&[trigger.id(), r_id], &[], |_g| {});
            trigger
        });
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            graph.action(None, move || other.add_to_graph());
        }));
        assert!(result.is_err());
    }

    #[test]
    fn removed_extent_resource_survives_until_event_ends() {
        let graph = Graph::new();
        let ext = graph.build_extent(|bld: &ExtentBuilder| bld.state(7));
        graph.action(None, move || ext.add_to_graph());
        let handle = *ext.data();
        graph.action(None, move || {
            ext.remove_from_graph();
            assert_eq!(handle.value(), 7);
        });
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handle.value();
        }));
        assert!(result.is_err());
    }

    #[test]
    fn replacing_removed_extents_supplier_does_not_panic() {
        let graph = Graph::new();
        #[derive(Clone, Copy)]
        struct Data {
            r: crate::resource::State<i32>,
            trigger: crate::resource::Moment<()>,
        }
        let ext_a = graph.build_extent(|bld: &ExtentBuilder| {
            let r = bld.state(1);
            let trigger = bld.moment::<()>();
            bld.behavior(&[trigger.id()], &[r.id()], move |_g| {
                r.update_value_force(2);
            });
            Data { r, trigger }
        });
        graph.action(None, move || ext_a.add_to_graph());
        let r_id = ext_a.data().r.id();

        let ext_b = graph.build_extent(|bld: &ExtentBuilder| {
            let trigger = bld.moment::<()>();
            bld.behavior(&[trigger.id()], &[r_id], move |_g| {});
            trigger
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            graph.action(None, move || {
                ext_a.remove_from_graph();
                ext_b.add_to_graph();
            });
        }));
        assert!(result.is_ok());
    }

    #[test]
    fn dynamic_behavior_relinks_when_switch_updates() {
        let graph = Graph::new();
        #[derive(Clone, Copy)]
        struct Data {
            switch: crate::resource::State<bool>,
            source_a: crate::resource::State<i32>,
            source_b: crate::resource::State<i32>,
            output: crate::resource::State<i32>,
        }
        let runs = Rc::new(RefCell::new(0));
        let runs_in = runs.clone();
        let ext = graph.build_extent(|bld: &ExtentBuilder| {
            let switch = bld.state(true);
            let source_a = bld.state(1);
            let source_b = bld.state(2);
            let output = bld.state(0);
            bld.dynamic_behavior(
                &[switch.id()],
                move || {
                    if switch.value() {
                        (vec![switch.id(), source_a.id()], vec![output.id()])
                    } else {
                        (vec![switch.id(), source_b.id()], vec![output.id()])
                    }
                },
                move |_g| {
                    *runs_in.borrow_mut() += 1;
                    let v = if switch.value() { source_a.value() } else { source_b.value() };
                    output.update_value_force(v);
                },
            );
            Data {
                switch,
                source_a,
                source_b,
                output,
            }
        });
        graph.action(None, move || ext.add_to_graph());
        let data = *ext.data();

        graph.action(None, move || data.switch.update_value(false));
        assert_eq!(*runs.borrow(), 1);
        assert_eq!(data.output.value(), 2);

        // Stale demand from before the relink must no longer trigger the behavior.
        graph.action(None, move || data.source_a.update_value_force(99));
        assert_eq!(*runs.borrow(), 1);

        // The newly relinked demand does trigger it.
        graph.action(None, move || data.source_b.update_value_force(3));
        assert_eq!(*runs.borrow(), 2);
        assert_eq!(data.output.value(), 3);
    }

    #[test]
    fn behavior_set_demands_changes_what_triggers_it() {
        let graph = Graph::new();
        #[derive(Clone, Copy)]
        struct Data {
            a: crate::resource::Moment<()>,
            b: crate::resource::Moment<()>,
            behavior: Behavior,
        }
        let runs = Rc::new(RefCell::new(0));
        let runs_in = runs.clone();
        let ext = graph.build_extent(|bld: &ExtentBuilder| {
            let a = bld.moment::<()>();
            let b = bld.moment::<()>();
            let behavior = bld.behavior(&[a.id()], &[], move |_g| {
                *runs_in.borrow_mut() += 1;
            });
            Data { a, b, behavior }
        });
        graph.action(None, move || ext.add_to_graph());
        let data = *ext.data();

        graph.action(None, move || data.behavior.set_demands(&[data.b.id()]));
        assert_eq!(*runs.borrow(), 0);

        graph.action(None, move || data.a.update());
        assert_eq!(*runs.borrow(), 0);

        graph.action(None, move || data.b.update());
        assert_eq!(*runs.borrow(), 1);
    }

    #[test]
    fn behavior_add_and_remove_demand() {
        let graph = Graph::new();
        #[derive(Clone, Copy)]
        struct Data {
            a: crate::resource::Moment<()>,
            c: crate::resource::Moment<()>,
            behavior: Behavior,
        }
        let runs = Rc::new(RefCell::new(0));
        let runs_in = runs.clone();
        let ext = graph.build_extent(|bld: &ExtentBuilder| {
            let a = bld.moment::<()>();
            let c = bld.moment::<()>();
            let behavior = bld.behavior(&[a.id()], &[], move |_g| {
                *runs_in.borrow_mut() += 1;
            });
            Data { a, c, behavior }
        });
        graph.action(None, move || ext.add_to_graph());
        let data = *ext.data();

        graph.action(None, move || data.behavior.add_demand(data.c.id()));
        graph.action(None, move || data.c.update());
        assert_eq!(*runs.borrow(), 1);

        graph.action(None, move || data.behavior.remove_demand(data.a.id()));
        graph.action(None, move || data.a.update());
        assert_eq!(*runs.borrow(), 1);
    }

    #[test]
    fn after_change_runs_after_side_effects() {
        let graph = Graph::new();
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let log_effect = log.clone();
        let log_after = log.clone();
        graph.action(None, move || {
            graph.side_effect(move || log_effect.borrow_mut().push("side_effect"));
            graph.after_change(move || log_after.borrow_mut().push("after_change"));
        });
        assert_eq!(*log.borrow(), vec!["side_effect", "after_change"]);
    }

    #[test]
    fn current_behavior_reports_the_running_behavior() {
        let graph = Graph::new();
        let seen: Rc<RefCell<Option<BehaviorId>>> = Rc::new(RefCell::new(None));
        let seen_in = seen.clone();
        #[derive(Clone, Copy)]
        struct Data {
            trigger: crate::resource::Moment<()>,
        }
        let ext = graph.build_extent(|bld: &ExtentBuilder| {
            let trigger = bld.moment::<()>();
            bld.behavior(&[trigger.id()], &[], move |g| {
                *seen_in.borrow_mut() = g.current_behavior().map(|b| b.id());
            });
            Data { trigger }
        });
        graph.action(None, move || ext.add_to_graph());
        assert!(graph.current_behavior().is_none());
        let data = *ext.data();
        graph.action(None, move || data.trigger.update());
        assert!(seen.borrow().is_some());
        assert!(graph.current_behavior().is_none());
    }

    #[test]
    fn current_event_resource_reflects_current_then_last_event() {
        let graph = Graph::new();
        let seen_seq: Rc<RefCell<Option<Sequence>>> = Rc::new(RefCell::new(None));
        let seen_in = seen_seq.clone();
        graph.action(None, move || {
            let ev = graph.current_event_resource().value();
            seen_in.borrow_mut().replace(ev.sequence());
            assert_eq!(graph.current_event().unwrap().sequence(), ev.sequence());
        });
        let after = graph.current_event_resource().value();
        assert_eq!(Some(after.sequence()), *seen_seq.borrow());
        assert_eq!(graph.last_event().sequence(), after.sequence());
    }
}
