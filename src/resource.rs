//! Resources: typed reactive cells.

use std::any::Any;
use std::marker::PhantomData;

use slotmap::{new_key_type, SlotMap};

use crate::behavior::BehaviorId;
use crate::event::Event;
use crate::extent::ExtentId;
use crate::graph::Graph;

new_key_type! {
    /// A stable, generational reference to a [`ResourceData`] slot. Resolves to `None` once the
    /// owning extent is released, which is what makes the "weak back-reference" described in the
    /// data model safe without any reference counting.
    pub struct ResourceId;
}

pub(crate) type ResourceArena = SlotMap<ResourceId, ResourceData>;

/// What kind of value-lifetime semantics a resource has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceKind {
    /// Holds a value only during the event that set it (§3, Moment).
    Moment,
    /// Holds a persistent value plus a one-event trace (§3, State).
    State,
}

/// The type-erased, arena-owned backing storage for a resource. Never exposed directly; always
/// accessed through a typed handle ([`Moment<T>`] / [`State<T>`]).
pub(crate) struct ResourceData {
    pub kind: ResourceKind,
    pub extent: ExtentId,
    pub supplier: Option<BehaviorId>,
    pub subsequents: Vec<BehaviorId>,
    pub value: Option<Box<dyn Any>>,
    pub event: Event,
    pub previous_value: Option<Box<dyn Any>>,
    pub previous_event: Event,
    pub added: Event,
    pub debug_name: Option<&'static str>,
}

impl ResourceData {
    pub fn new(extent: ExtentId, kind: ResourceKind) -> Self {
        Self {
            kind,
            extent,
            supplier: None,
            subsequents: Vec::new(),
            value: None,
            event: Event::unknown_past(),
            previous_value: None,
            previous_event: Event::unknown_past(),
            added: Event::unknown_past(),
            debug_name: None,
        }
    }
}

/// Base handle shared by [`Moment<T>`] and [`State<T>`]. Small, `Copy`, and cheap to capture by
/// value into a behavior's closure.
pub struct ResourceHandle<T> {
    pub(crate) id: ResourceId,
    pub(crate) graph: &'static Graph,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ResourceHandle<T> {}

impl<T: 'static> ResourceHandle<T> {
    pub(crate) fn new(id: ResourceId, graph: &'static Graph) -> Self {
        Self {
            id,
            graph,
            _marker: PhantomData,
        }
    }

    /// The arena key identifying this resource. Used to build demand/supply lists.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Set a static debug name, surfaced in panics and the optional profiler.
    pub fn set_debug_name(&self, name: &'static str) {
        self.graph.with_resources_mut(|resources| {
            if let Some(data) = resources.get_mut(self.id) {
                data.debug_name = Some(name);
            }
        });
    }

    fn with_data<R>(&self, f: impl FnOnce(&ResourceData) -> R) -> R {
        self.graph
            .with_resources(|resources| f(resources.get(self.id).expect("resource has been removed")))
    }

    /// The current value. Panics if the resource has never been given a value (a freshly
    /// created `Moment` outside the event that creates it, for instance).
    pub fn value(&self) -> T
    where
        T: Clone,
    {
        self.with_data(|data| {
            data.value
                .as_ref()
                .and_then(|v| v.downcast_ref::<T>())
                .cloned()
                .expect("resource has no current value")
        })
    }

    /// The event at which the current value was set.
    pub fn event(&self) -> Event {
        self.with_data(|data| data.event)
    }

    /// The snapshot as of the start of the current event: the previous value if this resource
    /// was updated in the current event, otherwise the current value.
    pub fn trace_value(&self) -> T
    where
        T: Clone,
    {
        if self.just_updated() {
            self.with_data(|data| {
                data.previous_value
                    .as_ref()
                    .and_then(|v| v.downcast_ref::<T>())
                    .cloned()
                    .expect("state resource has no trace value")
            })
        } else {
            self.value()
        }
    }

    /// The event associated with [`trace_value`](Self::trace_value).
    pub fn trace_event(&self) -> Event {
        if self.just_updated() {
            self.with_data(|data| data.previous_event)
        } else {
            self.event()
        }
    }

    /// `true` iff this resource was updated during the graph's currently active event.
    ///
    /// This is deliberately compared against the graph's *active* event rather than
    /// `last_event`: once `action` returns and no event is active, every resource's
    /// `just_updated` becomes `false` again, which is what makes a moment's value observably
    /// gone to a caller reading it right after the action returns (§8 invariant 4).
    pub fn just_updated(&self) -> bool {
        let current = self.graph.current_event_sequence();
        current != 0 && self.with_data(|data| data.event.sequence() == current)
    }

    /// `self.just_updated() && self.value() == to`.
    pub fn just_updated_to(&self, to: &T) -> bool
    where
        T: PartialEq + Clone,
    {
        self.just_updated() && self.value() == *to
    }

    /// `true` iff this resource has ever been updated since creation.
    pub fn has_updated(&self) -> bool {
        self.event().sequence() > 0
    }

    /// `true` iff this resource updated more recently than `other`.
    pub fn has_updated_since(&self, other: &Event) -> bool {
        self.event().sequence() > other.sequence()
    }

    /// `true` iff this resource's owning extent was added to the graph during the currently
    /// active event.
    pub fn just_added(&self) -> bool {
        let current = self.graph.current_event_sequence();
        current != 0 && self.with_data(|data| data.added.sequence() == current)
    }
}

/// A transient-value resource: holds `Some` value only during the event that set it (§3).
///
/// Used both for genuinely transient signals (button clicks, network completions) and, via the
/// `Moment<()>` instantiation, as a pure dependency hook with no payload ("plain resource" in the
/// distilled spec — see [`PlainResource`]).
pub struct Moment<T: 'static>(pub(crate) ResourceHandle<T>);

impl<T> Clone for Moment<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Moment<T> {}

impl<T: 'static> Moment<T> {
    pub fn id(&self) -> ResourceId {
        self.0.id()
    }
    pub fn set_debug_name(&self, name: &'static str) {
        self.0.set_debug_name(name);
    }
    pub fn event(&self) -> Event {
        self.0.event()
    }
    pub fn just_updated(&self) -> bool {
        self.0.just_updated()
    }
    pub fn has_updated(&self) -> bool {
        self.0.has_updated()
    }
    pub fn has_updated_since(&self, other: &Event) -> bool {
        self.0.has_updated_since(other)
    }
    pub fn just_added(&self) -> bool {
        self.0.just_added()
    }

    /// The value carried by the current event's update, if this moment was updated this event.
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        if self.just_updated() {
            Some(self.0.value())
        } else {
            None
        }
    }

    pub fn just_updated_to(&self, to: &T) -> bool
    where
        T: PartialEq + Clone,
    {
        self.0.just_updated_to(to)
    }

    /// Fire this moment with `value`. Always schedules subsequents (moments have no equality
    /// coalescing), matching §4.7: only states can opt into coalescing.
    #[track_caller]
    pub fn update_value(&self, value: T) {
        self.0.graph.force_update_value(self.0.id, Box::new(value));
    }
}

impl Moment<()> {
    /// Fire this moment with no payload.
    #[track_caller]
    pub fn update(&self) {
        self.update_value(());
    }
}

/// An event-only resource with no payload: a pure dependency hook (§3). An alias over
/// `Moment<()>` rather than a distinct type, since the two have an identical public surface —
/// `justUpdated`/`hasUpdated`/demand-and-supply eligibility — and a separate type would only
/// duplicate that surface without adding behavior.
pub type PlainResource = Moment<()>;

/// A persistent-value resource with a one-event trace (§3).
pub struct State<T: 'static>(pub(crate) ResourceHandle<T>);

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for State<T> {}

impl<T: 'static> State<T> {
    pub fn id(&self) -> ResourceId {
        self.0.id()
    }
    pub fn set_debug_name(&self, name: &'static str) {
        self.0.set_debug_name(name);
    }
    pub fn event(&self) -> Event {
        self.0.event()
    }
    pub fn just_updated(&self) -> bool {
        self.0.just_updated()
    }
    pub fn has_updated(&self) -> bool {
        self.0.has_updated()
    }
    pub fn has_updated_since(&self, other: &Event) -> bool {
        self.0.has_updated_since(other)
    }
    pub fn just_added(&self) -> bool {
        self.0.just_added()
    }

    pub fn value(&self) -> T
    where
        T: Clone,
    {
        self.0.value()
    }

    pub fn trace_value(&self) -> T
    where
        T: Clone,
    {
        self.0.trace_value()
    }

    pub fn trace_event(&self) -> Event {
        self.0.trace_event()
    }

    pub fn just_updated_to(&self, to: &T) -> bool
    where
        T: PartialEq + Clone,
    {
        self.0.just_updated_to(to)
    }

    /// `just_updated() && trace_value() == from` (by domain equality).
    pub fn just_updated_from(&self, from: &T) -> bool
    where
        T: PartialEq + Clone,
    {
        self.just_updated() && self.trace_value() == *from
    }

    /// `just_updated() && value() == to && trace_value() == from`.
    pub fn just_updated_to_from(&self, to: &T, from: &T) -> bool
    where
        T: PartialEq + Clone,
    {
        self.just_updated_to(to) && self.trace_value() == *from
    }

    /// Update the value, coalescing on domain equality: a no-op (no trace capture, no
    /// subsequents scheduled) if `value == self.value()` (§4.2, `_updateValue`).
    #[track_caller]
    pub fn update_value(&self, value: T)
    where
        T: PartialEq,
    {
        let unchanged = self.0.graph.with_resources(|resources| {
            resources
                .get(self.0.id)
                .and_then(|data| data.value.as_ref())
                .and_then(|v| v.downcast_ref::<T>())
                .map(|current| *current == value)
                .unwrap_or(false)
        });
        if !unchanged {
            self.0.graph.force_update_value(self.0.id, Box::new(value));
        }
    }

    /// Update the value unconditionally: subsequents run even if the value is unchanged
    /// (§4.2, `_forceUpdateValue`).
    #[track_caller]
    pub fn update_value_force(&self, value: T) {
        self.0.graph.force_update_value(self.0.id, Box::new(value));
    }
}

#[cfg(test)]
mod tests {
    use crate::extent::ExtentBuilder;
    use crate::graph::Graph;

    #[test]
    fn moment_value_only_visible_during_its_event() {
        let graph = Graph::new();
        let ext = graph.build_extent(|b: &ExtentBuilder| b.moment::<i32>());
        graph.action(None, move || ext.add_to_graph());
        let m = *ext.data();
        graph.action(None, move || {
            m.update_value(42);
            assert_eq!(m.value(), Some(42));
        });
        assert_eq!(m.value(), None);
    }

    #[test]
    fn state_trace_reflects_pre_event_value() {
        let graph = Graph::new();
        let ext = graph.build_extent(|b: &ExtentBuilder| b.state(1));
        graph.action(None, move || ext.add_to_graph());
        let s = *ext.data();
        graph.action(None, move || s.update_value(2));
        assert_eq!(s.value(), 2);
        // Outside the event, trace_value falls back to the current value.
        assert_eq!(s.trace_value(), 2);
    }

    #[test]
    fn state_update_value_coalesces_equal_values() {
        use std::cell::RefCell;
        use std::rc::Rc;
        let graph = Graph::new();
        let ext = graph.build_extent(|b: &ExtentBuilder| b.state(1));
        graph.action(None, move || ext.add_to_graph());
        let s = *ext.data();
        let just_updated = Rc::new(RefCell::new(false));

        let flag = just_updated.clone();
        graph.action(None, move || {
            s.update_value(1);
            *flag.borrow_mut() = s.just_updated();
        });
        assert!(!*just_updated.borrow(), "equal value must not fire subsequents");

        let flag = just_updated.clone();
        graph.action(None, move || {
            s.update_value_force(1);
            *flag.borrow_mut() = s.just_updated();
        });
        assert!(
            *just_updated.borrow(),
            "update_value_force always fires, even on an equal value"
        );

        let flag = just_updated.clone();
        graph.action(None, move || {
            s.update_value(2);
            *flag.borrow_mut() = s.just_updated();
        });
        assert!(*just_updated.borrow(), "a genuinely differing update_value still fires");
        assert_eq!(s.value(), 2);
    }
}
