//! A deterministic, topologically ordered dataflow engine for reactive application logic.
//!
//! A [`Graph`] owns a set of [`Extent`](extent::ExtentHandle)s, each of which groups resources
//! ([`Moment<T>`](resource::Moment) / [`State<T>`](resource::State)) and behaviors
//! ([`Behavior`](behavior::Behavior)) with a shared lifetime. An [`Graph::action`] mutates
//! resources with no declared supplier; the graph then runs every behavior whose demands were
//! touched, in topological order, until the update settles. [`Graph::side_effect`] defers
//! observable side effects (I/O, further actions) until after that settling completes, so a
//! behavior never observes a partially-propagated graph.
//!
//! See the module docs on [`graph`], [`resource`], [`behavior`], and [`extent`] for the full
//! data model.

mod behavior;
mod error;
mod event;
mod extent;
mod graph;
mod priority_queue;
#[cfg(feature = "profile")]
mod profiler;
mod resource;

pub use behavior::{Behavior, BehaviorId};
pub use error::GraphError;
pub use event::{DateProvider, Event, Sequence, SystemDateProvider};
pub use extent::{ExtentBuilder, ExtentHandle, ExtentId};
pub use graph::{Graph, GraphConfig};
#[cfg(feature = "profile")]
pub use profiler::BehaviorStats;
pub use resource::{Moment, PlainResource, ResourceId, State};
