//! Events: the immutable stamp attached to every resource update.

use chrono::{DateTime, Utc};

/// A monotonically increasing sequence number. Sequence `0` is reserved for
/// [`Event::unknown_past`] and never assigned to a real event.
pub type Sequence = u64;

/// An immutable record of a single stimulus processed by the [`Graph`](crate::Graph).
///
/// Every resource update is stamped with the `Event` of the propagation cycle that produced
/// it. Events are totally ordered by [`Event::sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Event {
    sequence: Sequence,
    timestamp: DateTime<Utc>,
    impulse: Option<&'static str>,
}

impl Event {
    pub(crate) fn new(sequence: Sequence, timestamp: DateTime<Utc>, impulse: Option<&'static str>) -> Self {
        Self {
            sequence,
            timestamp,
            impulse,
        }
    }

    /// The distinguished event stamped on every resource at creation time, before it has ever
    /// been updated. Has sequence `0`, which never compares equal to a real event's sequence.
    pub fn unknown_past() -> Self {
        Self {
            sequence: 0,
            timestamp: DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is representable"),
            impulse: None,
        }
    }

    /// The sequence number of this event. Strictly increasing across the lifetime of a graph.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// The wall-clock timestamp this event was opened at, per the graph's [`DateProvider`](crate::DateProvider).
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The human-readable label the action supplied when it opened this event, if any.
    pub fn impulse(&self) -> Option<&'static str> {
        self.impulse
    }

    /// Whether this event is strictly newer than the event with sequence `since`.
    pub fn happened_since(&self, since: Sequence) -> bool {
        self.sequence > since
    }
}

/// Supplies the wall-clock timestamp stamped on each new [`Event`].
///
/// Hosts can substitute a deterministic or mockable provider for tests; the default
/// implementation used by [`Graph::new`](crate::Graph::new) wraps [`chrono::Utc::now`].
pub trait DateProvider {
    /// The current date, used to timestamp the next event opened by the graph.
    fn current_date(&self) -> DateTime<Utc>;
}

/// The default [`DateProvider`], backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDateProvider;

impl DateProvider for SystemDateProvider {
    fn current_date(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_past_has_sequence_zero() {
        assert_eq!(Event::unknown_past().sequence(), 0);
    }

    #[test]
    fn happened_since_compares_sequence() {
        let e = Event::new(5, Utc::now(), None);
        assert!(e.happened_since(4));
        assert!(!e.happened_since(5));
        assert!(!e.happened_since(6));
    }
}
