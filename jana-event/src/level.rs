use std::fmt;

/// The tier an event belongs to in the event hierarchy.
///
/// Levels are ordered from coarse to fine: a timeslice unfolds into physics
/// events, which may unfold further into subevents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventLevel {
    /// A fixed window of raw detector readout.
    Timeslice,
    /// One physics interaction.
    PhysicsEvent,
    /// A slice of one physics event, for sub-event parallelism.
    Subevent,
}

impl EventLevel {
    /// All levels, coarse to fine.
    pub const ALL: [EventLevel; 3] = [
        EventLevel::Timeslice,
        EventLevel::PhysicsEvent,
        EventLevel::Subevent,
    ];
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventLevel::Timeslice => "Timeslice",
            EventLevel::PhysicsEvent => "PhysicsEvent",
            EventLevel::Subevent => "Subevent",
        };
        f.write_str(name)
    }
}
