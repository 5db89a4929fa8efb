//! Event vocabulary
//!
//! Value events (`set`, `start`, `update`, `end`) describe the lifecycle of a
//! value change. `lock` and `unlock` are structural back-pressure signals and
//! carry no payload.

use std::fmt;

/// Payload-free event tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Discrete assignment with no surrounding lifecycle
    Set,
    /// A value change began
    Start,
    /// A value change is in flight
    Update,
    /// A value change finished
    End,
    /// Upstream asks downstream to hold emissions
    Lock,
    /// Upstream releases a previous lock
    Unlock,
}

impl EventKind {
    /// Kinds that carry a payload
    pub const VALUES: [EventKind; 4] = [
        EventKind::Set,
        EventKind::Start,
        EventKind::Update,
        EventKind::End,
    ];

    /// Every kind, values first
    pub const ALL: [EventKind; 6] = [
        EventKind::Set,
        EventKind::Start,
        EventKind::Update,
        EventKind::End,
        EventKind::Lock,
        EventKind::Unlock,
    ];

    pub const fn is_value(self) -> bool {
        !matches!(self, EventKind::Lock | EventKind::Unlock)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Set => "set",
            EventKind::Start => "start",
            EventKind::Update => "update",
            EventKind::End => "end",
            EventKind::Lock => "lock",
            EventKind::Unlock => "unlock",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event flowing through handlers and streams
#[derive(Clone, Debug, PartialEq)]
pub enum Event<T> {
    Set(T),
    Start(T),
    Update(T),
    End(T),
    Lock,
    Unlock,
}

impl<T> Event<T> {
    /// Build an event of the given kind.
    ///
    /// `Lock` and `Unlock` carry no payload, so `payload` is dropped for them.
    pub fn with_kind(kind: EventKind, payload: T) -> Self {
        match kind {
            EventKind::Set => Event::Set(payload),
            EventKind::Start => Event::Start(payload),
            EventKind::Update => Event::Update(payload),
            EventKind::End => Event::End(payload),
            EventKind::Lock => Event::Lock,
            EventKind::Unlock => Event::Unlock,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Set(_) => EventKind::Set,
            Event::Start(_) => EventKind::Start,
            Event::Update(_) => EventKind::Update,
            Event::End(_) => EventKind::End,
            Event::Lock => EventKind::Lock,
            Event::Unlock => EventKind::Unlock,
        }
    }

    pub fn payload(&self) -> Option<&T> {
        match self {
            Event::Set(v) | Event::Start(v) | Event::Update(v) | Event::End(v) => Some(v),
            Event::Lock | Event::Unlock => None,
        }
    }

    pub fn into_payload(self) -> Option<T> {
        match self {
            Event::Set(v) | Event::Start(v) | Event::Update(v) | Event::End(v) => Some(v),
            Event::Lock | Event::Unlock => None,
        }
    }

    /// Transform the payload, keeping the kind
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Event<U> {
        match self {
            Event::Set(v) => Event::Set(f(v)),
            Event::Start(v) => Event::Start(f(v)),
            Event::Update(v) => Event::Update(f(v)),
            Event::End(v) => Event::End(f(v)),
            Event::Lock => Event::Lock,
            Event::Unlock => Event::Unlock,
        }
    }
}

/// Handle returned by `on`, used to remove a single listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
