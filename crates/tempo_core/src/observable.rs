//! Leaf value sources
//!
//! An [`Observable`] has no upstream. Every [`Observable::set`] plays out as a
//! short lifecycle spread over one scheduler cycle: `start` during pre-tick,
//! `end` during the dirty phase.

use crate::events::Event;
use crate::handler::{EventHandler, Source};
use crate::scheduler::Scheduler;
use std::fmt;

/// Settable value with change notification
pub struct Observable<T> {
    events: EventHandler<T>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<T: Clone + 'static> Observable<T> {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            events: EventHandler::new(scheduler),
        }
    }

    /// Create an observable and schedule an initial [`set`](Self::set)
    pub fn with_value(scheduler: &Scheduler, value: T) -> Self {
        let observable = Self::new(scheduler);
        observable.set(value);
        observable
    }

    /// Schedule a change to `value`.
    ///
    /// The stored value only changes once the next cycle's pre-tick phase
    /// runs; `get` keeps returning the old value until then.
    pub fn set(&self, value: T) {
        let events = self.events.clone();
        let scheduler = self.events.scheduler().clone();
        tracing::trace!(observable = ?events.id(), "set scheduled");

        self.events.scheduler().defer_pre_tick(move || {
            events.emit(Event::Start(value.clone()));
            scheduler.defer_dirty(move || events.emit(Event::End(value)));
        });
    }

    pub fn get(&self) -> Option<T> {
        self.events.get()
    }

    pub fn is_active(&self) -> bool {
        self.events.is_active()
    }
}

impl<T> Source<T> for Observable<T> {
    fn events(&self) -> &EventHandler<T> {
        &self.events
    }
}

impl<T: fmt::Debug + Clone + 'static> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("id", &self.events.id())
            .field("value", &self.events.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::scheduler::Phase;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_set_spans_two_phases() {
        let scheduler = Scheduler::new();
        let value = Observable::new(&scheduler);

        let seen = Rc::new(RefCell::new(Vec::new()));
        for kind in EventKind::VALUES {
            let seen = seen.clone();
            let s = scheduler.clone();
            value.events().on(kind, move |event: &Event<i32>| {
                seen.borrow_mut().push((event.clone(), s.phase()))
            });
        }

        value.set(3);
        assert_eq!(value.get(), None);
        scheduler.step();

        assert_eq!(
            *seen.borrow(),
            vec![
                (Event::Start(3), Phase::PreTick),
                (Event::End(3), Phase::PostTick)
            ]
        );
        assert_eq!(value.get(), Some(3));
        assert!(!value.is_active());
    }

    #[test]
    fn test_set_without_subscribers() {
        let scheduler = Scheduler::new();
        let value = Observable::with_value(&scheduler, "a");
        assert_eq!(scheduler.pending_tasks(), 1);

        scheduler.step();
        assert_eq!(value.get(), Some("a"));
        assert_eq!(scheduler.pending_tasks(), 0);
    }

    #[test]
    fn test_debug_shows_current_value() {
        let scheduler = Scheduler::new();
        let value = Observable::with_value(&scheduler, 7);
        scheduler.step();
        let shown = format!("{value:?}");
        assert!(shown.starts_with("Observable"));
        assert!(shown.contains("Some(7)"));
    }

    #[test]
    fn test_last_set_in_a_cycle_wins() {
        let scheduler = Scheduler::new();
        let value = Observable::with_value(&scheduler, 1);
        value.set(2);
        scheduler.step();
        assert_eq!(value.get(), Some(2));
    }
}
