//! Running reductions over one source
//!
//! [`Differential`] turns absolute values into per-event deltas and
//! [`Accumulator`] folds deltas back into a running total. Both relay each
//! upstream event as it arrives, keeping its kind, and pass lock signals
//! through untouched.

use crate::events::{Event, EventKind, ListenerId};
use crate::handler::{EventHandler, Source};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, Sub};
use std::rc::Rc;

/// Listeners on a source feeding a fresh output handler
struct Relay<S: Clone + 'static, T: Clone + 'static> {
    source: EventHandler<S>,
    output: EventHandler<T>,
    listeners: SmallVec<[(EventKind, ListenerId); 6]>,
}

impl<S: Clone + 'static, T: Clone + 'static> Relay<S, T> {
    fn new<F>(source: &EventHandler<S>, map: F) -> Self
    where
        F: FnMut(&Event<S>) -> Event<T> + 'static,
    {
        let output = EventHandler::new(source.scheduler());
        let (from, to) = (source.id(), output.id());
        source
            .scheduler()
            .with_topology(|topology| topology.link_fresh(from, to));

        let map = Rc::new(RefCell::new(map));
        let mut listeners = SmallVec::new();
        for kind in EventKind::ALL {
            let output = output.clone();
            let map = Rc::clone(&map);
            let id = source.on(kind, move |event: &Event<S>| {
                let mapped = (map.borrow_mut())(event);
                output.emit(mapped);
            });
            listeners.push((kind, id));
        }

        Self {
            source: source.clone(),
            output,
            listeners,
        }
    }
}

impl<S: Clone + 'static, T: Clone + 'static> Drop for Relay<S, T> {
    fn drop(&mut self) {
        for (kind, id) in &self.listeners {
            self.source.off(*kind, Some(*id));
        }
        let (from, to) = (self.source.id(), self.output.id());
        self.source
            .scheduler()
            .with_topology(|topology| topology.remove_edge(from, to));
    }
}

/// Emits the change between consecutive upstream values.
///
/// `start` opens a new baseline and emits a zero delta; every later value is
/// reported relative to the previous one.
pub struct Differential<T: Clone + 'static> {
    relay: Rc<Relay<T, T>>,
}

impl<T: Clone + 'static> Clone for Differential<T> {
    fn clone(&self) -> Self {
        Self {
            relay: Rc::clone(&self.relay),
        }
    }
}

impl<T> Differential<T>
where
    T: Clone + Default + Sub<Output = T> + 'static,
{
    pub fn new<S: Source<T> + ?Sized>(source: &S) -> Self {
        let mut previous: Option<T> = None;
        let relay = Relay::new(source.events(), move |event: &Event<T>| {
            let kind = event.kind();
            let Some(value) = event.payload() else {
                return event.clone();
            };
            let delta = match (kind, previous.take()) {
                (EventKind::Start, _) | (_, None) => T::default(),
                (_, Some(prev)) => value.clone() - prev,
            };
            if kind != EventKind::End {
                previous = Some(value.clone());
            }
            Event::with_kind(kind, delta)
        });
        Self {
            relay: Rc::new(relay),
        }
    }

    /// Last emitted delta
    pub fn get(&self) -> Option<T> {
        self.relay.output.get()
    }
}

impl<T: Clone + 'static> Source<T> for Differential<T> {
    fn events(&self) -> &EventHandler<T> {
        &self.relay.output
    }
}

impl<T: Clone + 'static> fmt::Debug for Differential<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Differential")
            .field("source", &self.relay.source.id())
            .field("output", &self.relay.output.id())
            .finish()
    }
}

/// Adds every upstream payload into a running total and emits the total
pub struct Accumulator<T: Clone + 'static> {
    relay: Rc<Relay<T, T>>,
    total: Rc<RefCell<T>>,
}

impl<T: Clone + 'static> Clone for Accumulator<T> {
    fn clone(&self) -> Self {
        Self {
            relay: Rc::clone(&self.relay),
            total: Rc::clone(&self.total),
        }
    }
}

impl<T> Accumulator<T>
where
    T: Clone + Add<Output = T> + 'static,
{
    pub fn new<S: Source<T> + ?Sized>(source: &S, initial: T) -> Self {
        let total = Rc::new(RefCell::new(initial));
        let running = Rc::clone(&total);
        let relay = Relay::new(source.events(), move |event: &Event<T>| {
            let Some(delta) = event.payload() else {
                return event.clone();
            };
            let mut total = running.borrow_mut();
            *total = total.clone() + delta.clone();
            Event::with_kind(event.kind(), total.clone())
        });
        Self {
            relay: Rc::new(relay),
            total,
        }
    }

    pub fn total(&self) -> T {
        self.total.borrow().clone()
    }

    /// Replace the running total without emitting
    pub fn reset(&self, total: T) {
        *self.total.borrow_mut() = total;
    }
}

impl<T: Clone + 'static> Source<T> for Accumulator<T> {
    fn events(&self) -> &EventHandler<T> {
        &self.relay.output
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Accumulator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accumulator")
            .field("source", &self.relay.source.id())
            .field("total", &self.total.borrow())
            .finish()
    }
}
