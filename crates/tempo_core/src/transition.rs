//! Multi-cycle transitions
//!
//! A [`Transitionable`] moves from its current value to a target over a
//! fixed number of scheduler cycles and holds a lock on everything downstream
//! while it moves. One transition plays out as:
//!
//! - `lock` and `start(from)` in the pre-tick phase of the first cycle
//! - one `update` per tick while frames remain
//! - `end(to)` followed by `unlock` on the final tick
//!
//! Setting a new target mid-flight retargets from the current value without
//! releasing the lock. A zero-frame transition behaves like
//! [`Observable::set`](crate::Observable::set).

use crate::events::Event;
use crate::handler::{EventHandler, Source};
use crate::scheduler::{Scheduler, TickKey, TickSignal};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Easing curve applied to transition progress
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Easing {
    #[default]
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
}

impl Easing {
    /// Map progress in `0.0..=1.0` onto the curve
    pub fn apply(&self, t: f32) -> f32 {
        match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t * t,
            Easing::EaseOut => 1.0 - (1.0 - t).powi(3),
            Easing::EaseInOut => {
                if t < 0.5 {
                    4.0 * t * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
                }
            }
        }
    }
}

/// Values a [`Transitionable`] can move between
pub trait Interpolate: Clone + 'static {
    fn interpolate(&self, to: &Self, t: f32) -> Self;
}

impl Interpolate for f32 {
    fn interpolate(&self, to: &Self, t: f32) -> Self {
        self + (to - self) * t
    }
}

impl Interpolate for f64 {
    fn interpolate(&self, to: &Self, t: f32) -> Self {
        self + (to - self) * f64::from(t)
    }
}

impl Interpolate for i32 {
    fn interpolate(&self, to: &Self, t: f32) -> Self {
        self + ((to - self) as f32 * t).round() as i32
    }
}

impl<A: Interpolate, B: Interpolate> Interpolate for (A, B) {
    fn interpolate(&self, to: &Self, t: f32) -> Self {
        (self.0.interpolate(&to.0, t), self.1.interpolate(&to.1, t))
    }
}

/// Length and curve of one transition
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transition {
    /// Ticks until the target is reached
    pub frames: u32,
    pub easing: Easing,
}

impl Transition {
    pub fn linear(frames: u32) -> Self {
        Self {
            frames,
            easing: Easing::Linear,
        }
    }

    pub fn with_easing(mut self, easing: Easing) -> Self {
        self.easing = easing;
        self
    }
}

struct Running<T> {
    from: T,
    to: T,
    frame: u32,
    transition: Transition,
}

struct TransitionShared<T> {
    events: EventHandler<T>,
    scheduler: Scheduler,
    value: RefCell<T>,
    running: RefCell<Option<Running<T>>>,
    tick_key: Cell<Option<TickKey>>,
}

impl<T> Drop for TransitionShared<T> {
    fn drop(&mut self) {
        if let Some(key) = self.tick_key.take() {
            self.scheduler.off_tick(key);
        }
    }
}

/// Value source that moves toward its target over several cycles
pub struct Transitionable<T> {
    shared: Rc<TransitionShared<T>>,
}

impl<T> Clone for Transitionable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: Interpolate> Transitionable<T> {
    /// Create a transitionable resting at `value`. Nothing is emitted until
    /// the first [`set`](Self::set).
    pub fn new(scheduler: &Scheduler, value: T) -> Self {
        let shared = Rc::new(TransitionShared {
            events: EventHandler::new(scheduler),
            scheduler: scheduler.clone(),
            value: RefCell::new(value),
            running: RefCell::new(None),
            tick_key: Cell::new(None),
        });

        let weak = Rc::downgrade(&shared);
        let key = scheduler.on_tick(move |signal| {
            if signal != TickSignal::Tick {
                return;
            }
            if let Some(shared) = weak.upgrade() {
                Transitionable { shared }.advance();
            }
        });
        shared.tick_key.set(Some(key));

        Self { shared }
    }

    /// Move to `target` starting with the next cycle
    pub fn set(&self, target: T, transition: Transition) {
        let weak = Rc::downgrade(&self.shared);
        self.shared.scheduler.defer_pre_tick(move || {
            if let Some(shared) = weak.upgrade() {
                Transitionable { shared }.begin(target, transition);
            }
        });
    }

    /// The value as of the last emitted frame
    pub fn get(&self) -> T {
        self.shared.value.borrow().clone()
    }

    /// Whether a transition is in flight
    pub fn is_running(&self) -> bool {
        self.shared.running.borrow().is_some()
    }

    fn begin(&self, to: T, transition: Transition) {
        let events = &self.shared.events;
        let from = self.get();
        let retarget = self.shared.running.borrow_mut().take().is_some();

        if transition.frames == 0 {
            *self.shared.value.borrow_mut() = to.clone();
            if retarget {
                self.finish(to);
            } else {
                events.emit(Event::Start(to.clone()));
                let events = events.clone();
                self.shared
                    .scheduler
                    .defer_dirty(move || events.emit(Event::End(to)));
            }
            return;
        }

        *self.shared.running.borrow_mut() = Some(Running {
            from: from.clone(),
            to,
            frame: 0,
            transition,
        });
        if retarget {
            tracing::debug!(source = ?events.id(), frames = transition.frames, "transition retargeted");
        } else {
            tracing::debug!(source = ?events.id(), frames = transition.frames, "transition started");
            events.emit(Event::Lock);
            events.emit(Event::Start(from));
        }
    }

    fn advance(&self) {
        let event = {
            let mut running = self.shared.running.borrow_mut();
            let Some(run) = running.as_mut() else {
                return;
            };
            run.frame += 1;
            if run.frame < run.transition.frames {
                let progress = run.frame as f32 / run.transition.frames as f32;
                let t = run.transition.easing.apply(progress);
                Event::Update(run.from.interpolate(&run.to, t))
            } else {
                let to = run.to.clone();
                *running = None;
                Event::End(to)
            }
        };

        match event {
            Event::End(to) => {
                *self.shared.value.borrow_mut() = to.clone();
                self.finish(to);
            }
            event => {
                if let Some(value) = event.payload() {
                    *self.shared.value.borrow_mut() = value.clone();
                }
                self.shared.events.emit(event);
            }
        }
    }

    fn finish(&self, to: T) {
        let events = &self.shared.events;
        events.emit(Event::End(to));
        events.emit(Event::Unlock);
        tracing::debug!(source = ?events.id(), "transition finished");
    }
}

impl<T> Source<T> for Transitionable<T> {
    fn events(&self) -> &EventHandler<T> {
        &self.shared.events
    }
}

impl<T: fmt::Debug> fmt::Debug for Transitionable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transitionable")
            .field("value", &self.shared.value.borrow())
            .field("running", &self.shared.running.borrow().is_some())
            .finish()
    }
}
