//! Merging streams
//!
//! A [`Stream`] subscribes to any number of upstream sources and emits at
//! most one merged event per resolution window:
//!
//! - the **tick window** opens with the `Tick` broadcast. Inputs received
//!   before it (pre-tick, or between cycles) resolve when the stream ticks;
//!   inputs arriving later in the tick phase resolve on arrival.
//! - the **settle window** opens with the `EndTick` broadcast and resolves
//!   whatever arrived during the dirty phase. Inputs arriving after the
//!   stream has settled, from upstream streams that settle later in the
//!   broadcast, resolve on arrival.
//!
//! Each upstream slot remembers the latest event kind it delivered in the
//! current window, and [`collapse`] folds those kinds into the one kind the
//! stream emits. While any upstream holds a lock the stream caches instead of
//! emitting, and it resolves the cached input as soon as the last lock is
//! released.
//!
//! # Example
//!
//! ```rust
//! use tempo_core::{Observable, Scheduler, Source, Stream};
//!
//! let scheduler = Scheduler::new();
//! let width = Observable::with_value(&scheduler, 10);
//! let height = Observable::with_value(&scheduler, 4);
//!
//! let area = Stream::lift(
//!     &scheduler,
//!     |values: &[Option<i32>]| Some(values.iter().flatten().product::<i32>()),
//!     &[&width as &dyn Source<i32>, &height],
//! );
//!
//! scheduler.step();
//! assert_eq!(area.get(), Some(40));
//! ```

use crate::config::RefirePolicy;
use crate::error::Result;
use crate::events::{Event, EventKind, ListenerId};
use crate::handler::{EventHandler, Source};
use crate::scheduler::{Phase, Scheduler, TickKey, TickSignal};
use crate::topology::NodeId;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Payload transform applied to the resolved kind. `None` vetoes emission.
pub type Trigger<T> = Rc<dyn Fn(T) -> Option<T>>;

/// Maps an upstream payload into this stream's payload type
type Adapter<S, T> = Rc<dyn Fn(Option<&S>) -> Option<T>>;

/// Fold the per-source kinds of one window into a single kind.
///
/// `update` wins outright. `start` with `end` is a value change inside the
/// window and becomes `update`. With nothing but `set` (or nothing at all)
/// the result is `set`. Lock signals never reach the collapse.
pub fn collapse<I>(kinds: I) -> EventKind
where
    I: IntoIterator<Item = EventKind>,
{
    let mut has_start = false;
    let mut has_end = false;

    for kind in kinds {
        match kind {
            EventKind::Update => return EventKind::Update,
            EventKind::Start => has_start = true,
            EventKind::End => has_end = true,
            EventKind::Set | EventKind::Lock | EventKind::Unlock => {}
        }
    }

    match (has_start, has_end) {
        (true, false) => EventKind::Start,
        (true, true) => EventKind::Update,
        (false, true) => EventKind::End,
        (false, false) => EventKind::Set,
    }
}

/// Optional per-kind payload transforms
pub struct Triggers<T> {
    set: Option<Trigger<T>>,
    start: Option<Trigger<T>>,
    update: Option<Trigger<T>>,
    end: Option<Trigger<T>>,
}

impl<T> Default for Triggers<T> {
    fn default() -> Self {
        Self {
            set: None,
            start: None,
            update: None,
            end: None,
        }
    }
}

impl<T> Clone for Triggers<T> {
    fn clone(&self) -> Self {
        Self {
            set: self.set.clone(),
            start: self.start.clone(),
            update: self.update.clone(),
            end: self.end.clone(),
        }
    }
}

impl<T> Triggers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_set<F: Fn(T) -> Option<T> + 'static>(mut self, trigger: F) -> Self {
        self.set = Some(Rc::new(trigger));
        self
    }

    pub fn on_start<F: Fn(T) -> Option<T> + 'static>(mut self, trigger: F) -> Self {
        self.start = Some(Rc::new(trigger));
        self
    }

    pub fn on_update<F: Fn(T) -> Option<T> + 'static>(mut self, trigger: F) -> Self {
        self.update = Some(Rc::new(trigger));
        self
    }

    pub fn on_end<F: Fn(T) -> Option<T> + 'static>(mut self, trigger: F) -> Self {
        self.end = Some(Rc::new(trigger));
        self
    }

    pub fn get(&self, kind: EventKind) -> Option<&Trigger<T>> {
        match kind {
            EventKind::Set => self.set.as_ref(),
            EventKind::Start => self.start.as_ref(),
            EventKind::Update => self.update.as_ref(),
            EventKind::End => self.end.as_ref(),
            EventKind::Lock | EventKind::Unlock => None,
        }
    }

    /// Run the trigger for `kind`, if any. `None` means vetoed.
    fn apply(&self, kind: EventKind, payload: T) -> Option<T> {
        match self.get(kind) {
            Some(trigger) => trigger(payload),
            None => Some(payload),
        }
    }
}

/// Type-erased view of one upstream subscription
trait Upstream<T> {
    fn source(&self) -> NodeId;
    fn is_active(&self) -> bool;
    /// The source's current value mapped into the stream's payload
    fn pull(&self) -> Option<T>;
    fn detach(&self);
}

struct Link<S, T> {
    source: EventHandler<S>,
    listeners: SmallVec<[(EventKind, ListenerId); 6]>,
    adapter: Adapter<S, T>,
}

impl<S: Clone + 'static, T> Upstream<T> for Link<S, T> {
    fn source(&self) -> NodeId {
        self.source.id()
    }

    fn is_active(&self) -> bool {
        self.source.is_active()
    }

    fn pull(&self) -> Option<T> {
        (self.adapter)(self.source.get().as_ref())
    }

    fn detach(&self) {
        for (kind, id) in &self.listeners {
            self.source.off(*kind, Some(*id));
        }
    }
}

struct Slot<T> {
    key: u64,
    /// Latest kind delivered in the current window
    kind: Option<EventKind>,
    locked: bool,
    link: Box<dyn Upstream<T>>,
}

struct StreamState<T> {
    slots: Vec<Slot<T>>,
    next_slot: u64,
    cache: Option<T>,
    pending: bool,
    locked_counter: u32,
    /// Replayed starts minus replayed ends since the last resolution
    start_counter: i32,
    ticked: bool,
    /// Handled `EndTick` in the current cycle
    settled: bool,
    fired: u32,
}

struct StreamShared<T> {
    output: EventHandler<T>,
    scheduler: Scheduler,
    triggers: Triggers<T>,
    state: RefCell<StreamState<T>>,
    tick_key: Cell<Option<TickKey>>,
}

impl<T> Drop for StreamShared<T> {
    fn drop(&mut self) {
        if let Some(key) = self.tick_key.take() {
            self.scheduler.off_tick(key);
        }
        for slot in self.state.get_mut().slots.drain(..) {
            slot.link.detach();
        }
    }
}

/// Dataflow node merging upstream events into one emission per window
pub struct Stream<T> {
    shared: Rc<StreamShared<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: Clone + 'static> Stream<T> {
    /// Create a stream with no upstream sources
    pub fn new(scheduler: &Scheduler, triggers: Triggers<T>) -> Self {
        let shared = Rc::new(StreamShared {
            output: EventHandler::new(scheduler),
            scheduler: scheduler.clone(),
            triggers,
            state: RefCell::new(StreamState {
                slots: Vec::new(),
                next_slot: 0,
                cache: None,
                pending: false,
                locked_counter: 0,
                start_counter: 0,
                ticked: false,
                settled: false,
                fired: 0,
            }),
            tick_key: Cell::new(None),
        });

        let weak = Rc::downgrade(&shared);
        let key = scheduler.on_tick(move |signal| {
            if let Some(shared) = weak.upgrade() {
                Stream { shared }.on_signal(signal);
            }
        });
        shared.tick_key.set(Some(key));

        Self { shared }
    }

    /// Merge homogeneous sources. `merge` sees every source's current value
    /// whenever any of them fires; returning `None` suppresses that input.
    pub fn lift<S, F>(scheduler: &Scheduler, merge: F, sources: &[&dyn Source<S>]) -> Self
    where
        S: Clone + 'static,
        F: Fn(&[Option<S>]) -> Option<T> + 'static,
    {
        Self::lift_with_triggers(scheduler, merge, sources, Triggers::default())
    }

    pub fn lift_with_triggers<S, F>(
        scheduler: &Scheduler,
        merge: F,
        sources: &[&dyn Source<S>],
        triggers: Triggers<T>,
    ) -> Self
    where
        S: Clone + 'static,
        F: Fn(&[Option<S>]) -> Option<T> + 'static,
    {
        let stream = Self::new(scheduler, triggers);
        let handlers: Rc<[EventHandler<S>]> =
            sources.iter().map(|source| source.events().clone()).collect();

        let values = Rc::clone(&handlers);
        let adapter: Adapter<S, T> = Rc::new(move |_: Option<&S>| {
            let current: SmallVec<[Option<S>; 4]> = values.iter().map(|h| h.get()).collect();
            merge(&current)
        });

        for handler in handlers.iter() {
            stream.attach_fresh(handler, Rc::clone(&adapter));
        }
        stream
    }

    /// Merge two sources of different payload types
    pub fn lift2<A, B, SA, SB, F>(scheduler: &Scheduler, merge: F, a: &SA, b: &SB) -> Self
    where
        A: Clone + 'static,
        B: Clone + 'static,
        SA: Source<A> + ?Sized,
        SB: Source<B> + ?Sized,
        F: Fn(Option<A>, Option<B>) -> Option<T> + 'static,
    {
        let stream = Self::new(scheduler, Triggers::default());
        let (a, b) = (a.events().clone(), b.events().clone());

        let (va, vb) = (a.clone(), b.clone());
        let pull: Rc<dyn Fn() -> Option<T>> = Rc::new(move || merge(va.get(), vb.get()));

        stream.attach_fresh(&a, pulled(&pull));
        stream.attach_fresh(&b, pulled(&pull));
        stream
    }

    /// Merge three sources of different payload types
    pub fn lift3<A, B, C, SA, SB, SC, F>(
        scheduler: &Scheduler,
        merge: F,
        a: &SA,
        b: &SB,
        c: &SC,
    ) -> Self
    where
        A: Clone + 'static,
        B: Clone + 'static,
        C: Clone + 'static,
        SA: Source<A> + ?Sized,
        SB: Source<B> + ?Sized,
        SC: Source<C> + ?Sized,
        F: Fn(Option<A>, Option<B>, Option<C>) -> Option<T> + 'static,
    {
        let stream = Self::new(scheduler, Triggers::default());
        let (a, b, c) = (a.events().clone(), b.events().clone(), c.events().clone());

        let (va, vb, vc) = (a.clone(), b.clone(), c.clone());
        let pull: Rc<dyn Fn() -> Option<T>> =
            Rc::new(move || merge(va.get(), vb.get(), vc.get()));

        stream.attach_fresh(&a, pulled(&pull));
        stream.attach_fresh(&b, pulled(&pull));
        stream.attach_fresh(&c, pulled(&pull));
        stream
    }

    pub fn id(&self) -> NodeId {
        self.shared.output.id()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// Add `source` as an upstream slot, passing its payloads through.
    /// A source that already feeds a slot is not added again.
    pub fn subscribe<S>(&self, source: &S) -> Result<()>
    where
        S: Source<T> + ?Sized,
    {
        let source = source.events();
        let (from, to) = (source.id(), self.id());
        let linked = self
            .shared
            .state
            .borrow()
            .slots
            .iter()
            .any(|slot| slot.link.source() == from);
        if linked {
            return Ok(());
        }
        self.shared
            .scheduler
            .with_topology(|topology| topology.add_edge(from, to))?;
        self.attach(source, Rc::new(|value: Option<&T>| value.cloned()));
        Ok(())
    }

    /// Remove the slot fed by `source`. Returns false if there is none.
    pub fn unsubscribe<U, S>(&self, source: &S) -> bool
    where
        U: Clone + 'static,
        S: Source<U> + ?Sized,
    {
        self.detach(source.events().id())
    }

    /// Remove every upstream slot, returning how many were removed
    pub fn unsubscribe_all(&self) -> usize {
        let sources: SmallVec<[NodeId; 4]> = self
            .shared
            .state
            .borrow()
            .slots
            .iter()
            .map(|slot| slot.link.source())
            .collect();

        let mut removed = 0;
        for source in sources {
            if self.detach(source) {
                removed += 1;
            }
        }
        removed
    }

    fn attach_fresh<S: Clone + 'static>(&self, source: &EventHandler<S>, adapter: Adapter<S, T>) {
        let (from, to) = (source.id(), self.id());
        self.shared
            .scheduler
            .with_topology(|topology| topology.link_fresh(from, to));
        self.attach(source, adapter);
    }

    /// Wire a slot to `source`. The topology edge must already exist.
    fn attach<S: Clone + 'static>(&self, source: &EventHandler<S>, adapter: Adapter<S, T>) {
        let key = {
            let mut state = self.shared.state.borrow_mut();
            state.next_slot += 1;
            state.next_slot
        };

        let mut listeners = SmallVec::new();
        for kind in EventKind::ALL {
            let weak = Rc::downgrade(&self.shared);
            let adapter = Rc::clone(&adapter);
            let id = source.on(kind, move |event: &Event<S>| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let stream = Stream { shared };
                match event.kind() {
                    EventKind::Lock => stream.dep_lock(key),
                    EventKind::Unlock => stream.dep_unlock(key),
                    kind => stream.receive(Some(key), kind, adapter(event.payload()), false),
                }
            });
            listeners.push((kind, id));
        }

        let replay = adapter(source.get().as_ref());
        self.shared.state.borrow_mut().slots.push(Slot {
            key,
            kind: None,
            locked: false,
            link: Box::new(Link {
                source: source.clone(),
                listeners,
                adapter,
            }),
        });
        tracing::debug!(upstream = ?source.id(), stream = ?self.id(), slot = key, "stream subscribed");

        let config = self.shared.scheduler.config();
        if source.is_locked() && config.lock_on_subscribe {
            self.dep_lock(key);
        }
        if source.is_active() && config.replay_active_sources {
            self.receive(None, EventKind::Start, replay, true);
        }
    }

    fn detach(&self, source: NodeId) -> bool {
        let slot = {
            let mut state = self.shared.state.borrow_mut();
            match state.slots.iter().position(|s| s.link.source() == source) {
                Some(pos) => state.slots.remove(pos),
                None => return false,
            }
        };

        slot.link.detach();
        let to = self.id();
        self.shared
            .scheduler
            .with_topology(|topology| topology.remove_edge(source, to));
        tracing::debug!(upstream = ?source, stream = ?to, slot = slot.key, "stream unsubscribed");

        if slot.locked {
            self.release_lock();
        }
        if slot.link.is_active() && self.shared.scheduler.config().replay_active_sources {
            self.receive(None, EventKind::End, slot.link.pull(), true);
        }
        true
    }

    /// Input from slot `slot` (or from `trigger` when `None`)
    fn receive(&self, slot: Option<u64>, kind: EventKind, payload: Option<T>, replayed: bool) {
        let resolve_now = {
            let mut state = self.shared.state.borrow_mut();
            if replayed {
                match kind {
                    EventKind::Start => state.start_counter += 1,
                    EventKind::End => state.start_counter -= 1,
                    _ => {}
                }
            } else if let Some(key) = slot {
                if let Some(slot) = state.slots.iter_mut().find(|s| s.key == key) {
                    slot.kind = Some(kind);
                }
            }

            let Some(payload) = payload else {
                tracing::trace!(stream = ?self.id(), %kind, "input suppressed");
                return;
            };
            state.cache = Some(payload);
            state.pending = true;

            let window_open = match self.shared.scheduler.phase() {
                Phase::Tick => state.ticked,
                Phase::EndTick => state.settled,
                _ => false,
            };
            window_open && state.locked_counter == 0
        };

        if resolve_now {
            self.resolve();
        }
    }

    fn dep_lock(&self, key: u64) {
        let first = {
            let mut state = self.shared.state.borrow_mut();
            let Some(slot) = state.slots.iter_mut().find(|s| s.key == key && !s.locked) else {
                return;
            };
            slot.locked = true;
            state.locked_counter += 1;
            state.locked_counter == 1
        };
        if first {
            tracing::debug!(stream = ?self.id(), "stream locked");
            self.shared.output.emit(Event::Lock);
        }
    }

    fn dep_unlock(&self, key: u64) {
        let released = {
            let mut state = self.shared.state.borrow_mut();
            match state.slots.iter_mut().find(|s| s.key == key && s.locked) {
                Some(slot) => {
                    slot.locked = false;
                    true
                }
                None => false,
            }
        };
        if released {
            self.release_lock();
        }
    }

    fn release_lock(&self) {
        let (unlocked, pending) = {
            let mut state = self.shared.state.borrow_mut();
            state.locked_counter = state.locked_counter.saturating_sub(1);
            (state.locked_counter == 0, state.pending)
        };
        if unlocked {
            tracing::debug!(stream = ?self.id(), pending, "stream unlocked");
            self.shared.output.emit(Event::Unlock);
            if pending {
                self.resolve();
            }
        }
    }

    fn on_signal(&self, signal: TickSignal) {
        let ready = {
            let mut state = self.shared.state.borrow_mut();
            if signal == TickSignal::Tick {
                state.ticked = true;
                state.settled = false;
            }
            state.fired = 0;
            state.pending && state.locked_counter == 0
        };
        if ready {
            self.resolve();
        }

        if signal == TickSignal::EndTick {
            let mut state = self.shared.state.borrow_mut();
            state.ticked = false;
            state.settled = true;
            state.fired = 0;
            if !state.pending {
                for slot in &mut state.slots {
                    slot.kind = None;
                }
            }
        }
    }

    fn resolve(&self) {
        let scheduler = &self.shared.scheduler;
        let (kind, payload, nested) = {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            if !state.pending {
                return;
            }

            state.fired += 1;
            if state.fired > 1 {
                scheduler.record_refire();
                tracing::warn!(
                    stream = ?self.id(),
                    frame = scheduler.frame(),
                    fired = state.fired,
                    "stream resolved more than once in one window"
                );
                if scheduler.config().refire_policy == RefirePolicy::Defer {
                    return;
                }
            }

            state.pending = false;
            let Some(payload) = state.cache.take() else {
                return;
            };
            let kind = collapse(state.slots.iter().filter_map(|slot| slot.kind));
            for slot in &mut state.slots {
                slot.kind = None;
            }
            (kind, payload, std::mem::take(&mut state.start_counter))
        };

        let Some(payload) = self.shared.triggers.apply(kind, payload) else {
            tracing::trace!(stream = ?self.id(), %kind, "emission vetoed");
            return;
        };

        let output = &self.shared.output;
        if nested > 0 && kind != EventKind::Start {
            output.emit(Event::Start(payload.clone()));
        }
        tracing::trace!(stream = ?self.id(), %kind, nested, "stream emit");
        if nested < 0 && kind != EventKind::End {
            output.emit(Event::with_kind(kind, payload.clone()));
            output.emit(Event::End(payload));
        } else {
            output.emit(Event::with_kind(kind, payload));
        }
    }

    /// Push an event in from outside the subscription graph.
    ///
    /// With no upstream slots the stream is a plain pass-through: the trigger
    /// for the event's kind runs and the result is emitted right away.
    /// Otherwise the event joins the current window like any other input.
    pub fn trigger(&self, event: Event<T>) {
        let kind = event.kind();
        let payload = match event {
            Event::Lock | Event::Unlock => {
                self.shared.output.emit(event);
                return;
            }
            Event::Set(v) | Event::Start(v) | Event::Update(v) | Event::End(v) => v,
        };

        if self.shared.state.borrow().slots.is_empty() {
            if let Some(payload) = self.shared.triggers.apply(kind, payload) {
                self.shared.output.emit(Event::with_kind(kind, payload));
            }
        } else {
            self.receive(None, kind, Some(payload), false);
        }
    }

    /// Emit directly to subscribers, bypassing the merge
    pub fn emit(&self, event: Event<T>) {
        self.shared.output.emit(event);
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event<T>) + 'static,
    {
        self.shared.output.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, listener: Option<ListenerId>) -> usize {
        self.shared.output.off(kind, listener)
    }

    /// Last resolved payload
    pub fn get(&self) -> Option<T> {
        self.shared.output.get()
    }

    pub fn is_active(&self) -> bool {
        self.shared.output.is_active()
    }

    /// Whether any upstream slot currently holds a lock
    pub fn is_locked(&self) -> bool {
        self.shared.state.borrow().locked_counter > 0
    }

    pub fn locked_count(&self) -> u32 {
        self.shared.state.borrow().locked_counter
    }

    /// Whether an input is cached and waiting for a window
    pub fn is_pending(&self) -> bool {
        self.shared.state.borrow().pending
    }

    pub fn source_count(&self) -> usize {
        self.shared.state.borrow().slots.len()
    }
}

fn pulled<S: 'static, T: 'static>(pull: &Rc<dyn Fn() -> Option<T>>) -> Adapter<S, T> {
    let pull = Rc::clone(pull);
    Rc::new(move |_: Option<&S>| pull())
}

impl<T> Source<T> for Stream<T> {
    fn events(&self) -> &EventHandler<T> {
        &self.shared.output
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Stream")
            .field("sources", &state.slots.len())
            .field("pending", &state.pending)
            .field("locked_counter", &state.locked_counter)
            .field("start_counter", &state.start_counter)
            .finish()
    }
}
