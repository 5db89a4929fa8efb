//! Event handlers
//!
//! [`EventHandler`] is the publish/subscribe primitive every other node is
//! built from. It keeps per-kind listener lists and a list of downstream
//! handlers that receive everything it emits.
//!
//! Subscribing is directional: `downstream.subscribe(&upstream)` makes
//! `downstream` a forwarding target of `upstream`. Lock signals are counted
//! per upstream link, so a handler announces `Lock` once when its first
//! upstream locks and `Unlock` once when its last one releases. Subscribing to
//! a locked upstream, or leaving one, adjusts that count in the same call.

use crate::error::Result;
use crate::events::{Event, EventKind, ListenerId};
use crate::scheduler::Scheduler;
use crate::topology::NodeId;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Listener callback
pub type Listener<T> = Rc<dyn Fn(&Event<T>)>;

/// Anything that exposes an [`EventHandler`] can feed a stream or handler
pub trait Source<T> {
    fn events(&self) -> &EventHandler<T>;
}

struct UpstreamLink<T> {
    source: EventHandler<T>,
    locked: bool,
}

struct HandlerState<T> {
    listeners: FxHashMap<EventKind, SmallVec<[(ListenerId, Listener<T>); 2]>>,
    forwards: SmallVec<[Weak<HandlerShared<T>>; 2]>,
    upstream: SmallVec<[UpstreamLink<T>; 2]>,
    locked_upstream: u32,
    locked: bool,
    active: bool,
    value: Option<T>,
    next_listener: u64,
}

struct HandlerShared<T> {
    id: NodeId,
    scheduler: Scheduler,
    state: RefCell<HandlerState<T>>,
}

impl<T> Drop for HandlerShared<T> {
    fn drop(&mut self) {
        self.scheduler.release_node(self.id);
    }
}

/// Typed publish/subscribe node
pub struct EventHandler<T> {
    shared: Rc<HandlerShared<T>>,
}

impl<T> Clone for EventHandler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: Clone + 'static> EventHandler<T> {
    pub fn new(scheduler: &Scheduler) -> Self {
        let id = scheduler.with_topology(|topology| topology.insert_node());
        Self {
            shared: Rc::new(HandlerShared {
                id,
                scheduler: scheduler.clone(),
                state: RefCell::new(HandlerState {
                    listeners: FxHashMap::default(),
                    forwards: SmallVec::new(),
                    upstream: SmallVec::new(),
                    locked_upstream: 0,
                    locked: false,
                    active: false,
                    value: None,
                    next_listener: 0,
                }),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// Register a listener for `kind`. Listeners run in registration order.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event<T>) + 'static,
    {
        let mut state = self.shared.state.borrow_mut();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Rc::new(listener)));
        id
    }

    /// Remove one listener, or every listener for `kind` when `listener` is
    /// `None`. Returns how many were removed.
    pub fn off(&self, kind: EventKind, listener: Option<ListenerId>) -> usize {
        let mut state = self.shared.state.borrow_mut();
        let Some(list) = state.listeners.get_mut(&kind) else {
            return 0;
        };
        let before = list.len();
        match listener {
            Some(id) => list.retain(|(registered, _)| *registered != id),
            None => list.clear(),
        }
        before - list.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.shared
            .state
            .borrow()
            .listeners
            .get(&kind)
            .map_or(0, |list| list.len())
    }

    /// Invoke the listeners for the event's kind, then forward the event to
    /// every downstream handler.
    pub fn emit(&self, event: Event<T>) {
        let (listeners, forwards) = {
            let mut state = self.shared.state.borrow_mut();
            match &event {
                Event::Start(value) => {
                    state.active = true;
                    state.value = Some(value.clone());
                }
                Event::End(value) => {
                    state.active = false;
                    state.value = Some(value.clone());
                }
                Event::Set(value) | Event::Update(value) => {
                    state.value = Some(value.clone());
                }
                Event::Lock => state.locked = true,
                Event::Unlock => state.locked = false,
            }

            let listeners: SmallVec<[Listener<T>; 4]> = state
                .listeners
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, l)| Rc::clone(l)).collect())
                .unwrap_or_default();

            state.forwards.retain(|weak| weak.strong_count() > 0);
            let forwards: SmallVec<[Rc<HandlerShared<T>>; 4]> =
                state.forwards.iter().filter_map(Weak::upgrade).collect();

            (listeners, forwards)
        };

        for listener in listeners {
            listener(&event);
        }

        let from = self.id();
        for shared in forwards {
            EventHandler { shared }.receive(from, event.clone());
        }
    }

    /// Push an event in as if it came from upstream
    pub fn trigger(&self, event: Event<T>) {
        self.emit(event);
    }

    /// Forward everything `upstream` emits into this handler. Subscribing to
    /// an upstream that is already linked does nothing.
    pub fn subscribe<S>(&self, upstream: &S) -> Result<()>
    where
        S: Source<T> + ?Sized,
    {
        let upstream = upstream.events();
        let (from, to) = (upstream.id(), self.id());
        if self.is_subscribed_to(from) {
            return Ok(());
        }
        self.scheduler()
            .with_topology(|topology| topology.add_edge(from, to))?;

        upstream
            .shared
            .state
            .borrow_mut()
            .forwards
            .push(Rc::downgrade(&self.shared));
        self.shared.state.borrow_mut().upstream.push(UpstreamLink {
            source: upstream.clone(),
            locked: false,
        });
        tracing::debug!(upstream = ?from, downstream = ?to, "handler subscribed");

        if upstream.is_locked() && self.scheduler().config().lock_on_subscribe {
            self.receive(from, Event::Lock);
        }
        Ok(())
    }

    /// Stop forwarding from `upstream`. Returns false if it was never
    /// subscribed.
    pub fn unsubscribe<S>(&self, upstream: &S) -> bool
    where
        S: Source<T> + ?Sized,
    {
        self.detach(upstream.events().id())
    }

    /// Detach from every upstream handler, returning how many were removed
    pub fn unsubscribe_all(&self) -> usize {
        let ids: SmallVec<[NodeId; 4]> = self
            .shared
            .state
            .borrow()
            .upstream
            .iter()
            .map(|link| link.source.id())
            .collect();
        ids.into_iter().filter(|id| self.detach(*id)).count()
    }

    fn detach(&self, from: NodeId) -> bool {
        let link = {
            let mut state = self.shared.state.borrow_mut();
            match state.upstream.iter().position(|l| l.source.id() == from) {
                Some(pos) => state.upstream.remove(pos),
                None => return false,
            }
        };

        {
            let me = Rc::as_ptr(&self.shared);
            let mut upstream = link.source.shared.state.borrow_mut();
            if let Some(pos) = upstream
                .forwards
                .iter()
                .position(|weak| std::ptr::eq(weak.as_ptr(), me))
            {
                upstream.forwards.remove(pos);
            }
        }
        let to = self.id();
        self.scheduler()
            .with_topology(|topology| topology.remove_edge(from, to));
        tracing::debug!(upstream = ?from, downstream = ?to, "handler unsubscribed");

        if link.locked {
            self.release_lock();
        }
        true
    }

    /// An event forwarded from the upstream node `from`
    fn receive(&self, from: NodeId, event: Event<T>) {
        match event {
            Event::Lock => {
                let first = {
                    let mut state = self.shared.state.borrow_mut();
                    let Some(link) = state
                        .upstream
                        .iter_mut()
                        .find(|l| l.source.id() == from && !l.locked)
                    else {
                        return;
                    };
                    link.locked = true;
                    state.locked_upstream += 1;
                    state.locked_upstream == 1
                };
                if first {
                    self.emit(Event::Lock);
                }
            }
            Event::Unlock => {
                let released = {
                    let mut state = self.shared.state.borrow_mut();
                    match state
                        .upstream
                        .iter_mut()
                        .find(|l| l.source.id() == from && l.locked)
                    {
                        Some(link) => {
                            link.locked = false;
                            true
                        }
                        None => false,
                    }
                };
                if released {
                    self.release_lock();
                }
            }
            event => self.emit(event),
        }
    }

    fn release_lock(&self) {
        let last = {
            let mut state = self.shared.state.borrow_mut();
            state.locked_upstream = state.locked_upstream.saturating_sub(1);
            state.locked_upstream == 0
        };
        if last {
            self.emit(Event::Unlock);
        }
    }

    /// Last emitted payload
    pub fn get(&self) -> Option<T> {
        self.shared.state.borrow().value.clone()
    }

    /// Between a `start` and its `end`
    pub fn is_active(&self) -> bool {
        self.shared.state.borrow().active
    }

    /// Whether the last structural signal sent downstream was `lock`
    pub fn is_locked(&self) -> bool {
        self.shared.state.borrow().locked
    }

    fn is_subscribed_to(&self, upstream: NodeId) -> bool {
        self.shared
            .state
            .borrow()
            .upstream
            .iter()
            .any(|link| link.source.id() == upstream)
    }

    pub fn upstream_count(&self) -> usize {
        self.shared.state.borrow().upstream.len()
    }

    pub fn downstream_count(&self) -> usize {
        self.shared
            .state
            .borrow()
            .forwards
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl<T> Source<T> for EventHandler<T> {
    fn events(&self) -> &EventHandler<T> {
        self
    }
}

impl<T> fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("EventHandler")
            .field("id", &self.shared.id)
            .field("upstream", &state.upstream.len())
            .field("forwards", &state.forwards.len())
            .field("locked", &state.locked)
            .field("active", &state.active)
            .finish()
    }
}
