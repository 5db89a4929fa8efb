//! Tick scheduler
//!
//! Drives time forward in ordered phases. One call to [`Scheduler::step`] is
//! one cycle:
//!
//! 1. the pre-tick queue is drained (e.g. an observable's `start`)
//! 2. `Tick` is broadcast to every tick registration
//! 3. the dirty queue is drained (e.g. an observable's `end`)
//! 4. `EndTick` is broadcast so streams settle and reset per-cycle state
//!
//! The pre-tick and dirty queues hold one-shot tasks and are emptied by the
//! scheduler. Tick registrations persist across cycles until their owner
//! removes them with [`Scheduler::off_tick`].

use crate::config::EngineConfig;
use crate::topology::{NodeId, Topology};
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

new_key_type! {
    /// Registration on the tick queue
    pub struct TickKey;
}

/// One-shot deferred work
pub type Task = Box<dyn FnOnce()>;

type TickCallback = Rc<dyn Fn(TickSignal)>;

/// Where the scheduler currently is within a cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    PreTick,
    Tick,
    PostTick,
    EndTick,
}

/// Signals broadcast to tick registrations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TickSignal {
    /// Dataflow resolution pass
    Tick,
    /// Settle late events and reset per-cycle state
    EndTick,
}

/// Counters for scheduler-invariant violations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Completed cycles
    pub cycles: u64,
    /// Streams that resolved more than once in a single window
    pub refires: u64,
}

struct SchedulerInner {
    config: EngineConfig,
    pre_tick: RefCell<VecDeque<Task>>,
    dirty: RefCell<VecDeque<Task>>,
    tick_callbacks: RefCell<SlotMap<TickKey, TickCallback>>,
    /// Registration order; slotmap iteration order is not insertion order
    tick_order: RefCell<Vec<TickKey>>,
    phase: Cell<Phase>,
    frame: Cell<u64>,
    diagnostics: Cell<Diagnostics>,
    topology: RefCell<Topology>,
}

/// Shared handle to one scheduler instance.
///
/// Cloning is cheap and yields a handle to the same queues. Handlers and
/// streams keep a clone so that tests can run any number of independent
/// schedulers side by side.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                config,
                pre_tick: RefCell::new(VecDeque::new()),
                dirty: RefCell::new(VecDeque::new()),
                tick_callbacks: RefCell::new(SlotMap::with_key()),
                tick_order: RefCell::new(Vec::new()),
                phase: Cell::new(Phase::Idle),
                frame: Cell::new(0),
                diagnostics: Cell::new(Diagnostics::default()),
                topology: RefCell::new(Topology::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase.get()
    }

    /// Number of cycles started so far
    pub fn frame(&self) -> u64 {
        self.inner.frame.get()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.inner.diagnostics.get()
    }

    /// Queue work for the pre-tick phase of the next cycle
    pub fn defer_pre_tick<F: FnOnce() + 'static>(&self, task: F) {
        self.inner.pre_tick.borrow_mut().push_back(Box::new(task));
    }

    /// Queue work for the dirty phase. Tasks queued during a cycle's
    /// pre-tick or tick phase run later in that same cycle.
    pub fn defer_dirty<F: FnOnce() + 'static>(&self, task: F) {
        self.inner.dirty.borrow_mut().push_back(Box::new(task));
    }

    /// Register a callback that receives every tick signal until removed
    pub fn on_tick<F: Fn(TickSignal) + 'static>(&self, callback: F) -> TickKey {
        let key = self
            .inner
            .tick_callbacks
            .borrow_mut()
            .insert(Rc::new(callback));
        self.inner.tick_order.borrow_mut().push(key);
        key
    }

    pub fn off_tick(&self, key: TickKey) -> bool {
        let removed = self.inner.tick_callbacks.borrow_mut().remove(key).is_some();
        if removed {
            self.inner.tick_order.borrow_mut().retain(|k| *k != key);
        }
        removed
    }

    pub fn tick_registrations(&self) -> usize {
        self.inner.tick_callbacks.borrow().len()
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.pre_tick.borrow().len() + self.inner.dirty.borrow().len()
    }

    /// Run one full cycle and return its frame number
    pub fn step(&self) -> u64 {
        let frame = self.inner.frame.get() + 1;
        self.inner.frame.set(frame);
        let _span = tracing::trace_span!("cycle", frame).entered();

        let pre_tick = self.drain(Phase::PreTick);
        self.broadcast(TickSignal::Tick);
        let dirty = self.drain(Phase::PostTick);
        self.broadcast(TickSignal::EndTick);
        self.inner.phase.set(Phase::Idle);

        let mut diagnostics = self.inner.diagnostics.get();
        diagnostics.cycles += 1;
        self.inner.diagnostics.set(diagnostics);

        tracing::trace!(pre_tick, dirty, "cycle complete");
        frame
    }

    /// Run `cycles` cycles back to back
    pub fn run(&self, cycles: usize) {
        for _ in 0..cycles {
            self.step();
        }
    }

    /// Drain the queue belonging to `phase`, returning how many tasks ran.
    ///
    /// Only `PreTick` and `PostTick` own queues; other phases drain nothing.
    pub fn drain(&self, phase: Phase) -> usize {
        let queue = match phase {
            Phase::PreTick => &self.inner.pre_tick,
            Phase::PostTick => &self.inner.dirty,
            _ => return 0,
        };
        self.inner.phase.set(phase);

        let mut ran = 0;
        loop {
            let task = queue.borrow_mut().pop_front();
            let Some(task) = task else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    /// Deliver `signal` to every tick registration in registration order
    pub fn broadcast(&self, signal: TickSignal) {
        self.inner.phase.set(match signal {
            TickSignal::Tick => Phase::Tick,
            TickSignal::EndTick => Phase::EndTick,
        });

        let callbacks: SmallVec<[TickCallback; 16]> = {
            let registered = self.inner.tick_callbacks.borrow();
            self.inner
                .tick_order
                .borrow()
                .iter()
                .filter_map(|key| registered.get(*key).cloned())
                .collect()
        };

        for callback in callbacks {
            callback(signal);
        }
    }

    /// Drop every queued task. Tick registrations are left in place.
    pub fn reset(&self) {
        let dropped = self.pending_tasks();
        self.inner.pre_tick.borrow_mut().clear();
        self.inner.dirty.borrow_mut().clear();
        self.inner.phase.set(Phase::Idle);
        tracing::debug!(dropped, "scheduler reset");
    }

    /// Whether events emitted by `upstream` can reach `downstream`
    pub fn is_upstream_of(&self, upstream: NodeId, downstream: NodeId) -> bool {
        self.inner.topology.borrow().reaches(upstream, downstream)
    }

    pub(crate) fn record_refire(&self) {
        let mut diagnostics = self.inner.diagnostics.get();
        diagnostics.refires += 1;
        self.inner.diagnostics.set(diagnostics);
    }

    pub(crate) fn with_topology<R>(&self, f: impl FnOnce(&mut Topology) -> R) -> R {
        f(&mut self.inner.topology.borrow_mut())
    }

    /// Node removal runs from `Drop`, which may happen while the topology is
    /// already borrowed further up the stack.
    pub(crate) fn release_node(&self, id: NodeId) {
        match self.inner.topology.try_borrow_mut() {
            Ok(mut topology) => topology.remove_node(id),
            Err(_) => tracing::warn!(?id, "topology busy, node left registered"),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("frame", &self.frame())
            .field("phase", &self.phase())
            .field("pending_tasks", &self.pending_tasks())
            .field("tick_registrations", &self.tick_registrations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        (log, move |entry: &str| sink.borrow_mut().push(entry.to_string()))
    }

    #[test]
    fn test_phase_order() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();

        let p = push.clone();
        scheduler.on_tick(move |signal| p(&format!("{signal:?}")));
        let p = push.clone();
        scheduler.defer_dirty(move || p("dirty"));
        let p = push.clone();
        scheduler.defer_pre_tick(move || p("pre"));

        assert_eq!(scheduler.step(), 1);
        assert_eq!(*log.borrow(), vec!["pre", "Tick", "dirty", "EndTick"]);
        assert_eq!(scheduler.phase(), Phase::Idle);
    }

    #[test]
    fn test_queues_are_cleared_but_tick_registrations_persist() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();

        let p = push.clone();
        scheduler.on_tick(move |signal| {
            if signal == TickSignal::Tick {
                p("tick")
            }
        });
        let p = push.clone();
        scheduler.defer_pre_tick(move || p("pre"));

        scheduler.run(3);
        assert_eq!(*log.borrow(), vec!["pre", "tick", "tick", "tick"]);
        assert_eq!(scheduler.pending_tasks(), 0);
        assert_eq!(scheduler.diagnostics().cycles, 3);
    }

    #[test]
    fn test_tasks_enqueued_while_draining_run_same_cycle() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();

        let inner = scheduler.clone();
        let p = push.clone();
        scheduler.defer_pre_tick(move || {
            p("start");
            let p = p.clone();
            inner.defer_dirty(move || p("end"));
        });

        scheduler.step();
        assert_eq!(*log.borrow(), vec!["start", "end"]);
    }

    #[test]
    fn test_off_tick() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();

        let key = scheduler.on_tick(move |_| push("signal"));
        assert_eq!(scheduler.tick_registrations(), 1);
        assert!(scheduler.off_tick(key));
        assert!(!scheduler.off_tick(key));

        scheduler.step();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_registration_order_survives_removal() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();

        let p = push.clone();
        let first = scheduler.on_tick(move |_| p("a"));
        let p = push.clone();
        scheduler.on_tick(move |_| p("b"));
        scheduler.off_tick(first);
        let p = push.clone();
        scheduler.on_tick(move |_| p("c"));

        scheduler.broadcast(TickSignal::Tick);
        assert_eq!(*log.borrow(), vec!["b", "c"]);
    }

    #[test]
    fn test_reset_drops_tasks() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();

        let p = push.clone();
        scheduler.defer_pre_tick(move || p("pre"));
        scheduler.defer_dirty(move || push("dirty"));
        assert_eq!(scheduler.pending_tasks(), 2);

        scheduler.reset();
        scheduler.step();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_drain_without_queue_is_noop() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.drain(Phase::Tick), 0);
        assert_eq!(scheduler.drain(Phase::Idle), 0);
    }
}
