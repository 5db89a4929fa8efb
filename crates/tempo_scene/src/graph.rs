//! Root arena
//!
//! Each root owns the registries an external renderer reads after a cycle:
//! the committed leaf objects, their latest resolved specs, and the leaves
//! whose size changed.

use crate::algebra::LayoutAlgebra;
use crate::node::{Leaf, SceneNode};
use rustc_hash::FxHashMap;
use slotmap::{new_key_type, SlotMap};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tempo_core::{EventHandler, Phase, Scheduler};

new_key_type! {
    /// Identity of a root context in a [`SceneGraph`]
    pub struct RootId;
}

/// Identity of a leaf object, unique within one [`SceneGraph`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Registries belonging to one root
pub struct RootContext<A: LayoutAlgebra> {
    objects: FxHashMap<ObjectId, Leaf<A>>,
    specs: FxHashMap<ObjectId, A::Spec>,
    dirty: Vec<ObjectId>,
    /// Epoch in which each object was last marked dirty
    dirty_epochs: FxHashMap<ObjectId, u64>,
}

impl<A: LayoutAlgebra> RootContext<A> {
    fn new() -> Self {
        Self {
            objects: FxHashMap::default(),
            specs: FxHashMap::default(),
            dirty: Vec::new(),
            dirty_epochs: FxHashMap::default(),
        }
    }

    pub fn object(&self, id: ObjectId) -> Option<&Leaf<A>> {
        self.objects.get(&id)
    }

    pub fn spec(&self, id: ObjectId) -> Option<&A::Spec> {
        self.specs.get(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &Leaf<A>)> {
        self.objects.iter().map(|(id, leaf)| (*id, leaf))
    }

    /// Leaves whose size changed, in the order they were marked
    pub fn dirty(&self) -> &[ObjectId] {
        &self.dirty
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub(crate) fn commit(&mut self, leaf: &Leaf<A>, spec: A::Spec) {
        self.objects.insert(leaf.id(), leaf.clone());
        self.specs.insert(leaf.id(), spec);
    }

    pub(crate) fn replace_spec(&mut self, id: ObjectId, spec: A::Spec) {
        self.specs.insert(id, spec);
    }

    pub(crate) fn remove(&mut self, id: ObjectId) {
        self.objects.remove(&id);
        self.specs.remove(&id);
    }

    /// Returns false if `id` was already marked in `epoch`
    pub(crate) fn mark_dirty(&mut self, id: ObjectId, epoch: u64) -> bool {
        if self.dirty_epochs.insert(id, epoch) == Some(epoch) {
            return false;
        }
        self.dirty.push(id);
        true
    }
}

struct GraphInner<A: LayoutAlgebra> {
    scheduler: Scheduler,
    roots: RefCell<SlotMap<RootId, RootContext<A>>>,
    next_object: Cell<u64>,
}

/// Arena of root contexts plus the factory for nodes and leaves
pub struct SceneGraph<A: LayoutAlgebra> {
    inner: Rc<GraphInner<A>>,
}

impl<A: LayoutAlgebra> Clone for SceneGraph<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A: LayoutAlgebra> SceneGraph<A> {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            inner: Rc::new(GraphInner {
                scheduler: scheduler.clone(),
                roots: RefCell::new(SlotMap::with_key()),
                next_object: Cell::new(0),
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Allocate a root context and return the node at its top.
    ///
    /// The renderer drives the returned node's [`layout`](SceneNode::layout)
    /// and [`size`](SceneNode::size) handlers.
    pub fn create_root(&self) -> SceneNode<A> {
        let root = self.inner.roots.borrow_mut().insert(RootContext::new());
        tracing::debug!(?root, "root created");
        SceneNode::new(self, Some(root))
    }

    /// Drop a root context. Nodes still attached to it stop writing to any
    /// registry.
    pub fn remove_root(&self, root: RootId) -> bool {
        self.inner.roots.borrow_mut().remove(root).is_some()
    }

    /// A node with no root yet, for building composite views before they
    /// are added under a rooted node
    pub fn detached(&self) -> SceneNode<A> {
        SceneNode::new(self, None)
    }

    /// Create a terminal object with a fresh id
    pub fn leaf(&self) -> Leaf<A> {
        let id = self.inner.next_object.get() + 1;
        self.inner.next_object.set(id);
        Leaf::new(ObjectId(id), EventHandler::new(&self.inner.scheduler))
    }

    pub fn contains_root(&self, root: RootId) -> bool {
        self.inner.roots.borrow().contains_key(root)
    }

    pub fn root_count(&self) -> usize {
        self.inner.roots.borrow().len()
    }

    /// Read a root's registries
    pub fn with_root<R>(&self, root: RootId, f: impl FnOnce(&RootContext<A>) -> R) -> Option<R> {
        self.inner.roots.borrow().get(root).map(f)
    }

    pub(crate) fn with_root_mut<R>(
        &self,
        root: RootId,
        f: impl FnOnce(&mut RootContext<A>) -> R,
    ) -> Option<R> {
        self.inner.roots.borrow_mut().get_mut(root).map(f)
    }

    /// Latest resolved spec for `object` under `root`
    pub fn spec(&self, root: RootId, object: ObjectId) -> Option<A::Spec> {
        self.with_root(root, |ctx| ctx.spec(object).cloned()).flatten()
    }

    /// Committed objects under `root`, sorted by id
    pub fn object_ids(&self, root: RootId) -> Vec<ObjectId> {
        let mut ids = self
            .with_root(root, |ctx| ctx.objects.keys().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Dirty marks are deduplicated per epoch. Each cycle is one epoch and
    /// so is each idle gap between cycles.
    pub(crate) fn dirty_epoch(&self) -> u64 {
        let scheduler = &self.inner.scheduler;
        scheduler.frame() * 2 + u64::from(scheduler.phase() != Phase::Idle)
    }

    /// Hand the dirty list to the caller and start a fresh one
    pub fn take_dirty(&self, root: RootId) -> Vec<ObjectId> {
        self.with_root_mut(root, |ctx| {
            ctx.dirty_epochs.clear();
            std::mem::take(&mut ctx.dirty)
        })
        .unwrap_or_default()
    }
}

impl<A: LayoutAlgebra> fmt::Debug for SceneGraph<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneGraph")
            .field("roots", &self.root_count())
            .field("objects_created", &self.inner.next_object.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Offsets;

    #[test]
    fn test_roots_are_independent() {
        let scheduler = Scheduler::new();
        let graph = SceneGraph::<Offsets>::new(&scheduler);
        let a = graph.create_root();
        let b = graph.create_root();

        let (Some(ra), Some(rb)) = (a.root(), b.root()) else {
            panic!("roots must be assigned");
        };
        assert_ne!(ra, rb);
        assert_eq!(graph.root_count(), 2);

        let leaf = graph.leaf();
        graph.with_root_mut(ra, |ctx| ctx.commit(&leaf, 3));
        assert_eq!(graph.object_ids(ra), vec![leaf.id()]);
        assert!(graph.object_ids(rb).is_empty());

        assert!(graph.remove_root(ra));
        assert_eq!(graph.spec(ra, leaf.id()), None);
    }

    #[test]
    fn test_dirty_epoch_changes_when_cycle_ends() {
        let scheduler = Scheduler::new();
        let graph = SceneGraph::<Offsets>::new(&scheduler);
        assert_eq!(graph.dirty_epoch(), 0);

        let during = Rc::new(Cell::new(0));
        let (g, d) = (graph.clone(), during.clone());
        scheduler.defer_pre_tick(move || d.set(g.dirty_epoch()));
        scheduler.step();

        assert_eq!(during.get(), 3);
        assert_eq!(graph.dirty_epoch(), 2);
        assert_ne!(during.get(), graph.dirty_epoch());
    }

    #[test]
    fn test_dirty_marks_once_per_epoch() {
        let mut ctx = RootContext::<Offsets>::new();
        let id = ObjectId(1);

        assert!(ctx.mark_dirty(id, 1));
        assert!(!ctx.mark_dirty(id, 1));
        assert!(ctx.mark_dirty(id, 2));
        assert_eq!(ctx.dirty(), &[id, id]);
    }

    #[test]
    fn test_take_dirty_resets() {
        let scheduler = Scheduler::new();
        let graph = SceneGraph::<Offsets>::new(&scheduler);
        let node = graph.create_root();
        let Some(root) = node.root() else {
            panic!("root must be assigned");
        };
        let leaf = graph.leaf();

        graph.with_root_mut(root, |ctx| ctx.mark_dirty(leaf.id(), 0));
        assert_eq!(graph.take_dirty(root), vec![leaf.id()]);
        assert!(graph.take_dirty(root).is_empty());

        graph.with_root_mut(root, |ctx| ctx.mark_dirty(leaf.id(), 0));
        assert_eq!(graph.take_dirty(root), vec![leaf.id()]);
    }

    #[test]
    fn test_leaf_ids_are_unique() {
        let scheduler = Scheduler::new();
        let graph = SceneGraph::<Offsets>::new(&scheduler);
        let a = graph.leaf();
        let b = graph.leaf();
        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
    }
}
