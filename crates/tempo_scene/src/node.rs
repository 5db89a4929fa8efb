//! Scene graph nodes
//!
//! A node receives its parent's resolved layout spec and size on two
//! handlers. What it forwards to its own children depends on the object it
//! holds:
//!
//! - a [`PlainSpec`] installs streams that combine the parent's values with
//!   the spec's overrides through the [`LayoutAlgebra`]
//! - a [`Leaf`] is terminal; its layout lifecycle is mirrored into the
//!   root's registries and its size changes mark it dirty
//! - an empty node (a root, or a composite view) forwards what it receives

use crate::algebra::LayoutAlgebra;
use crate::error::{Result, SceneError};
use crate::graph::{ObjectId, RootId, SceneGraph};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use tempo_core::{Event, EventHandler, EventKind, Source, Stream};

/// Terminal object committed into a root's registries
pub struct Leaf<A: LayoutAlgebra> {
    id: ObjectId,
    size: EventHandler<A::Size>,
}

impl<A: LayoutAlgebra> Clone for Leaf<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            size: self.size.clone(),
        }
    }
}

impl<A: LayoutAlgebra> Leaf<A> {
    pub(crate) fn new(id: ObjectId, size: EventHandler<A::Size>) -> Self {
        Self { id, size }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The leaf's resolved size, fed by the node it is attached to
    pub fn size(&self) -> &EventHandler<A::Size> {
        &self.size
    }
}

impl<A: LayoutAlgebra> fmt::Debug for Leaf<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leaf").field("id", &self.id).finish()
    }
}

/// Size and layout overrides for a non-terminal object
pub struct PlainSpec<A: LayoutAlgebra> {
    size: Option<EventHandler<A::SizeSpec>>,
    layout: Option<EventHandler<A::LayoutSpec>>,
}

impl<A: LayoutAlgebra> Default for PlainSpec<A> {
    fn default() -> Self {
        Self {
            size: None,
            layout: None,
        }
    }
}

impl<A: LayoutAlgebra> Clone for PlainSpec<A> {
    fn clone(&self) -> Self {
        Self {
            size: self.size.clone(),
            layout: self.layout.clone(),
        }
    }
}

impl<A: LayoutAlgebra> PlainSpec<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size<S>(mut self, source: &S) -> Self
    where
        S: Source<A::SizeSpec> + ?Sized,
    {
        self.size = Some(source.events().clone());
        self
    }

    pub fn with_layout<S>(mut self, source: &S) -> Self
    where
        S: Source<A::LayoutSpec> + ?Sized,
    {
        self.layout = Some(source.events().clone());
        self
    }
}

/// Anything that can be placed in the scene
pub enum SceneObject<A: LayoutAlgebra> {
    Leaf(Leaf<A>),
    View(SceneNode<A>),
    Spec(PlainSpec<A>),
}

impl<A: LayoutAlgebra> From<Leaf<A>> for SceneObject<A> {
    fn from(leaf: Leaf<A>) -> Self {
        SceneObject::Leaf(leaf)
    }
}

impl<A: LayoutAlgebra> From<SceneNode<A>> for SceneObject<A> {
    fn from(view: SceneNode<A>) -> Self {
        SceneObject::View(view)
    }
}

impl<A: LayoutAlgebra> From<PlainSpec<A>> for SceneObject<A> {
    fn from(spec: PlainSpec<A>) -> Self {
        SceneObject::Spec(spec)
    }
}

struct NodeInner<A: LayoutAlgebra> {
    graph: SceneGraph<A>,
    /// Parent's resolved layout
    layout: EventHandler<A::Spec>,
    /// Parent's resolved size
    size: EventHandler<A::Size>,
    layout_stream: RefCell<Option<Stream<A::Spec>>>,
    size_stream: RefCell<Option<Stream<A::Size>>>,
    leaf: RefCell<Option<Leaf<A>>>,
    root: Cell<Option<RootId>>,
    children: RefCell<Vec<SceneNode<A>>>,
}

/// Handle to a node in the scene tree
pub struct SceneNode<A: LayoutAlgebra> {
    inner: Rc<NodeInner<A>>,
}

impl<A: LayoutAlgebra> Clone for SceneNode<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A: LayoutAlgebra> SceneNode<A> {
    pub(crate) fn new(graph: &SceneGraph<A>, root: Option<RootId>) -> Self {
        let scheduler = graph.scheduler();
        Self {
            inner: Rc::new(NodeInner {
                graph: graph.clone(),
                layout: EventHandler::new(scheduler),
                size: EventHandler::new(scheduler),
                layout_stream: RefCell::new(None),
                size_stream: RefCell::new(None),
                leaf: RefCell::new(None),
                root: Cell::new(root),
                children: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The root this node writes into, once attached
    pub fn root(&self) -> Option<RootId> {
        self.inner.root.get()
    }

    /// Incoming layout spec. On a root node the renderer drives this.
    pub fn layout(&self) -> &EventHandler<A::Spec> {
        &self.inner.layout
    }

    /// Incoming size. On a root node the renderer drives this.
    pub fn size(&self) -> &EventHandler<A::Size> {
        &self.inner.size
    }

    /// What children of this node receive as their layout
    pub fn resolved_layout(&self) -> EventHandler<A::Spec> {
        match &*self.inner.layout_stream.borrow() {
            Some(stream) => stream.events().clone(),
            None => self.inner.layout.clone(),
        }
    }

    /// What children of this node receive as their size
    pub fn resolved_size(&self) -> EventHandler<A::Size> {
        match &*self.inner.size_stream.borrow() {
            Some(stream) => stream.events().clone(),
            None => self.inner.size.clone(),
        }
    }

    pub fn leaf(&self) -> Option<Leaf<A>> {
        self.inner.leaf.borrow().clone()
    }

    pub fn children(&self) -> Vec<SceneNode<A>> {
        self.inner.children.borrow().clone()
    }

    /// Place `object` under this node and return the node that holds it.
    ///
    /// A composite view is grafted as-is and, if this node is rooted, its
    /// whole subtree is attached to this node's root. Leaves and plain specs
    /// get a new child node.
    pub fn add(&self, object: impl Into<SceneObject<A>>) -> Result<SceneNode<A>> {
        let child = match object.into() {
            SceneObject::View(view) => view,
            object => {
                let child = SceneNode::new(&self.inner.graph, self.root());
                child.set(object)?;
                child
            }
        };

        child.inner.layout.subscribe(&self.resolved_layout())?;
        child.inner.size.subscribe(&self.resolved_size())?;
        if let Some(root) = self.root() {
            child.attach(root);
        }
        self.inner.children.borrow_mut().push(child.clone());
        Ok(child)
    }

    /// Give this node its object. Must happen before children are added,
    /// since children subscribe to whatever this node resolves at that time.
    pub fn set(&self, object: impl Into<SceneObject<A>>) -> Result<()> {
        let occupied = self.inner.leaf.borrow().is_some()
            || self.inner.layout_stream.borrow().is_some()
            || !self.inner.children.borrow().is_empty();
        if occupied {
            return Err(SceneError::AlreadySet);
        }

        match object.into() {
            SceneObject::View(_) => Err(SceneError::ViewAsObject),
            SceneObject::Spec(spec) => {
                self.set_spec(spec);
                Ok(())
            }
            SceneObject::Leaf(leaf) => self.set_leaf(leaf),
        }
    }

    fn set_spec(&self, spec: PlainSpec<A>) {
        let scheduler = self.inner.graph.scheduler();

        if let Some(size_override) = &spec.size {
            let stream = Stream::lift2(
                scheduler,
                |spec: Option<A::SizeSpec>, parent: Option<A::Size>| match spec {
                    Some(spec) => Some(A::size(&spec, &parent?)),
                    None => parent,
                },
                size_override,
                &self.inner.size,
            );
            *self.inner.size_stream.borrow_mut() = Some(stream);
        }

        let size = self.resolved_size();
        // No parent spec yet means the input is not ready, not an error
        let stream = match &spec.layout {
            Some(layout_override) => Stream::lift3(
                scheduler,
                |spec: Option<A::LayoutSpec>, parent: Option<A::Spec>, size: Option<A::Size>| {
                    let parent = parent?;
                    Some(match spec {
                        Some(spec) => A::layout(&spec, &parent, size.as_ref()),
                        None => parent,
                    })
                },
                layout_override,
                &self.inner.layout,
                &size,
            ),
            None => Stream::lift2(
                scheduler,
                |parent: Option<A::Spec>, _size: Option<A::Size>| parent,
                &self.inner.layout,
                &size,
            ),
        };
        *self.inner.layout_stream.borrow_mut() = Some(stream);
    }

    fn set_leaf(&self, leaf: Leaf<A>) -> Result<()> {
        leaf.size().subscribe(&self.resolved_size())?;
        let weak = Rc::downgrade(&self.inner);

        for kind in EventKind::VALUES {
            let node = Weak::clone(&weak);
            let committed = leaf.clone();
            self.inner.layout.on(kind, move |event: &Event<A::Spec>| {
                if let Some(inner) = node.upgrade() {
                    SceneNode { inner }.commit(&committed, event);
                }
            });

            let node = Weak::clone(&weak);
            let id = leaf.id();
            leaf.size().on(kind, move |_: &Event<A::Size>| {
                if let Some(inner) = node.upgrade() {
                    SceneNode { inner }.mark_dirty(id);
                }
            });
        }

        *self.inner.leaf.borrow_mut() = Some(leaf);
        Ok(())
    }

    /// Mirror a leaf's layout lifecycle into the root registries
    fn commit(&self, leaf: &Leaf<A>, event: &Event<A::Spec>) {
        let id = leaf.id();
        let Some(root) = self.root() else {
            tracing::warn!(object = ?id, kind = %event.kind(), "layout on unrooted leaf dropped");
            return;
        };

        let written = self.inner.graph.with_root_mut(root, |ctx| match event {
            Event::Start(spec) | Event::Set(spec) => ctx.commit(leaf, spec.clone()),
            Event::Update(spec) => ctx.replace_spec(id, spec.clone()),
            Event::End(_) => ctx.remove(id),
            Event::Lock | Event::Unlock => {}
        });
        if written.is_none() {
            tracing::warn!(?root, object = ?id, "layout for removed root dropped");
        } else {
            tracing::trace!(?root, object = ?id, kind = %event.kind(), "registry updated");
        }
    }

    fn mark_dirty(&self, id: ObjectId) {
        let Some(root) = self.root() else {
            tracing::warn!(object = ?id, "resize on unrooted leaf dropped");
            return;
        };
        let epoch = self.inner.graph.dirty_epoch();
        if let Some(true) = self
            .inner
            .graph
            .with_root_mut(root, |ctx| ctx.mark_dirty(id, epoch))
        {
            tracing::trace!(?root, object = ?id, epoch, "leaf marked dirty");
        }
    }

    /// Assign `root` to this node and every node below it
    fn attach(&self, root: RootId) {
        let mut stack = vec![self.clone()];
        let mut attached = 0usize;
        while let Some(node) = stack.pop() {
            node.inner.root.set(Some(root));
            attached += 1;
            stack.extend(node.inner.children.borrow().iter().cloned());
        }
        tracing::debug!(?root, nodes = attached, "subtree attached");
    }
}

impl<A: LayoutAlgebra> fmt::Debug for SceneNode<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneNode")
            .field("root", &self.root())
            .field("leaf", &self.inner.leaf.borrow().as_ref().map(Leaf::id))
            .field("children", &self.inner.children.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Offsets;
    use tempo_core::{Observable, Scheduler, TopologyError};

    type Spec = PlainSpec<Offsets>;

    fn setup() -> (Scheduler, SceneGraph<Offsets>, SceneNode<Offsets>, RootId) {
        let scheduler = Scheduler::new();
        let graph = SceneGraph::new(&scheduler);
        let root = graph.create_root();
        let Some(id) = root.root() else {
            panic!("root node must be rooted");
        };
        (scheduler, graph, root, id)
    }

    #[test]
    fn test_leaf_registry_follows_lifecycle() {
        let (scheduler, graph, root, id) = setup();
        let offset = EventHandler::new(&scheduler);
        let panel = root.add(Spec::new().with_layout(&offset)).unwrap();
        let leaf = graph.leaf();
        panel.add(leaf.clone()).unwrap();

        offset.emit(Event::Set(10));
        root.layout().emit(Event::Start(100));
        scheduler.step();
        assert_eq!(graph.spec(id, leaf.id()), Some(110));
        assert_eq!(graph.object_ids(id), vec![leaf.id()]);

        root.layout().emit(Event::Update(200));
        scheduler.step();
        assert_eq!(graph.spec(id, leaf.id()), Some(210));

        root.layout().emit(Event::End(200));
        scheduler.step();
        assert_eq!(graph.spec(id, leaf.id()), None);
        assert!(graph.object_ids(id).is_empty());
    }

    #[test]
    fn test_layout_waits_for_parent_spec() {
        let (scheduler, graph, root, id) = setup();
        let offset = Observable::with_value(&scheduler, 5);
        let panel = root.add(Spec::new().with_layout(&offset)).unwrap();
        let leaf = graph.leaf();
        panel.add(leaf.clone()).unwrap();

        scheduler.step();
        assert_eq!(graph.spec(id, leaf.id()), None);
        assert!(panel.resolved_layout().get().is_none());
    }

    #[test]
    fn test_resize_marks_dirty_once_per_cycle() {
        let (scheduler, graph, root, id) = setup();
        let panel = root.add(Spec::new()).unwrap();
        let leaf = graph.leaf();
        panel.add(leaf.clone()).unwrap();

        root.size().emit(Event::Set(50));
        root.size().emit(Event::Set(60));
        assert_eq!(graph.with_root(id, |ctx| ctx.dirty().to_vec()), Some(vec![leaf.id()]));

        scheduler.step();
        root.size().emit(Event::Set(70));
        assert_eq!(graph.take_dirty(id), vec![leaf.id(), leaf.id()]);
        assert_eq!(leaf.size().get(), Some(70));
    }

    #[test]
    fn test_resize_after_cycle_is_a_new_mark() {
        let (scheduler, graph, root, id) = setup();
        let leaf = graph.leaf();
        root.add(leaf.clone()).unwrap();

        let size = root.size().clone();
        scheduler.defer_pre_tick(move || size.emit(Event::Start(10)));
        scheduler.step();
        root.size().emit(Event::Update(20));

        assert_eq!(graph.take_dirty(id), vec![leaf.id(), leaf.id()]);
    }

    #[test]
    fn test_size_override_scales_parent() {
        let (scheduler, graph, root, _) = setup();
        let scale = EventHandler::new(&scheduler);
        let half = root.add(Spec::new().with_size(&scale)).unwrap();
        let leaf = graph.leaf();
        half.add(leaf.clone()).unwrap();

        scale.emit(Event::Set(50));
        root.size().emit(Event::Start(200));
        assert_eq!(leaf.size().get(), None);

        scheduler.step();
        assert_eq!(leaf.size().get(), Some(100));
    }

    #[test]
    fn test_detached_view_attaches_on_add() {
        let (_scheduler, graph, root, id) = setup();
        let view = graph.detached();
        let leaf = graph.leaf();
        let holder = view.add(leaf.clone()).unwrap();
        assert_eq!(holder.root(), None);

        root.layout().emit(Event::Start(1));
        assert!(graph.object_ids(id).is_empty());

        root.add(view.clone()).unwrap();
        assert_eq!(view.root(), Some(id));
        assert_eq!(holder.root(), Some(id));

        root.layout().emit(Event::Start(5));
        assert_eq!(graph.spec(id, leaf.id()), Some(5));
        assert_eq!(holder.leaf().map(|l| l.id()), Some(leaf.id()));
    }

    #[test]
    fn test_set_rejects_views_and_reassignment() {
        let (_scheduler, graph, root, _) = setup();
        let node = graph.detached();
        assert_eq!(node.set(graph.detached()), Err(SceneError::ViewAsObject));

        node.set(Spec::new()).unwrap();
        assert_eq!(node.set(graph.leaf()), Err(SceneError::AlreadySet));

        assert_eq!(root.children().len(), 0);
    }

    #[test]
    fn test_adding_node_under_itself_fails() {
        let (_scheduler, _graph, root, _) = setup();
        let err = root.add(root.clone()).unwrap_err();
        assert!(matches!(
            err,
            SceneError::Topology(TopologyError::SelfLoop(_))
        ));
        assert!(root.children().is_empty());
    }

    #[test]
    fn test_removed_root_drops_writes() {
        let (_scheduler, graph, root, id) = setup();
        let leaf = graph.leaf();
        root.add(leaf.clone()).unwrap();

        assert!(graph.remove_root(id));
        root.layout().emit(Event::Start(1));
        root.size().emit(Event::Set(1));
        assert!(graph.object_ids(id).is_empty());
        assert!(graph.take_dirty(id).is_empty());
    }
}
