//! Tempo Scene Graph
//!
//! Trees of nodes that turn layout and size streams into per-root
//! registries an external renderer reads after each scheduler cycle.
//!
//! # Example
//!
//! ```rust
//! use tempo_core::{Event, Scheduler};
//! use tempo_scene::{LayoutAlgebra, PlainSpec, SceneGraph};
//!
//! struct Offsets;
//!
//! impl LayoutAlgebra for Offsets {
//!     type Size = i32;
//!     type SizeSpec = i32;
//!     type Spec = i32;
//!     type LayoutSpec = i32;
//!
//!     fn size(spec: &i32, parent: &i32) -> i32 {
//!         parent * spec / 100
//!     }
//!
//!     fn layout(spec: &i32, parent: &i32, _size: Option<&i32>) -> i32 {
//!         parent + spec
//!     }
//! }
//!
//! let scheduler = Scheduler::new();
//! let graph = SceneGraph::<Offsets>::new(&scheduler);
//! let root = graph.create_root();
//!
//! let panel = root.add(PlainSpec::<Offsets>::new()).unwrap();
//! let label = graph.leaf();
//! panel.add(label.clone()).unwrap();
//!
//! root.layout().emit(Event::Start(8));
//! scheduler.step();
//!
//! let id = root.root().unwrap();
//! assert_eq!(graph.spec(id, label.id()), Some(8));
//! ```

pub mod algebra;
pub mod error;
pub mod graph;
pub mod node;

pub use algebra::LayoutAlgebra;
pub use error::{Result, SceneError};
pub use graph::{ObjectId, RootContext, RootId, SceneGraph};
pub use node::{Leaf, PlainSpec, SceneNode, SceneObject};
