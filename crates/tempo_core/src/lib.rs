//! Tempo Core Runtime
//!
//! Cycle-driven event propagation:
//!
//! - **Scheduler**: pre-tick queue, tick broadcast, dirty queue, end-tick broadcast
//! - **Event Handlers**: typed listeners, forwarding, and lock signals
//! - **Streams**: merge any number of sources into one emission per window
//! - **Observables**: settable leaf values
//! - **Transitions**: multi-cycle sources that lock downstream while moving
//! - **Reductions**: running deltas and totals over one source
//!
//! # Example
//!
//! ```rust
//! use tempo_core::{Event, EventKind, Observable, Scheduler, Stream, Triggers};
//!
//! let scheduler = Scheduler::new();
//! let count = Observable::with_value(&scheduler, 2);
//!
//! let double = |v: i32| Some(v * 2);
//! let doubled = Stream::new(&scheduler, Triggers::new().on_start(double).on_end(double));
//! doubled.subscribe(&count).unwrap();
//! doubled.on(EventKind::Start, |event: &Event<i32>| {
//!     println!("doubled started at {:?}", event.payload());
//! });
//!
//! scheduler.step();
//! assert_eq!(doubled.get(), Some(4));
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod observable;
pub mod reduce;
pub mod scheduler;
pub mod stream;
pub mod topology;
pub mod transition;

pub use config::{EngineConfig, RefirePolicy};
pub use error::{ConfigError, Result, TopologyError};
pub use events::{Event, EventKind, ListenerId};
pub use handler::{EventHandler, Listener, Source};
pub use observable::Observable;
pub use reduce::{Accumulator, Differential};
pub use scheduler::{Diagnostics, Phase, Scheduler, Task, TickKey, TickSignal};
pub use stream::{collapse, Stream, Trigger, Triggers};
pub use topology::{NodeId, Topology};
pub use transition::{Easing, Interpolate, Transition, Transitionable};
