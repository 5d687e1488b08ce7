//! Array object model
//!
//! The PiT mapping state machine, the object store that enforces the
//! array's invariants, and a simulator that serves the store over the
//! command channel.

pub mod model;
pub mod simulator;
pub mod state;

pub use model::{ArrayFault, ArrayModel, NARROW_EXTENT_POOL, SECONDARY_POOL};
pub use simulator::{ArraySimulator, Fault};
pub use state::{next_state, PitEvent, PitMapping, PitState};
