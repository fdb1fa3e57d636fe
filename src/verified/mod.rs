//! Pure functions for replica bookkeeping.
//!
//! These functions encapsulate the deterministic decisions of the engine
//! (how many copies to request, when an operation is satisfied, what a
//! registry update does) so they can be tested independently of the async
//! task and registry code. Randomness is passed in as an explicit `Rng`.
//!
//! # Tiger Style
//!
//! - Pure functions with no side effects
//! - Deterministic given the same inputs and RNG state
//! - Saturating arithmetic on counts

mod bounds;
mod delta;
mod selection;
mod transition;

pub use bounds::*;
pub use delta::*;
pub use selection::*;
pub use transition::*;
