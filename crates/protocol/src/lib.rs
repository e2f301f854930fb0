//! Wire types for the tether session gateway.
//!
//! This crate contains the serde-serializable types exchanged between the
//! session runtime and whatever control surface drives it (the bundled daemon,
//! an HTTP front end, a chat bot adapter).
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond validation and (de)serialization
//! * Transport agnostic: Nothing here knows about sockets or files
//! * Stable: Changes only when the control protocol changes
//!
//! Lifecycle logic lives in `tether-runtime`.

pub mod account;
pub mod control;
pub mod event;
pub mod state;

pub use account::*;
pub use control::*;
pub use event::*;
pub use state::*;
