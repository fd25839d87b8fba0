//! continulet: stackful continuations with symmetric switching.
//!
//! A [`Continuation`] runs an entry function on its own native stack. Calling
//! `switch` or `throw` transfers control into it; the continuation hands
//! control back by switching again, and can redirect control to a third
//! continuation with `switch_to`.
//!
//! # Architecture
//!
//! - **Resume tokens**: every parked flow of control (the host, a suspended
//!   fiber, or a not-yet-started entry) is a move-only token held by exactly
//!   one continuation slot
//! - **Driver trampoline**: the host flow that issues a switch runs the
//!   driver, which rotates tokens and steps fibers until its own token
//!   comes back
//! - **Host bridge**: a fiber blocked on a host event is parked while the
//!   configured host runtime races the event against an explicit resume

mod switch_logging;

pub mod bridge;
pub mod config;
pub mod continuation;
pub mod driver;
pub mod error;
mod fiber;
pub mod ids;
mod protocol;
pub mod value;

pub use bridge::{BlockOnHost, Handoff, HostCall, HostRuntime, LocalPoolHost, Resumer, Settled};
pub use config::Config;
pub use continuation::{Continuation, ContinuationRef, EntryFn, State};
pub use driver::Mode;
pub use error::{ContinuationError, Exception, TraceFrame};
pub use ids::ContId;
pub use value::{Args, Kwargs, Value};
