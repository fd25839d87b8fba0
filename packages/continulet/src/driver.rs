//! Driver loop and the packaged values it moves between execution contexts.
//!
//! The host flow of control that issues a switch runs the driver. The driver
//! keeps rotating resume tokens and stepping fibers until the host's own token
//! comes back around, then hands the packaged result to the caller.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::config::{self, Config};
use crate::continuation::Shared;
use crate::error::ContinuationError;
use crate::fiber::{Fiber, ResumeToken, Step, Suspension};
use crate::ids::ContId;
use crate::protocol::{self, Request};
use crate::value::Value;

/// Packaged payload of a switch (`Deliver`) or throw (`Throw`).
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Deliver(Value),
    Throw(ContinuationError),
}

impl Mode {
    pub fn deliver(value: impl Into<Value>) -> Self {
        Mode::Deliver(value.into())
    }

    pub fn throw(error: impl Into<ContinuationError>) -> Self {
        Mode::Throw(error.into())
    }

    pub fn from_result(result: Result<Value, ContinuationError>) -> Self {
        match result {
            Ok(value) => Mode::Deliver(value),
            Err(err) => Mode::Throw(err),
        }
    }

    /// Package the outcome of an entry function for the trip across the fiber
    /// boundary. Errors pick up the synthetic transfer frame.
    pub(crate) fn package(result: Result<Value, ContinuationError>) -> Self {
        match result {
            Ok(value) => Mode::Deliver(value),
            Err(err) => Mode::Throw(err.with_transfer_frame()),
        }
    }

    /// Unwrap at the resuming site: values are returned, errors are re-raised
    /// with the transfer frame trimmed.
    pub fn into_result(self) -> Result<Value, ContinuationError> {
        match self {
            Mode::Deliver(value) => Ok(value),
            Mode::Throw(err) => Err(err.trim_transfer_frame()),
        }
    }

    pub fn is_deliver(&self) -> bool {
        matches!(self, Mode::Deliver(_))
    }

    pub fn is_throw(&self) -> bool {
        matches!(self, Mode::Throw(_))
    }

    /// A non-empty delivered value; such a payload cannot start a continuation.
    pub fn carries_value(&self) -> bool {
        matches!(self, Mode::Deliver(value) if !value.is_none())
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Mode::Deliver(value) => value.kind(),
            Mode::Throw(_) => "Throw",
        }
    }
}

thread_local! {
    static DRIVING: Cell<bool> = const { Cell::new(false) };
    static NEXT_RUN: Cell<u64> = const { Cell::new(1) };
}

struct DrivingGuard;

impl Drop for DrivingGuard {
    fn drop(&mut self) {
        DRIVING.with(|driving| driving.set(false));
    }
}

/// Trampoline run by the host flow of control for the duration of one
/// switch call.
pub(crate) struct Driver {
    config: Config,
    run: u64,
    step_counter: u64,
    /// Every continuation whose slot this run has touched.
    touched: IndexMap<ContId, Weak<Shared>>,
}

impl Driver {
    pub(crate) fn run(request: Request) -> Result<Value, ContinuationError> {
        if DRIVING.with(|driving| driving.replace(true)) {
            return Err(ContinuationError::protocol(
                "switch re-entered from the host stack while another switch is in progress",
            ));
        }
        let _guard = DrivingGuard;
        let mut driver = Driver {
            config: config::current(),
            run: NEXT_RUN.with(|next| next.replace(next.get().wrapping_add(1))),
            step_counter: 0,
            touched: IndexMap::new(),
        };
        match panic::catch_unwind(AssertUnwindSafe(|| driver.drive(request))) {
            Ok(result) => result,
            Err(payload) => {
                driver.release_stranded();
                panic::resume_unwind(payload)
            }
        }
    }

    fn drive(&mut self, request: Request) -> Result<Value, ContinuationError> {
        self.touch(&request);
        let mut next = protocol::rotate(ResumeToken::Host(self.run), request);
        loop {
            self.step_counter += 1;
            let Some((token, mode)) = next else {
                log::warn!(
                    "switch stalled after {} steps: no resume token left to run",
                    self.step_counter
                );
                return Err(ContinuationError::protocol(
                    "no runnable context left; the host's resume token was dropped",
                ));
            };
            crate::switch_debug_log!(
                "[step {}] run {:?} with {}",
                self.step_counter,
                token,
                mode.kind()
            );
            next = match token {
                ResumeToken::Host(run) if run == self.run => return mode.into_result(),
                ResumeToken::Host(stale) => {
                    log::warn!(
                        "run {} reached the host token of finished run {stale}",
                        self.run
                    );
                    return Err(ContinuationError::protocol(
                        "continuation resumed a host flow that already left its switch",
                    ));
                }
                ResumeToken::Fiber(fiber) => self.advance(fiber.resume(mode)),
                ResumeToken::Start(thunk) => {
                    self.touched.insert(thunk.id, thunk.owner.clone());
                    self.advance(Fiber::create_and_run(thunk, mode, self.config.stack_size))
                }
            };
        }
    }

    fn advance(&mut self, step: Step) -> Option<(ResumeToken, Mode)> {
        match step {
            Step::Suspended(fiber, Suspension::Transfer(request)) => {
                self.touch(&request);
                protocol::rotate(ResumeToken::Fiber(fiber), request)
            }
            Step::Suspended(fiber, Suspension::Await(call)) => {
                crate::switch_debug_log!("[step {}] {:?} parked on host", self.step_counter, fiber);
                let settled = call.settle(self.config.host.as_ref());
                Some((ResumeToken::Fiber(fiber), settled.into_mode()))
            }
            Step::Finished { owner, mode } => finish(&owner, mode),
        }
    }

    fn touch(&mut self, request: &Request) {
        for cont in std::iter::once(&request.subject).chain(request.to.as_ref()) {
            self.touched
                .entry(cont.id())
                .or_insert_with(|| Rc::downgrade(cont.shared()));
        }
    }

    /// After a panic unwound out of `drive`, finish every continuation left
    /// waiting on this run and dispose the stacks parked in finished slots.
    /// Disposal can strand further tokens, so repeat until nothing is freed.
    fn release_stranded(&mut self) {
        loop {
            let released: Vec<ResumeToken> = self
                .touched
                .values()
                .filter_map(Weak::upgrade)
                .filter_map(|shared| shared.release_stranded(self.run))
                .collect();
            if released.is_empty() {
                return;
            }
            log::warn!(
                "run {} unwound; releasing {} stranded resume tokens",
                self.run,
                released.len()
            );
            drop(released);
        }
    }
}

/// Hand a finished entry's outcome to whoever holds its continuation's slot.
fn finish(owner: &Weak<Shared>, mode: Mode) -> Option<(ResumeToken, Mode)> {
    let Some(shared) = owner.upgrade() else {
        log::warn!("continuation finished after its last handle was dropped; result discarded");
        return None;
    };
    shared.mark_finished();
    log::debug!("continuation {} finished with {}", shared.id, mode.kind());
    match shared.take_for_finish() {
        Some(token) => Some((token, mode)),
        None => {
            log::warn!(
                "continuation {} finished with nobody to return to",
                shared.id
            );
            None
        }
    }
}
