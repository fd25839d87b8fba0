//! Switch protocol: target resolution, validation, and resume-token rotation.

use std::fmt;

use crate::continuation::Continuation;
use crate::driver::{Driver, Mode};
use crate::error::ContinuationError;
use crate::fiber::{self, ResumeToken, Suspension};
use crate::value::Value;

pub(crate) const NON_EMPTY_START: &str =
    "can't send non-None value to a just-started continuation";

/// A single switch or throw call, in flight.
pub(crate) struct Request {
    pub(crate) subject: Continuation,
    pub(crate) to: Option<Continuation>,
    pub(crate) mode: Mode,
}

impl Request {
    pub(crate) fn new(subject: Continuation, to: Option<Continuation>, mode: Mode) -> Self {
        Request { subject, to, mode }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?}", self.mode.kind(), self.subject)?;
        if let Some(to) = &self.to {
            write!(f, ", to={to:?}")?;
        }
        write!(f, ")")
    }
}

/// Entry point for every switch and throw.
///
/// On a fiber stack the request is handed to the driver by suspending; on the
/// host stack this call runs the driver itself.
pub(crate) fn dispatch(request: Request) -> Result<Value, ContinuationError> {
    if fiber::is_disposing() {
        return Err(ContinuationError::protocol(
            "cannot switch while a suspended continuation is being disposed",
        ));
    }
    if fiber::in_fiber() {
        return fiber::suspend(Suspension::Transfer(request)).into_result();
    }
    Driver::run(request)
}

/// Apply `request`, issued by the context `current`, and return the token to
/// run next with its payload.
///
/// Every started continuation holds exactly one token. A plain switch swaps
/// `current` with the subject's token; a redirected switch rotates three
/// ways: `current` into the subject, the subject's old token into `to`, and
/// `to`'s old token runs. A rejected request hands the error back to
/// `current` without touching any slot. `None` means no token is left to run.
pub(crate) fn rotate(current: ResumeToken, request: Request) -> Option<(ResumeToken, Mode)> {
    let Request { subject, to, mode } = request;
    let to = to.filter(Continuation::is_initialized);

    let (subject, to) = match (subject.is_initialized(), to) {
        (true, to) => (subject, to),
        (false, Some(to)) => (to, None),
        (false, None) => return Some((current, mode)),
    };
    if to.as_ref() == Some(&subject) {
        return Some((current, mode));
    }
    if let Err(err) = validate(&subject, to.as_ref(), &mode) {
        crate::switch_debug_log!("rejected {} on {:?}: {}", mode.kind(), subject, err);
        return Some((current, Mode::Throw(err)));
    }

    crate::switch_debug_log!("{:?} -> {:?} (to={:?})", current, subject, to);
    let displaced = subject.shared().swap_in(current)?;
    match to {
        None => Some((displaced, mode)),
        Some(to) => {
            log::debug!(
                "continuation {} redirected to continuation {}",
                subject.id(),
                to.id()
            );
            let next = to.shared().swap_in(displaced)?;
            Some((next, mode))
        }
    }
}

fn validate(
    subject: &Continuation,
    to: Option<&Continuation>,
    mode: &Mode,
) -> Result<(), ContinuationError> {
    if subject.is_finished() || to.is_some_and(Continuation::is_finished) {
        return Err(ContinuationError::Finished);
    }
    let resumed = to.unwrap_or(subject);
    if !resumed.is_started() && mode.carries_value() {
        return Err(ContinuationError::protocol(NON_EMPTY_START));
    }
    Ok(())
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
