//! Continuation objects: owning handles, weak self views, and slot state.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::driver::Mode;
use crate::error::ContinuationError;
use crate::fiber::ResumeToken;
use crate::ids::ContId;
use crate::protocol::{self, Request, NON_EMPTY_START};
use crate::value::{Args, Kwargs, Value};

/// Signature of a continuation's entry function. The first argument is the
/// continuation itself.
pub type EntryFn = dyn Fn(&ContinuationRef, &Args, &Kwargs) -> Result<Value, ContinuationError>;

/// Entry function plus the arguments captured at init time.
#[derive(Clone)]
pub(crate) struct Entry {
    func: Rc<EntryFn>,
    args: Args,
    kwargs: Kwargs,
}

/// Detached start capability of a continuation, carried by a `Start` token.
pub(crate) struct StartThunk {
    pub(crate) id: ContId,
    pub(crate) owner: Weak<Shared>,
    entry: Entry,
}

impl StartThunk {
    /// Run the entry on the current (fresh) stack and package its outcome.
    pub(crate) fn run(self, first: Mode) -> Mode {
        let StartThunk { id, owner, entry } = self;
        let _finish = FinishGuard(owner.clone());
        let this = ContinuationRef(owner);
        let result = match first {
            Mode::Throw(err) => {
                log::debug!("continuation {id} received a throw before it started");
                Err(err)
            }
            first if first.carries_value() => Err(ContinuationError::protocol(NON_EMPTY_START)),
            Mode::Deliver(_) => (entry.func)(&this, &entry.args, &entry.kwargs),
        };
        Mode::package(result)
    }
}

/// Marks the owning continuation finished however the entry leaves its
/// stack: return, error, panic, or disposal.
struct FinishGuard(Weak<Shared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.0.upgrade() {
            shared.mark_finished();
        }
    }
}

enum Slot {
    Uninit,
    NotStarted(Entry),
    Suspended(ResumeToken),
    /// Token already handed out on finish.
    Vacant,
}

/// Observable lifecycle state of a continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninit,
    NotStarted,
    /// Started and not finished. A running continuation also reports this,
    /// since its slot holds whoever resumed it.
    Suspended,
    Finished,
}

pub(crate) struct Shared {
    pub(crate) id: ContId,
    slot: RefCell<Slot>,
    finished: Cell<bool>,
}

impl Shared {
    fn new(slot: Slot) -> Rc<Self> {
        Rc::new(Shared {
            id: ContId::fresh(),
            slot: RefCell::new(slot),
            finished: Cell::new(false),
        })
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.set(true);
    }

    /// Store `incoming` in the slot and return the token it displaces. A
    /// not-started entry is returned as a `Start` token.
    pub(crate) fn swap_in(self: &Rc<Self>, incoming: ResumeToken) -> Option<ResumeToken> {
        let displaced = self.slot.replace(Slot::Suspended(incoming));
        match displaced {
            Slot::NotStarted(entry) => Some(ResumeToken::Start(StartThunk {
                id: self.id,
                owner: Rc::downgrade(self),
                entry,
            })),
            Slot::Suspended(token) => Some(token),
            Slot::Uninit | Slot::Vacant => None,
        }
    }

    /// Take the token a finished continuation returns to.
    pub(crate) fn take_for_finish(&self) -> Option<ResumeToken> {
        match self.slot.replace(Slot::Vacant) {
            Slot::Suspended(token) => Some(token),
            Slot::Vacant => None,
            other => {
                // Nothing was parked here; leave the slot as it was.
                self.slot.replace(other);
                None
            }
        }
    }

    /// Release the token of a continuation left behind by a driver run that
    /// unwound: one whose stack already finished, or one waiting to return
    /// to that run's host flow. Such a continuation is finished from now on.
    pub(crate) fn release_stranded(&self, run: u64) -> Option<ResumeToken> {
        let waits_on_run = matches!(
            self.slot.try_borrow().as_deref(),
            Ok(Slot::Suspended(ResumeToken::Host(parked))) if *parked == run
        );
        if !self.finished.get() && !waits_on_run {
            return None;
        }
        self.mark_finished();
        self.take_for_finish()
    }

    fn state(&self) -> State {
        if self.finished.get() {
            return State::Finished;
        }
        match self.slot.try_borrow() {
            Ok(slot) => match &*slot {
                Slot::Uninit => State::Uninit,
                Slot::NotStarted(_) => State::NotStarted,
                Slot::Suspended(_) => State::Suspended,
                Slot::Vacant => State::Finished,
            },
            Err(_) => State::Suspended,
        }
    }
}

/// Owning handle to a continuation object.
///
/// Cloning is cheap and yields another handle to the same object. When the
/// last owning handle goes away while the continuation is suspended, its
/// native stack is disposed.
#[derive(Clone)]
pub struct Continuation(Rc<Shared>);

impl Continuation {
    /// Allocate an object with no entry. It reports `is_pending() == false`
    /// until [`Continuation::init`] is called.
    pub fn uninit() -> Self {
        Continuation(Shared::new(Slot::Uninit))
    }

    /// Construct a continuation that will run `entry(self, args, kwargs)` on
    /// its first switch.
    pub fn new<F, A>(entry: F, args: A, kwargs: Kwargs) -> Self
    where
        F: Fn(&ContinuationRef, &Args, &Kwargs) -> Result<Value, ContinuationError> + 'static,
        A: IntoIterator<Item = Value>,
    {
        Continuation(Shared::new(Slot::NotStarted(Entry {
            func: Rc::new(entry),
            args: args.into_iter().collect(),
            kwargs,
        })))
    }

    /// Construct a continuation whose entry takes no arguments.
    pub fn from_fn<F>(entry: F) -> Self
    where
        F: Fn(&ContinuationRef) -> Result<Value, ContinuationError> + 'static,
    {
        Self::new(move |this, _, _| entry(this), [], Kwargs::new())
    }

    /// Give an uninitialised object its entry.
    pub fn init<F, A>(&self, entry: F, args: A, kwargs: Kwargs) -> Result<(), ContinuationError>
    where
        F: Fn(&ContinuationRef, &Args, &Kwargs) -> Result<Value, ContinuationError> + 'static,
        A: IntoIterator<Item = Value>,
    {
        let mut slot = self.0.slot.borrow_mut();
        if !matches!(*slot, Slot::Uninit) {
            return Err(ContinuationError::Reinitialized);
        }
        *slot = Slot::NotStarted(Entry {
            func: Rc::new(entry),
            args: args.into_iter().collect(),
            kwargs,
        });
        Ok(())
    }

    /// Resume this continuation with `value`. Returns whatever the resumed
    /// side next hands back.
    pub fn switch(&self, value: impl Into<Value>) -> Result<Value, ContinuationError> {
        protocol::dispatch(Request::new(self.clone(), None, Mode::Deliver(value.into())))
    }

    /// Switch with redirection: this continuation takes over the caller's
    /// context and `to` is resumed in its place.
    pub fn switch_to(
        &self,
        value: impl Into<Value>,
        to: &Continuation,
    ) -> Result<Value, ContinuationError> {
        protocol::dispatch(Request::new(
            self.clone(),
            Some(to.clone()),
            Mode::Deliver(value.into()),
        ))
    }

    /// Raise `error` at this continuation's suspension point.
    pub fn throw(&self, error: impl Into<ContinuationError>) -> Result<Value, ContinuationError> {
        protocol::dispatch(Request::new(self.clone(), None, Mode::Throw(error.into())))
    }

    pub fn throw_to(
        &self,
        error: impl Into<ContinuationError>,
        to: &Continuation,
    ) -> Result<Value, ContinuationError> {
        protocol::dispatch(Request::new(
            self.clone(),
            Some(to.clone()),
            Mode::Throw(error.into()),
        ))
    }

    /// True iff the continuation has an entry and has not finished.
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), State::NotStarted | State::Suspended)
    }

    pub fn is_initialized(&self) -> bool {
        self.state() != State::Uninit
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state(), State::Suspended | State::Finished)
    }

    pub fn is_finished(&self) -> bool {
        self.state() == State::Finished
    }

    pub fn state(&self) -> State {
        self.0.state()
    }

    pub fn id(&self) -> ContId {
        self.0.id
    }

    pub fn downgrade(&self) -> ContinuationRef {
        ContinuationRef(Rc::downgrade(&self.0))
    }

    pub(crate) fn shared(&self) -> &Rc<Shared> {
        &self.0
    }
}

impl PartialEq for Continuation {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Continuation {}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<continuation {} {:?}>", self.0.id, self.state())
    }
}

/// Non-owning view of a continuation, handed to its entry as `self`.
#[derive(Clone)]
pub struct ContinuationRef(Weak<Shared>);

impl ContinuationRef {
    pub fn upgrade(&self) -> Option<Continuation> {
        self.0.upgrade().map(Continuation)
    }

    pub fn switch(&self, value: impl Into<Value>) -> Result<Value, ContinuationError> {
        self.dispatch(None, Mode::Deliver(value.into()))
    }

    pub fn switch_to(
        &self,
        value: impl Into<Value>,
        to: &Continuation,
    ) -> Result<Value, ContinuationError> {
        self.dispatch(Some(to.clone()), Mode::Deliver(value.into()))
    }

    pub fn throw(&self, error: impl Into<ContinuationError>) -> Result<Value, ContinuationError> {
        self.dispatch(None, Mode::Throw(error.into()))
    }

    pub fn throw_to(
        &self,
        error: impl Into<ContinuationError>,
        to: &Continuation,
    ) -> Result<Value, ContinuationError> {
        self.dispatch(Some(to.clone()), Mode::Throw(error.into()))
    }

    pub fn is_pending(&self) -> bool {
        self.upgrade().is_some_and(|k| k.is_pending())
    }

    // The strong handle moves into the request and off this stack, so a
    // suspended fiber never keeps its own continuation alive.
    fn dispatch(&self, to: Option<Continuation>, mode: Mode) -> Result<Value, ContinuationError> {
        let subject = self
            .upgrade()
            .ok_or_else(|| ContinuationError::protocol("continuation was dropped"))?;
        protocol::dispatch(Request::new(subject, to, mode))
    }
}

impl fmt::Debug for ContinuationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(k) => write!(f, "{k:?}"),
            None => write!(f, "<continuation dropped>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_entry(_: &ContinuationRef, _: &Args, _: &Kwargs) -> Result<Value, ContinuationError> {
        Ok(Value::None)
    }

    #[test]
    fn test_uninit_then_init() {
        let k = Continuation::uninit();
        assert_eq!(k.state(), State::Uninit);
        assert!(!k.is_pending());

        k.init(ok_entry, [], Kwargs::new()).unwrap();
        assert_eq!(k.state(), State::NotStarted);
        assert!(k.is_pending());
        assert!(!k.is_started());
    }

    #[test]
    fn test_second_init_is_rejected() {
        let k = Continuation::new(ok_entry, [Value::Int(1)], Kwargs::new());
        let err = k.init(ok_entry, [], Kwargs::new()).unwrap_err();
        assert_eq!(err, ContinuationError::Reinitialized);
        assert_eq!(k.state(), State::NotStarted);
    }

    #[test]
    fn test_identity_equality() {
        let a = Continuation::from_fn(|_| Ok(Value::None));
        let b = Continuation::from_fn(|_| Ok(Value::None));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.downgrade().upgrade(), Some(a));
    }

    #[test]
    fn test_dropped_ref_rejects_switch() {
        let weak = Continuation::from_fn(|_| Ok(Value::None)).downgrade();
        assert!(weak.upgrade().is_none());
        assert!(!weak.is_pending());
        assert!(weak.switch(()).unwrap_err().is_protocol());
        assert!(weak.throw(ContinuationError::Finished).unwrap_err().is_protocol());
    }

    #[test]
    fn test_debug_shows_id_and_state() {
        let k = Continuation::uninit();
        let text = format!("{k:?}");
        assert!(text.starts_with("<continuation #"));
        assert!(text.ends_with("Uninit>"));
    }
}
