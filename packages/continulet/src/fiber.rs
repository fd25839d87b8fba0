//! Native execution contexts backed by stackful generators.
//!
//! A [`Fiber`] owns one suspended native stack. Code running on that stack
//! reaches the driver through a thread-local suspender that is only set while
//! the fiber is the running context.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

use generator::{Gn, LocalGenerator};

use crate::bridge::HostCall;
use crate::continuation::{Shared, StartThunk};
use crate::driver::Mode;
use crate::error::ContinuationError;
use crate::ids::ContId;
use crate::protocol::Request;

type Suspender = dyn FnMut(Suspension) -> Mode;
type SuspenderSlot = Cell<Option<NonNull<Suspender>>>;

thread_local! {
    static SUSPENDER: SuspenderSlot = const { Cell::new(None) };
    static DISPOSING: Cell<usize> = const { Cell::new(0) };
}

/// Why a running fiber handed control back to the driver.
pub(crate) enum Suspension {
    /// The fiber issued a switch or throw.
    Transfer(Request),
    /// The fiber blocked on a host event.
    Await(HostCall),
}

/// Outcome of running a fiber until it stops.
pub(crate) enum Step {
    Suspended(Fiber, Suspension),
    Finished { owner: Weak<Shared>, mode: Mode },
}

enum Yielded {
    Suspended(Suspension),
    Finished(Mode),
}

/// Move-only capability to resume one parked flow of control.
///
/// Exactly one slot (or the driver) holds a given token at any time.
pub(crate) enum ResumeToken {
    /// The host flow parked inside the outermost switch call, tagged with
    /// the driver run that parked it.
    Host(u64),
    Fiber(Fiber),
    /// A continuation's entry that has not begun yet.
    Start(StartThunk),
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeToken::Host(run) => write!(f, "Host(run {run})"),
            ResumeToken::Fiber(fiber) => write!(f, "{fiber:?}"),
            ResumeToken::Start(thunk) => write!(f, "Start({})", thunk.id),
        }
    }
}

pub(crate) struct Fiber {
    id: ContId,
    owner: Weak<Shared>,
    gen: Option<LocalGenerator<'static, Mode, Yielded>>,
    suspender: Rc<SuspenderSlot>,
}

impl Fiber {
    /// Allocate a stack for `thunk` and run it until it first stops.
    pub(crate) fn create_and_run(thunk: StartThunk, first: Mode, stack_size: usize) -> Step {
        let id = thunk.id;
        let owner = thunk.owner.clone();
        let suspender: Rc<SuspenderSlot> = Rc::new(Cell::new(None));
        let published = Rc::clone(&suspender);
        let stack_words = stack_size / std::mem::size_of::<usize>();

        let gen = Gn::<Mode>::new_scoped_opt_local(stack_words, move |mut scope| {
            let mut yield_to_driver = |suspension: Suspension| -> Mode {
                scope.yield_with(Yielded::Suspended(suspension));
                scope.get_yield().unwrap_or_else(|| {
                    Mode::Throw(ContinuationError::protocol("fiber resumed without a payload"))
                })
            };
            let ptr = erase(&mut yield_to_driver);
            published.set(Some(ptr));
            SUSPENDER.with(|slot| slot.set(Some(ptr)));
            drop(published);
            Yielded::Finished(thunk.run(first))
        });

        log::debug!("continuation {id} started on a fresh {stack_size} byte stack");
        Fiber {
            id,
            owner,
            gen: Some(gen),
            suspender,
        }
        .step(None)
    }

    pub(crate) fn resume(self, mode: Mode) -> Step {
        self.step(Some(mode))
    }

    fn step(mut self, mode: Option<Mode>) -> Step {
        let yielded = match self.gen.as_mut() {
            Some(gen) if !gen.is_done() => {
                let _active = Activation::enter(self.suspender.get());
                match mode {
                    None => gen.resume(),
                    Some(mode) => Some(gen.send(mode)),
                }
            }
            _ => None,
        };
        match yielded {
            Some(Yielded::Suspended(suspension)) => Step::Suspended(self, suspension),
            Some(Yielded::Finished(mode)) => Step::Finished {
                owner: self.owner.clone(),
                mode,
            },
            None => Step::Finished {
                owner: self.owner.clone(),
                mode: Mode::Throw(ContinuationError::protocol(
                    "fiber stopped without producing a result",
                )),
            },
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.id)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let Some(gen) = self.gen.take() else {
            return;
        };
        if gen.is_done() {
            return;
        }
        log::debug!("disposing suspended stack of continuation {}", self.id);
        let _disposing = Disposing::enter();
        let _active = Activation::enter(None);
        // Dropping an unfinished generator unwinds its stack.
        drop(gen);
    }
}

/// True when the caller runs on a fiber stack.
pub(crate) fn in_fiber() -> bool {
    SUSPENDER.with(|slot| slot.get().is_some())
}

/// True while a suspended stack is being unwound.
pub(crate) fn is_disposing() -> bool {
    DISPOSING.with(|depth| depth.get() > 0)
}

/// Park the running fiber and hand `suspension` to the driver. Returns the
/// payload the fiber is eventually resumed with.
pub(crate) fn suspend(suspension: Suspension) -> Mode {
    let Some(ptr) = SUSPENDER.with(Cell::get) else {
        return Mode::Throw(ContinuationError::protocol(
            "not running on a continuation stack",
        ));
    };
    // SAFETY: SUSPENDER only holds a pointer while the fiber that owns the
    // closure is the running context, so its frame is live and nothing else
    // borrows it.
    let yield_to_driver = unsafe { &mut *ptr.as_ptr() };
    yield_to_driver(suspension)
}

fn erase<'a>(suspender: &'a mut (dyn FnMut(Suspension) -> Mode + 'a)) -> NonNull<Suspender> {
    let ptr: NonNull<dyn FnMut(Suspension) -> Mode + 'a> = NonNull::from(suspender);
    // SAFETY: only the trait object's lifetime bound changes. The pointer is
    // dereferenced by `suspend` alone, while its fiber is running.
    unsafe {
        std::mem::transmute::<NonNull<dyn FnMut(Suspension) -> Mode + 'a>, NonNull<Suspender>>(ptr)
    }
}

/// Installs a fiber's suspender for the duration of one step.
struct Activation {
    previous: Option<NonNull<Suspender>>,
}

impl Activation {
    fn enter(suspender: Option<NonNull<Suspender>>) -> Self {
        let previous = SUSPENDER.with(|slot| slot.replace(suspender));
        Activation { previous }
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        SUSPENDER.with(|slot| slot.set(self.previous));
    }
}

struct Disposing;

impl Disposing {
    fn enter() -> Self {
        DISPOSING.with(|depth| depth.set(depth.get() + 1));
        Disposing
    }
}

impl Drop for Disposing {
    fn drop(&mut self) {
        DISPOSING.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::Continuation;
    use crate::value::Value;

    #[test]
    fn test_host_is_not_in_fiber() {
        assert!(!in_fiber());
        assert!(!is_disposing());
    }

    #[test]
    fn test_suspend_outside_fiber_is_protocol_error() {
        let mode = suspend(Suspension::Await(HostCall::external()));
        match mode {
            Mode::Throw(err) => assert!(err.is_protocol()),
            Mode::Deliver(_) => panic!("expected a protocol error"),
        }
    }

    #[test]
    fn test_fiber_suspends_and_resumes_with_payload() {
        let c = Continuation::from_fn(|this| {
            assert!(in_fiber());
            let received = this.switch("parked")?;
            assert!(in_fiber());
            Ok(received)
        });
        assert_eq!(c.switch(()), Ok(Value::from("parked")));
        assert!(!in_fiber());
        assert_eq!(c.switch(9i64), Ok(Value::Int(9)));
    }

    #[test]
    fn test_activation_restores_previous() {
        let mut noop = |_: Suspension| Mode::deliver(());
        let ptr = erase(&mut noop);
        {
            let _outer = Activation::enter(Some(ptr));
            assert!(in_fiber());
            {
                let _inner = Activation::enter(None);
                assert!(!in_fiber());
            }
            assert!(in_fiber());
        }
        assert!(!in_fiber());
    }

    #[test]
    fn test_disposing_nests() {
        let outer = Disposing::enter();
        let inner = Disposing::enter();
        drop(inner);
        assert!(is_disposing());
        drop(outer);
        assert!(!is_disposing());
    }
}
