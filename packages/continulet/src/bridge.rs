//! Bridge between parked flows of control and the host async runtime.
//!
//! A [`HostCall`] parks the calling flow until either its [`Resumer`] fires
//! (from any thread) or its host future resolves. The two are raced, and the
//! host runtime blocks the caller until the race settles.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;

use futures::channel::oneshot;
use futures::executor::{self, LocalPool, LocalSpawner};
use futures::future::{self, Either, FutureExt, LocalBoxFuture};

use crate::config;
use crate::driver::Mode;
use crate::error::{ContinuationError, Exception};
use crate::fiber::{self, Suspension};
use crate::value::Value;

/// Deferred payload sent by a [`Resumer`]. It is built on the thread that owns
/// the parked flow, so it may produce values that are not `Send`.
type Wake = Box<dyn FnOnce() -> Result<Value, ContinuationError> + Send>;

thread_local! {
    static JOINING: Cell<bool> = const { Cell::new(false) };
}

/// Disposable wrapper around a result produced by the host side.
///
/// The release hook runs exactly once: when the payload is unwrapped, or
/// when the wrapper is dropped unopened.
pub struct Handoff {
    mode: Mode,
    release: Option<Box<dyn FnOnce()>>,
}

impl Handoff {
    pub fn new(mode: Mode) -> Self {
        Handoff {
            mode,
            release: None,
        }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::new(Mode::Deliver(value.into()))
    }

    pub fn error(error: impl Into<ContinuationError>) -> Self {
        Self::new(Mode::Throw(error.into()))
    }

    pub fn with_release(mode: Mode, release: impl FnOnce() + 'static) -> Self {
        Handoff {
            mode,
            release: Some(Box::new(release)),
        }
    }

    /// Unwrap the payload and release the wrapper.
    pub fn into_mode(mut self) -> Mode {
        let mode = std::mem::replace(&mut self.mode, Mode::Deliver(Value::None));
        self.release_now();
        mode
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("mode", &self.mode)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Winner of a settled race.
#[derive(Debug)]
pub enum Settled {
    /// The explicit resume fired first, or the race itself failed.
    Native(Mode),
    /// The host event resolved first.
    Host(Handoff),
}

impl Settled {
    pub fn into_mode(self) -> Mode {
        match self {
            Settled::Native(mode) => mode,
            Settled::Host(handoff) => handoff.into_mode(),
        }
    }
}

/// One-shot capability that wakes a parked [`HostCall`] from any thread.
pub struct Resumer {
    tx: oneshot::Sender<Wake>,
}

impl Resumer {
    /// Resume with the outcome of `wake`, evaluated on the parked flow's
    /// thread. Returns `false` if the call already settled another way.
    pub fn resume_with<F>(self, wake: F) -> bool
    where
        F: FnOnce() -> Result<Value, ContinuationError> + Send + 'static,
    {
        self.tx.send(Box::new(wake)).is_ok()
    }

    pub fn resume<V>(self, value: V) -> bool
    where
        V: Into<Value> + Send + 'static,
    {
        self.resume_with(move || Ok(value.into()))
    }

    pub fn throw(self, exception: Exception) -> bool {
        self.resume_with(move || Err(ContinuationError::Raised(exception)))
    }

    /// True once the call has settled or been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_canceled()
    }
}

impl fmt::Debug for Resumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resumer")
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

/// A blocking wait on a host event, raced against an explicit resume.
pub struct HostCall {
    event: Option<LocalBoxFuture<'static, Handoff>>,
    resumer: Option<Resumer>,
    wakeup: oneshot::Receiver<Wake>,
}

impl HostCall {
    pub fn new<F>(event: F) -> Self
    where
        F: Future<Output = Handoff> + 'static,
    {
        Self::build(Some(event.boxed_local()))
    }

    pub fn from_result<F>(event: F) -> Self
    where
        F: Future<Output = Result<Value, ContinuationError>> + 'static,
    {
        Self::new(event.map(|result| Handoff::new(Mode::from_result(result))))
    }

    /// A call with no host event: only its resumer can settle it.
    pub fn external() -> Self {
        Self::build(None)
    }

    fn build(event: Option<LocalBoxFuture<'static, Handoff>>) -> Self {
        let (tx, wakeup) = oneshot::channel();
        HostCall {
            event,
            resumer: Some(Resumer { tx }),
            wakeup,
        }
    }

    /// Take the call's resumer. Only the first call returns one.
    pub fn resumer(&mut self) -> Option<Resumer> {
        self.resumer.take()
    }

    /// Park the current flow until the call settles.
    ///
    /// On a continuation stack the fiber suspends and the driver performs the
    /// join; on the host stack the join happens here.
    pub fn wait(self) -> Result<Value, ContinuationError> {
        if fiber::in_fiber() {
            return fiber::suspend(Suspension::Await(self)).into_result();
        }
        let config = config::current();
        self.settle(config.host.as_ref()).into_mode().into_result()
    }

    /// Race and block until settled.
    pub(crate) fn settle(mut self, host: &dyn HostRuntime) -> Settled {
        if JOINING.with(|joining| joining.replace(true)) {
            return Settled::Native(Mode::Throw(ContinuationError::protocol(
                "host call waited on while the host is already blocked on another",
            )));
        }
        let _joining = JoinGuard;
        // An untaken resumer can never fire.
        drop(self.resumer.take());
        host.block_join(race(self.wakeup, self.event))
    }
}

impl fmt::Debug for HostCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCall")
            .field("has_event", &self.event.is_some())
            .field("resumer_taken", &self.resumer.is_none())
            .finish()
    }
}

struct JoinGuard;

impl Drop for JoinGuard {
    fn drop(&mut self) {
        JOINING.with(|joining| joining.set(false));
    }
}

/// Resolve with whichever side settles first and drop the other.
///
/// A resumer dropped without firing leaves the host event as the only
/// participant; when both are gone the call fails with `HostDropped`.
pub(crate) fn race(
    wakeup: oneshot::Receiver<Wake>,
    event: Option<LocalBoxFuture<'static, Handoff>>,
) -> LocalBoxFuture<'static, Settled> {
    async move {
        let Some(event) = event else {
            return match wakeup.await {
                Ok(wake) => Settled::Native(Mode::from_result(wake())),
                Err(oneshot::Canceled) => Settled::Native(Mode::Throw(ContinuationError::HostDropped)),
            };
        };
        match future::select(wakeup, event).await {
            Either::Left((Ok(wake), _event)) => Settled::Native(Mode::from_result(wake())),
            Either::Left((Err(oneshot::Canceled), event)) => Settled::Host(event.await),
            Either::Right((handoff, _wakeup)) => Settled::Host(handoff),
        }
    }
    .boxed_local()
}

/// Host runtime that parks the calling flow until a race settles.
pub trait HostRuntime {
    fn block_join(&self, race: LocalBoxFuture<'_, Settled>) -> Settled;
}

/// Parks the thread with `futures::executor::block_on`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockOnHost;

impl HostRuntime for BlockOnHost {
    fn block_join(&self, race: LocalBoxFuture<'_, Settled>) -> Settled {
        executor::block_on(race)
    }
}

/// Single-threaded host loop. Tasks spawned through [`LocalPoolHost::spawner`]
/// keep running while a flow is parked on a join.
#[derive(Default)]
pub struct LocalPoolHost {
    pool: RefCell<LocalPool>,
}

impl LocalPoolHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawner(&self) -> LocalSpawner {
        self.pool.borrow().spawner()
    }

    /// Run spawned tasks until none can make progress.
    pub fn run_until_stalled(&self) {
        match self.pool.try_borrow_mut() {
            Ok(mut pool) => pool.run_until_stalled(),
            Err(_) => log::warn!("host loop is already running; run_until_stalled ignored"),
        }
    }
}

impl HostRuntime for LocalPoolHost {
    fn block_join(&self, race: LocalBoxFuture<'_, Settled>) -> Settled {
        match self.pool.try_borrow_mut() {
            Ok(mut pool) => pool.run_until(race),
            Err(_) => Settled::Native(Mode::Throw(ContinuationError::protocol(
                "host loop re-entered during a blocking join",
            ))),
        }
    }
}

impl fmt::Debug for LocalPoolHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPoolHost").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn counting_handoff(value: i64, releases: &Rc<Cell<u32>>) -> Handoff {
        let releases = Rc::clone(releases);
        Handoff::with_release(Mode::deliver(value), move || releases.set(releases.get() + 1))
    }

    #[test]
    fn test_handoff_released_once_on_unwrap() {
        let releases = Rc::new(Cell::new(0));
        let mode = counting_handoff(4, &releases).into_mode();
        assert_eq!(mode, Mode::deliver(4i64));
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn test_handoff_released_once_on_drop() {
        let releases = Rc::new(Cell::new(0));
        drop(counting_handoff(4, &releases));
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn test_ready_host_event_settles_call() {
        let releases = Rc::new(Cell::new(0));
        let handoff = counting_handoff(3, &releases);
        let call = HostCall::new(future::ready(handoff));
        assert_eq!(call.wait(), Ok(Value::Int(3)));
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn test_resumer_wins_over_pending_host_event() {
        struct Cancelled(Rc<Cell<bool>>);
        impl Drop for Cancelled {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let cancelled = Rc::new(Cell::new(false));
        let guard = Cancelled(Rc::clone(&cancelled));
        let mut call = HostCall::new(async move {
            let _guard = guard;
            future::pending::<()>().await;
            Handoff::value(0i64)
        });
        let resumer = call.resumer().expect("first take");
        assert!(call.resumer().is_none());
        assert!(resumer.resume(9i64));

        assert_eq!(call.wait(), Ok(Value::Int(9)));
        assert!(cancelled.get());
    }

    #[test]
    fn test_late_resumer_is_rejected() {
        let mut call = HostCall::from_result(future::ready(Ok(Value::from("host"))));
        let resumer = call.resumer().expect("first take");
        assert_eq!(call.wait(), Ok(Value::from("host")));
        assert!(resumer.is_abandoned());
        assert!(!resumer.resume(1i64));
    }

    #[test]
    fn test_dropped_resumer_falls_back_to_host_event() {
        let mut call = HostCall::new(future::ready(Handoff::value("late")));
        drop(call.resumer());
        assert_eq!(call.wait(), Ok(Value::from("late")));
    }

    #[test]
    fn test_external_call_without_resumer_reports_host_dropped() {
        assert_eq!(HostCall::external().wait(), Err(ContinuationError::HostDropped));
    }

    #[test]
    fn test_resumer_throw_surfaces_error() {
        let mut call = HostCall::external();
        let resumer = call.resumer().expect("first take");
        assert!(resumer.throw(Exception::new("TimeoutError", "slow")));
        let err = call.wait().unwrap_err();
        assert!(err.exception().is_some_and(|e| e.is_kind("TimeoutError")));
    }

    #[test]
    fn test_host_error_handoff_is_raised() {
        let call = HostCall::new(future::ready(Handoff::error(ContinuationError::raised(
            "OSError", "closed",
        ))));
        assert_eq!(
            call.wait(),
            Err(ContinuationError::raised("OSError", "closed"))
        );
    }

    #[test]
    fn test_nested_join_is_rejected() {
        let inner = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&inner);
        let call = HostCall::new(async move {
            let nested = HostCall::new(future::ready(Handoff::value(1i64))).wait();
            *slot.borrow_mut() = Some(nested);
            Handoff::value(2i64)
        });
        assert_eq!(call.wait(), Ok(Value::Int(2)));
        let nested = inner.borrow_mut().take().expect("nested wait ran");
        assert!(nested.unwrap_err().is_protocol());
    }

    #[test]
    fn test_local_pool_host_runs_spawned_tasks() {
        use futures::task::LocalSpawnExt;

        let host = LocalPoolHost::new();
        let (tx, rx) = oneshot::channel::<i64>();
        host.spawner()
            .spawn_local(async move {
                let _ = tx.send(21);
            })
            .expect("spawn on local pool");

        let call = HostCall::from_result(async move {
            rx.await
                .map(|n| Value::Int(n * 2))
                .map_err(|_| ContinuationError::HostDropped)
        });
        assert_eq!(call.settle(&host).into_mode(), Mode::deliver(42i64));
    }
}
