//! Host-bridge scenarios: continuations parked on host events.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use continulet::config;
use continulet::{
    Config, Continuation, ContinuationError, Exception, Handoff, HostCall, LocalPoolHost, Mode,
    Value,
};
use futures::channel::oneshot;
use futures::future;
use futures::task::LocalSpawnExt;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_fiber_parks_until_resumed_from_thread() {
    init_logging();
    let c = Continuation::from_fn(|_| {
        let mut call = HostCall::external();
        let resumer = call.resumer().expect("fresh call");
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resumer.resume(40i64)
        });
        let value = call.wait()?;
        assert!(worker.join().expect("worker finished"));
        Ok(Value::Int(value.as_int().unwrap_or(0) + 2))
    });

    assert_eq!(c.switch(()), Ok(Value::Int(42)));
    assert!(c.is_finished());
}

#[test]
fn test_fiber_wait_then_switch_back() {
    let c = Continuation::from_fn(|this| {
        let first = HostCall::new(future::ready(Handoff::value("from host"))).wait()?;
        let second = this.switch(first)?;
        Ok(Value::List(vec![second, Value::from("done")]))
    });

    assert_eq!(c.switch(()), Ok(Value::from("from host")));
    assert_eq!(
        c.switch(7),
        Ok(Value::List(vec![Value::Int(7), Value::from("done")]))
    );
}

#[test]
fn test_resumer_throw_raises_inside_fiber() {
    let c = Continuation::from_fn(|_| {
        let mut call = HostCall::external();
        let resumer = call.resumer().expect("fresh call");
        let _worker = thread::spawn(move || resumer.throw(Exception::new("TimeoutError", "no reply")));
        match call.wait() {
            Err(err) if err.exception().is_some_and(|e| e.is_kind("TimeoutError")) => {
                Ok(Value::from("timed out"))
            }
            other => other,
        }
    });
    assert_eq!(c.switch(()), Ok(Value::from("timed out")));
}

#[test]
fn test_handoff_released_once_when_host_wins_in_fiber() {
    let releases = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&releases);
    let c = Continuation::from_fn(move |_| {
        let counter = Rc::clone(&counter);
        let handoff = Handoff::with_release(Mode::deliver(5i64), move || {
            counter.set(counter.get() + 1)
        });
        let mut call = HostCall::new(future::ready(handoff));
        let resumer = call.resumer().expect("fresh call");
        let value = call.wait()?;
        assert!(!resumer.resume(0i64));
        Ok(value)
    });

    assert_eq!(c.switch(()), Ok(Value::Int(5)));
    assert_eq!(releases.get(), 1);
}

#[test]
fn test_abandoned_call_in_fiber_is_host_dropped() {
    let c = Continuation::from_fn(|_| HostCall::external().wait());
    assert_eq!(c.switch(()), Err(ContinuationError::HostDropped));
}

#[test]
fn test_local_pool_host_drives_spawned_work() {
    init_logging();
    let host = Rc::new(LocalPoolHost::new());
    let previous = config::install(Config::default().with_host(host.clone()));

    let events: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let spawner = host.spawner();
    let seen = Rc::clone(&events);
    let c = Continuation::from_fn(move |_| {
        let (tx, rx) = oneshot::channel::<i64>();
        let task_seen = Rc::clone(&seen);
        spawner
            .spawn_local(async move {
                task_seen.borrow_mut().push("host task ran");
                let _ = tx.send(10);
            })
            .map_err(|err| ContinuationError::protocol(err.to_string()))?;

        seen.borrow_mut().push("fiber parked");
        let value = HostCall::from_result(async move {
            rx.await
                .map(Value::Int)
                .map_err(|_| ContinuationError::HostDropped)
        })
        .wait()?;
        seen.borrow_mut().push("fiber resumed");
        Ok(value)
    });

    assert_eq!(c.switch(()), Ok(Value::Int(10)));
    assert_eq!(
        *events.borrow(),
        ["fiber parked", "host task ran", "fiber resumed"]
    );

    config::install(previous.unwrap_or_default());
}

#[test]
fn test_parked_continuation_can_be_dropped_after_settle() {
    let dropped = Rc::new(Cell::new(false));
    let flag = Rc::clone(&dropped);

    struct Flag(Rc<Cell<bool>>);
    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    let c = Continuation::from_fn(move |this| {
        let _flag = Flag(Rc::clone(&flag));
        let value = HostCall::new(future::ready(Handoff::value(1i64))).wait()?;
        this.switch(value)?;
        Ok(Value::None)
    });

    assert_eq!(c.switch(()), Ok(Value::Int(1)));
    drop(c);
    assert!(dropped.get());
}
