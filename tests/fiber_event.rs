use std::cell::RefCell;
use std::rc::Rc;

use fiber_reactor::{FiberEvent, Scheduler, task};

fn scheduler() -> Scheduler {
    Scheduler::builder()
        .worker_fiber_limit(4)
        .stack_size(64 * 1024)
        .build()
        .unwrap()
}

#[test]
fn test_trigger_before_wait_is_not_lost() {
    let scheduler = scheduler();

    let handle = scheduler
        .schedule(task::from_fn(|cx| {
            let event = FiberEvent::new(cx.select_fiber()).unwrap();
            event.trigger().unwrap();
            event.wait()?;
            Ok(())
        }))
        .unwrap();

    scheduler.process_events().unwrap();

    assert!(handle.is_terminated());
    let stats = scheduler.reactor_stats();
    assert_eq!(stats.register_calls, 1);
    assert_eq!(stats.registered, 0);
}

#[test]
fn test_another_task_wakes_the_waiter() {
    let scheduler = scheduler();
    let slot: Rc<RefCell<Option<Rc<FiberEvent>>>> = Rc::new(RefCell::new(None));
    let trace = Rc::new(RefCell::new(Vec::new()));

    {
        let slot = slot.clone();
        let trace = trace.clone();
        scheduler
            .schedule(task::from_fn(move |cx| {
                let event = Rc::new(FiberEvent::new(cx.select_fiber()).unwrap());
                *slot.borrow_mut() = Some(event.clone());

                trace.borrow_mut().push("waiting");
                event.wait()?;
                trace.borrow_mut().push("woken");
                Ok(())
            }))
            .unwrap();
    }

    {
        let trace = trace.clone();
        scheduler
            .schedule(task::from_fn(move |_| {
                let event = slot.borrow_mut().take().unwrap();
                trace.borrow_mut().push("trigger");
                event.trigger().unwrap();
                Ok(())
            }))
            .unwrap();
    }

    scheduler.event_loop().unwrap();

    assert_eq!(*trace.borrow(), ["waiting", "trigger", "woken"]);
    assert_eq!(scheduler.stats().tasks_completed, 2);
}

#[test]
fn test_cede_keeps_the_registration_hot() {
    let scheduler = scheduler();
    let turns = Rc::new(RefCell::new(Vec::new()));

    for name in ["a", "b"] {
        let turns = turns.clone();
        scheduler
            .schedule(task::from_fn(move |cx| {
                let event = FiberEvent::new(cx.select_fiber()).unwrap();
                for _ in 0..3 {
                    turns.borrow_mut().push(name);
                    event.cede()?;
                }
                Ok(())
            }))
            .unwrap();
    }

    scheduler.event_loop().unwrap();

    assert_eq!(turns.borrow().len(), 6);
    assert_eq!(turns.borrow()[..2], ["a", "b"]);

    // One add per event; every later wait is a refresh.
    let stats = scheduler.reactor_stats();
    assert_eq!(stats.register_calls, 2);
    assert_eq!(stats.refresh_calls, 4);
    assert_eq!(stats.modify_calls, 0);
    assert_eq!(stats.unregister_calls, 2);
    assert_eq!(stats.registered, 0);
}

#[test]
fn test_dropping_a_registered_event_unregisters_it() {
    let scheduler = scheduler();

    let handle = scheduler
        .schedule(task::from_fn(|cx| {
            let event = FiberEvent::new(cx.select_fiber()).unwrap();
            event.cede()?;
            assert!(event.is_registered());

            drop(event);
            assert!(cx.select_fiber().is_registered(None));
            cx.yield_now()?;
            Ok(())
        }))
        .unwrap();

    scheduler.event_loop().unwrap();

    assert!(handle.is_terminated());
    assert_eq!(scheduler.reactor_stats().registered, 0);
}
