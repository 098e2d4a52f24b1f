use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fiber_reactor::{
    FiberEvent, Scheduler, SchedulerBuilder, SchedulerConfig, SchedulerError, runtime, task,
};

#[test]
fn test_builder_applies_options() {
    let scheduler = SchedulerBuilder::new()
        .worker_fiber_limit(3)
        .stack_size(32 * 1024)
        .task_queue_limit(5)
        .max_events(4)
        .build()
        .unwrap();

    let config = scheduler.config();
    assert_eq!(config.worker_fiber_limit, 3);
    assert_eq!(config.worker_fiber_stack_size, 32 * 1024);
    assert_eq!(config.max_events, 4);

    let stats = scheduler.stats();
    assert_eq!(stats.worker_fiber_total, 3);
    assert_eq!(stats.task_queue_limit, 5);
    assert_eq!(stats.worker_fibers_created, 0);
}

#[test]
fn test_builder_rejects_invalid_config() {
    let result = SchedulerBuilder::new().worker_fiber_limit(0).build();

    assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
}

#[test]
fn test_event_loop_without_work_returns() {
    let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();

    scheduler.event_loop().unwrap();
    assert_eq!(scheduler.process_events().unwrap(), 0);
}

#[test]
fn test_shutdown_from_a_task_stops_the_loop() {
    let scheduler = Scheduler::builder().stack_size(64 * 1024).build().unwrap();
    let unwound = Rc::new(Cell::new(false));

    struct SetOnDrop(Rc<Cell<bool>>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    let flag = unwound.clone();
    let waiter = scheduler
        .schedule(task::from_fn(move |cx| {
            let _guard = SetOnDrop(flag);
            let event = FiberEvent::new(cx.select_fiber()).unwrap();
            event.wait()?;
            Ok(())
        }))
        .unwrap();

    scheduler
        .schedule(task::from_fn(|cx| {
            cx.scheduler().shutdown();
            Ok(())
        }))
        .unwrap();

    scheduler.event_loop().unwrap();

    assert!(scheduler.is_shut_down());
    assert!(waiter.is_terminated());
    assert!(unwound.get());

    let stats = scheduler.stats();
    assert_eq!(stats.tasks_completed, 1);
    assert_eq!(stats.tasks_killed, 1);
    assert_eq!(stats.worker_fiber_busy, 0);
    assert_eq!(scheduler.reactor_stats().registered, 0);

    assert!(matches!(
        scheduler.schedule(task::from_fn(|_| Ok(()))),
        Err(SchedulerError::ShutDown)
    ));
}

#[test]
fn test_shutdown_drops_pending_tasks() {
    let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();

    let pending = scheduler.schedule(task::from_fn(|_| Ok(()))).unwrap();
    scheduler.shutdown();

    assert!(pending.is_terminated());
    assert_eq!(scheduler.stats().tasks_killed, 1);
    assert_eq!(scheduler.stats().task_queue_busy, 0);
}

#[test]
fn test_process_events_inside_a_task_fails_the_task() {
    let scheduler = Scheduler::builder().stack_size(64 * 1024).build().unwrap();
    let failures = Rc::new(RefCell::new(Vec::new()));

    let sink = failures.clone();
    scheduler.set_exception_handler(move |_, error| sink.borrow_mut().push(error.to_string()));

    let handle = scheduler
        .schedule(task::from_fn(|cx| {
            cx.scheduler().process_events().unwrap();
            Ok(())
        }))
        .unwrap();

    scheduler.process_events().unwrap();

    assert!(handle.is_terminated());
    let failures = failures.borrow();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("inside a task"), "{}", failures[0]);
}

#[test]
fn test_global_instance_runs_tasks() {
    let scheduler = runtime::init(SchedulerConfig::default()).unwrap();
    let ran = Rc::new(Cell::new(false));

    let flag = ran.clone();
    runtime::scheduler()
        .unwrap()
        .schedule(task::from_fn(move |_| {
            flag.set(true);
            Ok(())
        }))
        .unwrap();

    scheduler.event_loop().unwrap();
    runtime::shutdown().unwrap();

    assert!(ran.get());
    assert!(scheduler.is_shut_down());
    assert!(matches!(
        runtime::scheduler(),
        Err(SchedulerError::NotInitialized)
    ));
}
