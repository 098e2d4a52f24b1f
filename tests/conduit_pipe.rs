use std::cell::{Cell, RefCell};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use fiber_reactor::{Conduit, IoError, Scheduler, TaskError, task};

fn scheduler() -> Scheduler {
    Scheduler::builder()
        .worker_fiber_limit(4)
        .stack_size(128 * 1024)
        .build()
        .unwrap()
}

fn pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(res, 0, "pipe() failed");
    (fds[0], fds[1])
}

#[test]
fn test_reader_blocks_until_the_writer_writes() {
    let scheduler = scheduler();
    let (rfd, wfd) = pipe();
    let received = Rc::new(RefCell::new(Vec::new()));

    let sink = received.clone();
    scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(rfd, cx.select_fiber()).unwrap();
            let mut buf = [0u8; 5];
            conduit.read_exact(&mut buf)?;
            sink.borrow_mut().extend_from_slice(&buf);
            Ok(())
        }))
        .unwrap();

    scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(wfd, cx.select_fiber()).unwrap();
            conduit.write_all(b"hello")?;
            Ok(())
        }))
        .unwrap();

    scheduler.event_loop().unwrap();

    assert_eq!(&received.borrow()[..], b"hello");
    assert_eq!(scheduler.stats().tasks_completed, 2);
    assert_eq!(scheduler.reactor_stats().registered, 0);
}

#[test]
fn test_end_of_stream_is_a_warning() {
    let scheduler = scheduler();
    let (rfd, wfd) = pipe();
    let eof = Rc::new(Cell::new(false));

    let flag = eof.clone();
    scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(rfd, cx.select_fiber()).unwrap();
            let mut buf = [0u8; 16];
            let error = conduit.read(&mut buf).unwrap_err();
            flag.set(matches!(error, TaskError::Io(IoError::Warning { .. })));
            Ok(())
        }))
        .unwrap();

    scheduler
        .schedule(task::from_fn(move |cx| {
            // Dropping the conduit closes the write end.
            let conduit = Conduit::new(wfd, cx.select_fiber()).unwrap();
            cx.yield_now()?;
            drop(conduit);
            Ok(())
        }))
        .unwrap();

    scheduler.event_loop().unwrap();

    assert!(eof.get());
}

#[test]
fn test_dropping_a_waiting_conduit_unregisters_it() {
    let scheduler = scheduler();
    let (rfd, wfd) = pipe();

    let handle = scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(rfd, cx.select_fiber()).unwrap();
            let mut buf = [0u8; 1];
            conduit.read(&mut buf)?;
            assert_eq!(cx.reactor().registered_count(), 1);

            drop(conduit);
            assert_eq!(cx.reactor().registered_count(), 0);
            assert!(cx.select_fiber().is_registered(None));
            Ok(())
        }))
        .unwrap();

    scheduler.process_events().unwrap();
    let wrote = unsafe { libc::write(wfd, [1u8].as_ptr() as *const libc::c_void, 1) };
    assert_eq!(wrote, 1);
    scheduler.event_loop().unwrap();

    assert!(handle.is_terminated());
    assert_eq!(scheduler.stats().tasks_completed, 1);

    unsafe {
        libc::close(wfd);
    }
}

#[test]
fn test_wait_times_out() {
    let scheduler = scheduler();
    let (rfd, wfd) = pipe();
    let timed_out = Rc::new(Cell::new(false));

    let flag = timed_out.clone();
    scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(rfd, cx.select_fiber()).unwrap();
            conduit.set_timeout(Some(Duration::from_millis(20)));

            let mut buf = [0u8; 1];
            let error = conduit.read(&mut buf).unwrap_err();
            flag.set(matches!(error, TaskError::Io(IoError::TimedOut { op: "read", .. })));
            Ok(())
        }))
        .unwrap();

    scheduler.event_loop().unwrap();

    assert!(timed_out.get());
    assert_eq!(scheduler.reactor_stats().timeouts_fired, 1);

    unsafe {
        libc::close(wfd);
    }
}

#[test]
fn test_huge_timeout_waits_without_a_deadline() {
    let scheduler = scheduler();
    let (rfd, wfd) = pipe();
    let received = Rc::new(RefCell::new(Vec::new()));

    let sink = received.clone();
    scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(rfd, cx.select_fiber()).unwrap();
            conduit.set_timeout(Some(Duration::MAX));

            let mut buf = [0u8; 2];
            conduit.read_exact(&mut buf)?;
            sink.borrow_mut().extend_from_slice(&buf);
            Ok(())
        }))
        .unwrap();

    scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(wfd, cx.select_fiber()).unwrap();
            cx.yield_now()?;
            conduit.write_all(b"ok")?;
            Ok(())
        }))
        .unwrap();

    scheduler.event_loop().unwrap();

    assert_eq!(&received.borrow()[..], b"ok");
    assert_eq!(scheduler.stats().tasks_completed, 2);
    assert_eq!(scheduler.reactor_stats().timeouts_fired, 0);
}

#[test]
fn test_writer_waits_for_the_reader_to_drain() {
    const TOTAL: usize = 512 * 1024;

    let scheduler = scheduler();
    let (rfd, wfd) = pipe();
    let received = Rc::new(Cell::new(0usize));

    let count = received.clone();
    scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(rfd, cx.select_fiber()).unwrap();
            let mut buf = [0u8; 4096];
            loop {
                match conduit.read(&mut buf) {
                    Ok(n) => count.set(count.get() + n),
                    Err(TaskError::Io(IoError::Warning { .. })) => return Ok(()),
                    Err(error) => return Err(error),
                }
            }
        }))
        .unwrap();

    scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(wfd, cx.select_fiber()).unwrap();
            let payload = vec![7u8; TOTAL];
            conduit.write_all(&payload)?;
            Ok(())
        }))
        .unwrap();

    scheduler.event_loop().unwrap();

    assert_eq!(received.get(), TOTAL);
    assert_eq!(scheduler.stats().tasks_completed, 2);
}

#[test]
fn test_ping_pong_over_a_socket_pair() {
    let scheduler = scheduler();
    let (left, right) = UnixStream::pair().unwrap();
    let rounds = Rc::new(Cell::new(0));

    scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(left, cx.select_fiber()).unwrap();
            let mut buf = [0u8; 4];
            for _ in 0..3 {
                conduit.write_all(b"ping")?;
                conduit.read_exact(&mut buf)?;
                assert_eq!(&buf, b"pong");
            }
            Ok(())
        }))
        .unwrap();

    let count = rounds.clone();
    scheduler
        .schedule(task::from_fn(move |cx| {
            let conduit = Conduit::new(right, cx.select_fiber()).unwrap();
            let mut buf = [0u8; 4];
            for _ in 0..3 {
                conduit.read_exact(&mut buf)?;
                assert_eq!(&buf, b"ping");
                conduit.write_all(b"pong")?;
                count.set(count.get() + 1);
            }
            Ok(())
        }))
        .unwrap();

    scheduler.event_loop().unwrap();

    assert_eq!(rounds.get(), 3);
    assert_eq!(scheduler.stats().tasks_completed, 2);
    // Each side keeps its read client registered between rounds.
    assert_eq!(scheduler.reactor_stats().register_calls, 2);
}
