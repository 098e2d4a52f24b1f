//! Thread-local record of which fiber is running.
//!
//! Fibers may resume other fibers, so the record is a stack: resuming pushes
//! the target, and control coming back to the resumer pops it. The top of
//! the stack is the one fiber currently executing on this thread.

use crate::fiber::coroutine::FiberShared;

use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static CURRENT_FIBERS: RefCell<Vec<Rc<FiberShared>>> = const { RefCell::new(Vec::new()) };
}

/// Runs `function` with `fiber` recorded as the current fiber.
pub(crate) fn enter<F, R>(fiber: Rc<FiberShared>, function: F) -> R
where
    F: FnOnce() -> R,
{
    struct Exit;

    impl Drop for Exit {
        fn drop(&mut self) {
            CURRENT_FIBERS.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }

    CURRENT_FIBERS.with(|stack| stack.borrow_mut().push(fiber));
    let _exit = Exit;

    function()
}

pub(crate) fn current() -> Option<Rc<FiberShared>> {
    CURRENT_FIBERS.with(|stack| stack.borrow().last().cloned())
}
