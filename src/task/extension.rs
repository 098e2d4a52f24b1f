//! Per-task extension state.
//!
//! A task type picks a tuple of [`Extension`]s as its `Extensions`; each one
//! gets a hook after every resume of the task and one when it terminates.

use crate::error::TaskError;
use crate::fiber::{FiberRef, context};
use crate::reactor::Reactor;
use crate::select_fiber::SelectFiber;
use crate::task::TaskCell;

use log::debug;
use std::error::Error as StdError;
use std::rc::Rc;

/// Lifecycle hooks of one piece of extension state.
pub trait Extension: Default + 'static {
    /// Runs inside the task right after it is resumed. An error is raised at
    /// the task's suspend point.
    fn on_resumed(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    fn on_terminated(&mut self) {}
}

/// The full extension set of a task type: `()` or a tuple of up to four
/// [`Extension`]s, run in order.
pub trait Extensions: Default + 'static {
    fn on_resumed(&mut self) -> Result<(), TaskError>;

    fn on_terminated(&mut self);
}

impl Extensions for () {
    fn on_resumed(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    fn on_terminated(&mut self) {}
}

macro_rules! tuple_extensions {
    ($($name:ident . $index:tt),+) => {
        impl<$($name: Extension),+> Extensions for ($($name,)+) {
            fn on_resumed(&mut self) -> Result<(), TaskError> {
                $(self.$index.on_resumed()?;)+
                Ok(())
            }

            fn on_terminated(&mut self) {
                $(self.$index.on_terminated();)+
            }
        }
    };
}

tuple_extensions!(A.0);
tuple_extensions!(A.0, B.1);
tuple_extensions!(A.0, B.1, C.2);
tuple_extensions!(A.0, B.1, C.2, D.3);

/// Redelivers an error captured outside the task inside it.
///
/// Some callback running outside the task (an I/O completion, another task)
/// stores the error with [`set`](Self::set) while the task is suspended; when
/// the task is next resumed its suspend point returns
/// [`TaskError::Forwarded`] carrying that same error object.
#[derive(Debug, Default)]
pub struct ExceptionForwarding {
    pending: Option<Box<dyn StdError + 'static>>,
}

impl ExceptionForwarding {
    pub fn set<E>(&mut self, error: E)
    where
        E: StdError + 'static,
    {
        self.set_boxed(Box::new(error));
    }

    pub fn set_boxed(&mut self, error: Box<dyn StdError + 'static>) {
        if self.pending.replace(error).is_some() {
            debug!("exception forwarding: pending error replaced before delivery");
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

impl Extension for ExceptionForwarding {
    fn on_resumed(&mut self) -> Result<(), TaskError> {
        match self.pending.take() {
            Some(error) => Err(TaskError::Forwarded(error)),
            None => Ok(()),
        }
    }
}

/// Lazily hands out a [`SelectFiber`] for the task's own fiber, for code that
/// manages its adapter itself instead of using
/// [`TaskContext::select_fiber`](crate::task::TaskContext::select_fiber).
///
/// For the fiber the task runs on this is the task's own adapter, so a fiber
/// never holds two registrations at once. A fresh adapter is built only for
/// a fiber the task is not running on.
#[derive(Default)]
pub struct LegacyAdapter {
    select_fiber: Option<Rc<SelectFiber>>,
}

impl LegacyAdapter {
    /// Returns the adapter bound to `fiber`. One bound to a fiber the task no
    /// longer runs on is unregistered and replaced.
    pub fn select_fiber(&mut self, fiber: &FiberRef, reactor: &Rc<Reactor>) -> Rc<SelectFiber> {
        if let Some(select_fiber) = &self.select_fiber {
            if select_fiber.fiber() == fiber {
                return select_fiber.clone();
            }
        }

        self.release();

        let select_fiber = task_adapter(fiber)
            .unwrap_or_else(|| Rc::new(SelectFiber::new(fiber.clone(), reactor.clone())));
        self.select_fiber = Some(select_fiber.clone());
        select_fiber
    }

    pub fn is_bound(&self) -> bool {
        self.select_fiber.is_some()
    }

    fn release(&mut self) {
        if let Some(select_fiber) = self.select_fiber.take() {
            if let Err(error) = select_fiber.unregister() {
                debug!("legacy adapter: unregister failed: {error}");
            }
        }
    }
}

/// The adapter the scheduler bound to `fiber`, if `fiber` is the one running.
fn task_adapter(fiber: &FiberRef) -> Option<Rc<SelectFiber>> {
    let current = context::current()?;
    if current.fiber_ref() != *fiber {
        return None;
    }

    current.task()?.control().select_fiber()
}

impl Extension for LegacyAdapter {
    fn on_terminated(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fmt;

    #[derive(Debug)]
    struct Refused;

    impl fmt::Display for Refused {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("connection refused")
        }
    }

    impl StdError for Refused {}

    #[test]
    fn forwarded_error_is_delivered_once() {
        let mut forwarding = ExceptionForwarding::default();
        forwarding.set(Refused);

        let error = forwarding.on_resumed().unwrap_err();
        assert!(error.downcast_forwarded::<Refused>().is_some());
        assert!(forwarding.on_resumed().is_ok());
    }

    #[test]
    fn tuples_run_every_extension() {
        let mut extensions = (ExceptionForwarding::default(), LegacyAdapter::default());
        extensions.0.set(Refused);

        assert!(Extensions::on_resumed(&mut extensions).is_err());
        assert!(Extensions::on_resumed(&mut extensions).is_ok());
        Extensions::on_terminated(&mut extensions);
        assert!(!extensions.1.is_bound());
    }
}
