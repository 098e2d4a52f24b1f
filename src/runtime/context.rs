//! The per-thread scheduler instance.
//!
//! Long-lived services usually run one scheduler per thread and reach it from
//! anywhere without passing a handle around. [`init`] installs it,
//! [`scheduler`] fetches it, and [`shutdown`] stops and removes it. Code that
//! needs several independent schedulers (tests, embedders) creates them with
//! [`Scheduler::new`] instead.
//!
//! # Example
//!
//! ```ignore
//! use fiber_reactor::runtime;
//!
//! runtime::init(SchedulerConfig::default())?;
//! runtime::scheduler()?.schedule(task::from_fn(|_| Ok(())))?;
//! runtime::scheduler()?.event_loop()?;
//! runtime::shutdown()?;
//! ```

use crate::error::SchedulerError;
use crate::runtime::Scheduler;
use crate::runtime::config::SchedulerConfig;

use std::cell::RefCell;

thread_local! {
    /// Set by [`init`], cleared by [`shutdown`].
    static INSTALLED: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// Creates and installs this thread's scheduler.
pub fn init(config: SchedulerConfig) -> Result<Scheduler, SchedulerError> {
    if is_initialized() {
        return Err(SchedulerError::AlreadyInitialized);
    }

    let scheduler = Scheduler::new(config)?;
    INSTALLED.with(|installed| *installed.borrow_mut() = Some(scheduler.clone()));

    Ok(scheduler)
}

/// Returns this thread's scheduler.
pub fn scheduler() -> Result<Scheduler, SchedulerError> {
    INSTALLED.with(|installed| {
        installed
            .borrow()
            .clone()
            .ok_or(SchedulerError::NotInitialized)
    })
}

pub fn is_initialized() -> bool {
    INSTALLED.with(|installed| installed.borrow().is_some())
}

/// Shuts down and uninstalls this thread's scheduler.
pub fn shutdown() -> Result<(), SchedulerError> {
    let scheduler = INSTALLED
        .with(|installed| installed.borrow_mut().take())
        .ok_or(SchedulerError::NotInitialized)?;

    scheduler.shutdown();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        assert!(matches!(scheduler(), Err(SchedulerError::NotInitialized)));

        init(SchedulerConfig::default()).unwrap();
        assert!(is_initialized());
        assert!(matches!(
            init(SchedulerConfig::default()),
            Err(SchedulerError::AlreadyInitialized)
        ));

        assert!(scheduler().is_ok());
        shutdown().unwrap();

        assert!(!is_initialized());
        assert!(matches!(shutdown(), Err(SchedulerError::NotInitialized)));
    }
}
