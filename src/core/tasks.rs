//! Background task runner with a shared busy indicator and a single alert slot.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::core::events::{Event, EventSink};
use crate::error::{Error, ErrorKind, Result};

/// A failure surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub task: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Busy indicator and alert slot shared by every task.
///
/// The indicator counts running tasks, so it reads idle only once all of them have finished.
#[derive(Debug)]
pub struct StatusBoard {
    running: AtomicUsize,
    alert: Mutex<Option<Alert>>,
    events: EventSink,
}

impl StatusBoard {
    pub fn new(events: EventSink) -> Self {
        Self {
            running: AtomicUsize::new(0),
            alert: Mutex::new(None),
            events,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.running.load(Ordering::Acquire) > 0
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Current unacknowledged alert, if any.
    pub fn alert(&self) -> Option<Alert> {
        self.alert
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Acknowledge and clear the pending alert.
    pub fn take_alert(&self) -> Option<Alert> {
        self.alert
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Record `err` as the pending alert, replacing any previous one. Cancellations are only
    /// logged.
    pub fn report(&self, task: &str, err: &Error) {
        if err.kind() == ErrorKind::Cancelled {
            log::info!("{task}: {err}");
            return;
        }
        log::debug!("{task} failed: {err}");
        let alert = Alert {
            task: task.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        };
        *self.alert.lock().unwrap_or_else(PoisonError::into_inner) = Some(alert.clone());
        self.events.publish(Event::AlertRaised(alert));
    }

    fn enter(self: &Arc<Self>) -> BusyGuard {
        if self.running.fetch_add(1, Ordering::AcqRel) == 0 {
            self.events.publish(Event::BusyChanged { busy: true });
        }
        BusyGuard(Arc::clone(self))
    }
}

struct BusyGuard(Arc<StatusBoard>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.events.publish(Event::BusyChanged { busy: false });
        }
    }
}

/// Handle to a running task. Dropping it detaches the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    label: String,
    join: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Block until the task ends. Failures have already been reported as alerts.
    pub fn wait(self) -> Result<T> {
        match self.join.join() {
            Ok(result) => result,
            Err(_) => Err(Error::TaskPanicked { label: self.label }),
        }
    }
}

/// Run `op` on a worker thread while the indicator reads busy. An `Err` or a panic becomes the
/// pending alert.
pub fn spawn_busy<T, F>(status: &Arc<StatusBoard>, label: impl Into<String>, op: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let label = label.into();
    let guard = status.enter();
    let board = Arc::clone(status);
    let task = label.clone();
    let join = thread::spawn(move || {
        let _guard = guard;
        log::debug!("task `{task}` started");
        let result = panic::catch_unwind(AssertUnwindSafe(op)).unwrap_or_else(|_| {
            Err(Error::TaskPanicked {
                label: task.clone(),
            })
        });
        if let Err(err) = &result {
            board.report(&task, err);
        } else {
            log::debug!("task `{task}` finished");
        }
        result
    });
    TaskHandle { label, join }
}
