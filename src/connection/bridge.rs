//! The blocking bridge between a caller thread and an engine.
//!
//! [`MessageLoop`] is a single-waiter rendezvous and, at the same time, the
//! [`Executor`] handed to the engine. Engines post callbacks and upload
//! provider calls as tasks; the caller thread executes them inside
//! [`run`](MessageLoop::run) until one of them calls [`quit`](MessageLoop::quit).
//!
//! Running engine work on the waiting thread means every write performed by a
//! callback happens before the caller resumes, and upload providers see stable
//! buffers because the writer is parked in the same loop.
//!
//! # Release semantics
//!
//! `quit()` sets a durable *released* flag. The next `run()` consumes it, even
//! when the `quit()` arrived after a previous `run_timeout()` gave up.
//!
//! ```
//! use url_connection::connection::MessageLoop;
//! use std::time::Duration;
//!
//! let message_loop = MessageLoop::new();
//! message_loop.quit();
//! assert!(message_loop.run_timeout(Duration::from_millis(1)).is_ok());
//! assert!(message_loop.run_timeout(Duration::from_millis(1)).is_err());
//! ```

use crate::engine::{Executor, Task};
use crate::error::{ConnectionError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Default)]
struct LoopState {
    tasks: VecDeque<Task>,
    released: bool,
}

/// Task-running wait primitive released from another execution context.
pub struct MessageLoop {
    state: Mutex<LoopState>,
    wakeup: Condvar,
}

impl MessageLoop {
    /// Create an idle loop.
    pub fn new() -> Self {
        MessageLoop {
            state: Mutex::new(LoopState::default()),
            wakeup: Condvar::new(),
        }
    }

    /// Execute posted tasks until released.
    pub fn run(&self) -> Result<()> {
        self.run_inner(None)
    }

    /// Execute posted tasks until released or until `timeout` elapses.
    ///
    /// On expiry returns [`ConnectionError::Timeout`]; tasks still queued and a
    /// later release stay pending for the next run.
    pub fn run_timeout(&self, timeout: Duration) -> Result<()> {
        self.run_until(Instant::now() + timeout)
    }

    /// Like [`run_timeout`](Self::run_timeout) with an absolute deadline.
    pub fn run_until(&self, deadline: Instant) -> Result<()> {
        self.run_inner(Some(deadline))
    }

    /// Release the current (or next) waiter.
    pub fn quit(&self) {
        let mut state = self.state.lock();
        state.released = true;
        self.wakeup.notify_one();
    }

    /// Number of tasks waiting to run.
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }

    fn run_inner(&self, deadline: Option<Instant>) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.released {
                state.released = false;
                return Ok(());
            }
            if let Some(task) = state.tasks.pop_front() {
                // Tasks may post more work or quit; never hold the lock while running them.
                MutexGuard::unlocked(&mut state, task);
                continue;
            }
            match deadline {
                None => self.wakeup.wait(&mut state),
                Some(deadline) => {
                    if self.wakeup.wait_until(&mut state, deadline).timed_out()
                        && !state.released
                        && state.tasks.is_empty()
                    {
                        return Err(ConnectionError::Timeout);
                    }
                }
            }
        }
    }
}

impl Default for MessageLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for MessageLoop {
    fn execute(&self, task: Task) {
        let mut state = self.state.lock();
        state.tasks.push_back(task);
        self.wakeup.notify_one();
    }
}
