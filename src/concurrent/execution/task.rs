/*
 * Copyright 2019 OysterPack Inc.
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! Task payloads and the futures used to retrieve their results

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use failure::Fail;
use std::{
    any::Any,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// A unit of deferred work that runs at most once.
pub struct Task(Box<dyn FnOnce() + Send + 'static>);

impl Task {
    /// constructor
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task(Box::new(f))
    }

    /// Runs the task on the current thread, consuming it.
    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Task")
    }
}

/// Task related errors
#[derive(Fail, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task panicked while running.
    #[fail(display = "The task panicked: {}", _0)]
    Panicked(String),
    /// The task ran but reported a failure.
    #[fail(display = "The task failed: {}", _0)]
    Failed(String),
    /// The task was cancelled before it started running.
    #[fail(display = "The task was cancelled")]
    Cancelled,
    /// The task was dropped by its dispatcher without ever running.
    #[fail(display = "The task was dropped before it ran")]
    Abandoned,
}

impl TaskError {
    pub(crate) fn from_panic(panic: Box<dyn Any + Send + 'static>) -> Self {
        TaskError::Panicked(panic_message(&*panic))
    }
}

/// Extracts the message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send + 'static)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

const NEW: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;
const ABANDONED: u8 = 4;

// Marks the task abandoned if it is dropped before its callable got a chance to run.
struct AbandonGuard(Arc<AtomicU8>);

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let _ = self
            .0
            .compare_exchange(NEW, ABANDONED, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Wraps the callable in a Task that delivers its outcome to the returned TaskFuture.
/// - the callable only runs if the future was not cancelled first
/// - panics are captured and delivered as [TaskError::Panicked](enum.TaskError.html)
pub(crate) fn future_task<F, T>(callable: F) -> (Task, TaskFuture<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (sender, receiver) = channel::bounded(1);
    let state = Arc::new(AtomicU8::new(NEW));
    let guard = AbandonGuard(Arc::clone(&state));
    let task = Task::new(move || run_callable(callable, &guard.0, &sender));
    (
        task,
        TaskFuture {
            state,
            receiver,
            outcome: None,
        },
    )
}

fn run_callable<F, T>(callable: F, state: &AtomicU8, sender: &Sender<thread::Result<T>>)
where
    F: FnOnce() -> T,
{
    if state
        .compare_exchange(NEW, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    let result = catch_unwind(AssertUnwindSafe(callable));
    state.store(DONE, Ordering::SeqCst);
    // the receiver may already be gone, i.e., nobody cares about the result
    let _ = sender.send(result);
}

/// Represents the result of a submitted task.
/// - the result is delivered exactly once, by the task that owns the other end of the channel
/// - a task that has not yet started can be cancelled, in which case it will never run
pub struct TaskFuture<T> {
    state: Arc<AtomicU8>,
    receiver: Receiver<thread::Result<T>>,
    outcome: Option<Result<T, TaskError>>,
}

impl<T> TaskFuture<T> {
    /// Attempts to cancel the task.
    ///
    /// Returns true if the task was cancelled before it started running. Tasks that are running,
    /// done, or already cancelled are not affected and false is returned.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(NEW, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Returns true if the task was cancelled before it ran, or if the wait for its outcome was
    /// given up on, see [detach](#method.detach).
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
            || matches!(self.outcome, Some(Err(TaskError::Cancelled)))
    }

    /// Returns true if the task outcome is available, i.e., [get](#method.get) will not block.
    pub fn is_done(&self) -> bool {
        self.outcome.is_some() || !self.receiver.is_empty() || {
            let state = self.state.load(Ordering::SeqCst);
            state == CANCELLED || state == ABANDONED
        }
    }

    /// Gives up on the task's outcome without affecting the task itself.
    /// - a task that has not started is cancelled
    /// - a task that is already running is left to run to completion, but its outcome is discarded
    ///   and this future reports [TaskError::Cancelled](enum.TaskError.html)
    /// - a future whose outcome is already available is not affected
    pub fn detach(&mut self) {
        if self.outcome.is_some() || self.cancel() {
            return;
        }
        if let Ok(result) = self.receiver.try_recv() {
            self.outcome = Some(result.map_err(TaskError::from_panic));
            return;
        }
        if self.state.load(Ordering::SeqCst) == ABANDONED {
            self.outcome = Some(Err(TaskError::Abandoned));
            return;
        }
        self.outcome = Some(Err(TaskError::Cancelled));
    }

    /// Blocks until the task outcome is available.
    pub fn wait(&mut self) {
        if self.outcome.is_none() {
            let outcome = self.receive();
            self.outcome = Some(outcome);
        }
    }

    /// Blocks until the task outcome is available, or the timeout expires.
    /// - returns true if the outcome is available
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match self.state.load(Ordering::SeqCst) {
            CANCELLED => {
                self.outcome = Some(Err(TaskError::Cancelled));
                return true;
            }
            ABANDONED => {
                self.outcome = Some(Err(TaskError::Abandoned));
                return true;
            }
            _ => (),
        }
        let outcome = match self.receiver.recv_timeout(timeout) {
            Ok(result) => result.map_err(TaskError::from_panic),
            Err(RecvTimeoutError::Timeout) => return false,
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        };
        self.outcome = Some(outcome);
        true
    }

    /// Blocks until the task is done and returns its outcome.
    pub fn get(mut self) -> Result<T, TaskError> {
        match self.outcome.take() {
            Some(outcome) => outcome,
            None => self.receive(),
        }
    }

    fn receive(&self) -> Result<T, TaskError> {
        match self.state.load(Ordering::SeqCst) {
            CANCELLED => return Err(TaskError::Cancelled),
            ABANDONED => return Err(TaskError::Abandoned),
            _ => (),
        }
        match self.receiver.recv() {
            Ok(result) => result.map_err(TaskError::from_panic),
            Err(_) => Err(self.disconnected()),
        }
    }

    // the sending task was dropped without delivering a result
    fn disconnected(&self) -> TaskError {
        if self.state.load(Ordering::SeqCst) == CANCELLED {
            TaskError::Cancelled
        } else {
            TaskError::Abandoned
        }
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.state.load(Ordering::SeqCst) {
            NEW => "New",
            RUNNING => "Running",
            DONE => "Done",
            CANCELLED => "Cancelled",
            _ => "Abandoned",
        };
        write!(f, "TaskFuture({})", state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configure_logging;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn task_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = {
            let counter = Arc::clone(&counter);
            Task::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        task.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn future_task_delivers_value() {
        configure_logging();
        let (task, future) = future_task(|| 1);
        assert!(!future.is_done());
        task.run();
        assert!(future.is_done());
        assert_eq!(future.get(), Ok(1));
    }

    #[test]
    fn future_task_captures_panic() {
        configure_logging();
        let (task, future) = future_task(|| -> usize { panic!("BOOM!!") });
        task.run();
        assert_eq!(future.get(), Err(TaskError::Panicked("BOOM!!".to_string())));
    }

    #[test]
    fn cancelled_task_never_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (task, future) = {
            let counter = Arc::clone(&counter);
            future_task(move || counter.fetch_add(1, Ordering::SeqCst))
        };
        assert!(future.cancel());
        assert!(!future.cancel());
        assert!(future.is_cancelled());
        assert!(future.is_done());
        task.run();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(future.get(), Err(TaskError::Cancelled));
    }

    #[test]
    fn completed_task_cannot_be_cancelled() {
        let (task, mut future) = future_task(|| "done");
        task.run();
        assert!(!future.cancel());
        future.wait();
        assert_eq!(future.get(), Ok("done"));
    }

    #[test]
    fn dropped_task_is_abandoned() {
        let (task, future) = future_task(|| 1);
        drop(task);
        assert!(future.is_done());
        assert!(!future.is_cancelled());
        assert!(!future.cancel());
        assert_eq!(format!("{:?}", future), "TaskFuture(Abandoned)");
        assert_eq!(future.get(), Err(TaskError::Abandoned));
    }

    #[test]
    fn dropped_task_is_abandoned_for_wait_timeout() {
        let (task, mut future) = future_task(|| 1);
        drop(task);
        assert!(future.wait_timeout(Duration::from_millis(0)));
        assert_eq!(future.get(), Err(TaskError::Abandoned));
    }

    #[test]
    fn task_that_ran_is_not_abandoned() {
        let (task, future) = future_task(|| 1);
        task.run();
        assert_eq!(format!("{:?}", future), "TaskFuture(Done)");
        assert_eq!(future.get(), Ok(1));
    }

    #[test]
    fn detach_running_task() {
        configure_logging();
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        let (task, mut future) = future_task(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            1
        });
        let handle = thread::spawn(move || task.run());
        started_rx.recv().unwrap();
        future.detach();
        assert!(future.is_done());
        assert!(future.is_cancelled());
        drop(release_tx);
        handle.join().unwrap();
        assert_eq!(future.get(), Err(TaskError::Cancelled));
    }

    #[test]
    fn detach_keeps_available_outcome() {
        let (task, mut future) = future_task(|| 1);
        task.run();
        future.detach();
        assert!(!future.is_cancelled());
        assert_eq!(future.get(), Ok(1));

        let (task, mut future) = future_task(|| 1);
        future.detach();
        assert!(future.is_cancelled());
        task.run();
        assert_eq!(future.get(), Err(TaskError::Cancelled));
    }

    #[test]
    fn wait_timeout() {
        let (task, mut future) = future_task(|| 1);
        assert!(!future.wait_timeout(Duration::from_millis(10)));
        let handle = thread::spawn(move || task.run());
        assert!(future.wait_timeout(Duration::from_secs(10)));
        handle.join().unwrap();
        assert_eq!(future.get(), Ok(1));
    }

    #[test]
    fn panic_message_from_payload() {
        let panic = catch_unwind(|| panic!("{}", String::from("formatted"))).unwrap_err();
        assert_eq!(panic_message(&*panic), "formatted");
        let panic = catch_unwind(|| std::panic::panic_any(42_u32)).unwrap_err();
        assert_eq!(panic_message(&*panic), "non-string panic payload");
    }
}
