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

//! The asynchronous dispatch primitive that [ManagedExecutor](../struct.ManagedExecutor.html) is
//! built on, and its two standard implementations:
//! - [PoolDispatcher](struct.PoolDispatcher.html) hands tasks off to a thread pool
//! - [InlineDispatcher](struct.InlineDispatcher.html) runs tasks on the calling thread

use super::{metrics, task::panic_message, ExecutorBuilder, ExecutorConfigError, ExecutorId, Task};
use failure::Fail;
use futures::executor::ThreadPool;
use log::*;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

/// The single operation a task execution facade needs: hand off a task for execution.
pub trait AsyncDispatch: Send + Sync + fmt::Debug {
    /// Accepts the task for execution.
    ///
    /// For [DispatchMode::Managed](enum.DispatchMode.html) dispatchers, the call returns once the
    /// task has been accepted, and the task is guaranteed to run exactly once on some other thread.
    ///
    /// For [DispatchMode::Synchronous](enum.DispatchMode.html) dispatchers, the task has run to
    /// completion on the calling thread by the time the call returns.
    fn dispatch_async(&self, task: Task) -> Result<(), DispatchError>;

    /// Reports which execution guarantee [dispatch_async](#tymethod.dispatch_async) honors
    fn mode(&self) -> DispatchMode;
}

/// Hook used by an external runtime to supply the dispatcher that an executor should use.
pub trait ManagedContext: Send + Sync {
    /// Returns the runtime's dispatcher, or None if the runtime failed to provide one.
    fn async_dispatcher(&self) -> Option<Arc<dyn AsyncDispatch>>;
}

/// How dispatched tasks are run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// tasks are handed off to a managed thread pool, and the caller does not wait for them
    Managed,
    /// tasks run on the calling thread, i.e., the caller blocks until the task is done
    Synchronous,
}

impl Default for DispatchMode {
    fn default() -> Self {
        DispatchMode::Managed
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchMode::Managed => f.write_str("managed"),
            DispatchMode::Synchronous => f.write_str("synchronous"),
        }
    }
}

/// Dispatch related errors
#[derive(Fail, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The dispatcher refused to accept the task.
    #[fail(display = "Task dispatch was rejected: {}", reason)]
    Rejected {
        /// why the task was rejected
        reason: String,
    },
}

/// Runs each task to completion on the thread that dispatches it.
/// - panics propagate to the caller
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatcher;

impl AsyncDispatch for InlineDispatcher {
    fn dispatch_async(&self, task: Task) -> Result<(), DispatchError> {
        trace!("InlineDispatcher: running task on {:?}", std::thread::current().id());
        task.run();
        Ok(())
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Synchronous
    }
}

/// Hands tasks off to a [futures ThreadPool](https://docs.rs/futures/0.3/futures/executor/struct.ThreadPool.html).
/// - This type is a clonable handle to the thread pool itself. Cloning it only creates a new reference.
/// - Task panics are caught and logged, which keeps the pool's worker threads alive.
#[derive(Debug, Clone)]
pub struct PoolDispatcher {
    executor_id: ExecutorId,
    thread_pool: ThreadPool,
    pool_size: usize,
}

impl PoolDispatcher {
    /// Creates the thread pool configured by the builder
    pub fn new(config: &ExecutorBuilder) -> Result<Self, ExecutorConfigError> {
        let executor_id = config.executor_id();
        let pool_size = config.pool_size().unwrap_or_else(num_cpus::get);
        let mut builder = ThreadPool::builder();
        builder
            .pool_size(pool_size)
            .name_prefix(config.thread_name_prefix())
            .after_start(move |thread_index| {
                debug!("Executor thread has started: {}-{}", executor_id, thread_index)
            })
            .before_stop(move |thread_index| {
                debug!("Executor thread is stopping: {}-{}", executor_id, thread_index)
            });
        if let Some(size) = config.stack_size() {
            builder.stack_size(size);
        }
        let thread_pool = builder
            .create()
            .map_err(ExecutorConfigError::ThreadPoolCreateFailed)?;
        metrics::THREAD_POOL_SIZE_GAUGE
            .with_label_values(&[executor_id.to_string().as_str()])
            .set(pool_size as i64);
        Ok(Self {
            executor_id,
            thread_pool,
            pool_size,
        })
    }

    /// Returns the number of worker threads
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

impl AsyncDispatch for PoolDispatcher {
    fn dispatch_async(&self, task: Task) -> Result<(), DispatchError> {
        let executor_id = self.executor_id;
        self.thread_pool.spawn_ok(async move {
            if let Err(err) = catch_unwind(AssertUnwindSafe(move || task.run())) {
                error!(
                    "Task panicked on executor {}: {}",
                    executor_id,
                    panic_message(&*err)
                );
            }
        });
        Ok(())
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Managed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configure_logging;
    use crossbeam::channel;
    use std::{num::NonZeroUsize, thread, time::Duration};

    #[test]
    fn inline_dispatcher_runs_on_calling_thread() {
        configure_logging();
        let (tx, rx) = channel::unbounded();
        InlineDispatcher
            .dispatch_async(Task::new(move || tx.send(thread::current().id()).unwrap()))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), thread::current().id());
        assert_eq!(InlineDispatcher.mode(), DispatchMode::Synchronous);
    }

    #[test]
    fn pool_dispatcher_runs_on_pool_thread() {
        configure_logging();
        let id = ExecutorId::generate();
        let dispatcher = PoolDispatcher::new(
            &ExecutorBuilder::new(id).set_pool_size(NonZeroUsize::new(2).unwrap()),
        )
        .unwrap();
        assert_eq!(dispatcher.pool_size(), 2);
        assert_eq!(dispatcher.mode(), DispatchMode::Managed);

        let (tx, rx) = channel::unbounded();
        dispatcher
            .dispatch_async(Task::new(move || {
                let current = thread::current();
                tx.send((current.id(), current.name().map(str::to_string)))
                    .unwrap();
            }))
            .unwrap();
        let (thread_id, thread_name) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_ne!(thread_id, thread::current().id());
        assert!(thread_name.unwrap().starts_with(&format!("{}-", id)));
    }

    // threads that panic in the pool keep running
    #[test]
    fn pool_dispatcher_survives_panicking_tasks() {
        configure_logging();
        let dispatcher = PoolDispatcher::new(
            &ExecutorBuilder::new(ExecutorId::generate())
                .set_pool_size(NonZeroUsize::new(1).unwrap()),
        )
        .unwrap();
        for i in 0..4 {
            dispatcher
                .dispatch_async(Task::new(move || panic!("BOOM({})!", i)))
                .unwrap();
        }
        let (tx, rx) = channel::bounded(1);
        dispatcher
            .dispatch_async(Task::new(move || tx.send(()).unwrap()))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn dispatch_mode_serde() {
        assert_eq!(
            serde_json::to_string(&DispatchMode::Synchronous).unwrap(),
            r#""synchronous""#
        );
        let mode: DispatchMode = serde_json::from_str(r#""managed""#).unwrap();
        assert_eq!(mode, DispatchMode::Managed);
        assert_eq!(DispatchMode::default(), DispatchMode::Managed);
    }
}
