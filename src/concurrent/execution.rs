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

//! Task execution built on a single asynchronous dispatch primitive:
//! - [ManagedExecutor](struct.ManagedExecutor.html) provides execute, submit, invoke all / any
//! - the actual hand-off is done by the executor's [AsyncDispatch](dispatch/trait.AsyncDispatch.html)
//! - executors can be registered in a process wide registry, which always provides a global executor
//!
//! ## Lifecycle
//! Executors are owned by the registry, or by whoever constructed them, for the life of the process.
//! They can not be shut down through their own API: [shutdown](struct.ManagedExecutor.html#method.shutdown)
//! is a no-op, and the termination queries always report that the executor is still running.
//! Do not write shutdown-wait loops against an executor, they will never finish.

pub mod dispatch;
pub mod metrics;
pub mod task;

pub use self::dispatch::{
    AsyncDispatch, DispatchError, DispatchMode, InlineDispatcher, ManagedContext, PoolDispatcher,
};
pub use self::task::{Task, TaskError, TaskFuture};

use self::task::{future_task, panic_message};
use crossbeam::channel;
use failure::Fail;
use lazy_static::lazy_static;
use log::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    fmt, io,
    num::NonZeroUsize,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

lazy_static! {
    /// Global Executor registry
    static ref EXECUTORS: RwLock<ExecutorRegistry> = RwLock::new(ExecutorRegistry::default());
}

/// An executor can only be registered once, and once it is registered, it stays registered for the
/// life of the app.
/// - fails if an executor with the same ID is already registered
pub fn register(executor: ManagedExecutor) -> Result<ManagedExecutor, ExecutorConfigError> {
    EXECUTORS.write().register(executor)
}

/// Returns the registered executor IDs
pub fn executor_ids() -> smallvec::SmallVec<[ExecutorId; 16]> {
    EXECUTORS.read().executor_ids()
}

/// returns the Executor for the specified ID
pub fn executor(id: ExecutorId) -> Option<ManagedExecutor> {
    EXECUTORS.read().executor(id)
}

/// Returns the global executor, which is provided by default.
pub fn global_executor() -> ManagedExecutor {
    EXECUTORS.read().global_executor()
}

/// Executor registry
pub struct ExecutorRegistry {
    global_executor: ManagedExecutor,
    executors: fnv::FnvHashMap<ExecutorId, ManagedExecutor>,
}

impl ExecutorRegistry {
    /// An executor can only be registered once, and once it is registered, it stays registered for the
    /// life of the registry.
    pub fn register(
        &mut self,
        executor: ManagedExecutor,
    ) -> Result<ManagedExecutor, ExecutorConfigError> {
        let id = executor.id();
        if id == ManagedExecutor::GLOBAL_EXECUTOR_ID || self.executors.contains_key(&id) {
            return Err(ExecutorConfigError::ExecutorAlreadyRegistered(id));
        }
        info!(
            "registered executor: {} ({})",
            id,
            executor.dispatch_mode()
        );
        self.executors.insert(id, executor.clone());
        Ok(executor)
    }

    /// Returns the registered executor IDs
    pub fn executor_ids(&self) -> smallvec::SmallVec<[ExecutorId; 16]> {
        self.executors.keys().cloned().collect()
    }

    /// returns the Executor for the specified ID
    pub fn executor(&self, id: ExecutorId) -> Option<ManagedExecutor> {
        if id == ManagedExecutor::GLOBAL_EXECUTOR_ID {
            return Some(self.global_executor.clone());
        }
        self.executors.get(&id).cloned()
    }

    /// Returns the global executor, which is provided by default.
    pub fn global_executor(&self) -> ManagedExecutor {
        self.global_executor.clone()
    }
}

impl Default for ExecutorRegistry {
    /// ## Panics
    /// If the global executor's thread pool can not be created.
    fn default() -> Self {
        let global_executor = ExecutorBuilder::new(ManagedExecutor::GLOBAL_EXECUTOR_ID)
            .build()
            .expect("failed to create the global executor");
        Self {
            global_executor,
            executors: fnv::FnvHashMap::default(),
        }
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ExecutorRegistry(executor count = {})", self.executors.len())
    }
}

/// A task execution facade that delegates the actual execution to an [AsyncDispatch](dispatch/trait.AsyncDispatch.html).
/// - This type is a clonable handle. Clones share the same dispatcher and metrics.
/// - execute, submit, invoke_all and invoke_any are all built on
///   [AsyncDispatch::dispatch_async](dispatch/trait.AsyncDispatch.html#tymethod.dispatch_async)
///
/// ## Blocking
/// For [DispatchMode::Managed](dispatch/enum.DispatchMode.html) executors, [execute](#method.execute)
/// only blocks until the task has been handed off. For [DispatchMode::Synchronous](dispatch/enum.DispatchMode.html)
/// executors, it blocks until the task is done. Callers that must not block should check
/// [dispatch_mode](#method.dispatch_mode).
///
/// ## Metrics
/// - tasks dispatched, completed, panicked and rejected are counted per executor
#[derive(Clone)]
pub struct ManagedExecutor {
    id: ExecutorId,
    dispatcher: Arc<dyn AsyncDispatch>,
    counters: metrics::TaskCounters,
}

impl fmt::Debug for ManagedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ManagedExecutor({}, {:?})", self.id, self.dispatcher)
    }
}

impl ManagedExecutor {
    /// Global ExecutorId, i.e., for the global Executor
    pub const GLOBAL_EXECUTOR_ID: ExecutorId = ExecutorId(1874876458127733924856346281419263591);

    /// Creates an executor that delegates to the specified dispatcher
    pub fn new(id: ExecutorId, dispatcher: Arc<dyn AsyncDispatch>) -> Self {
        Self {
            id,
            dispatcher,
            counters: metrics::TaskCounters::new(id),
        }
    }

    /// Creates an executor that runs tasks on the calling thread.
    pub fn synchronous(id: ExecutorId) -> Self {
        info!(
            "executor {} runs tasks synchronously on the calling thread",
            id
        );
        Self::new(id, Arc::new(InlineDispatcher))
    }

    /// Creates an executor using the dispatcher provided by the managed runtime's context.
    /// - if there is no context, then tasks are run synchronously on the calling thread
    ///
    /// ## Errors
    /// If a context is present but it does not provide a dispatcher. There is no fallback to
    /// synchronous execution in that case.
    pub fn from_context(
        id: ExecutorId,
        context: Option<&dyn ManagedContext>,
    ) -> Result<Self, ExecutorConfigError> {
        match context {
            None => Ok(Self::synchronous(id)),
            Some(context) => match context.async_dispatcher() {
                Some(dispatcher) => Ok(Self::new(id, dispatcher)),
                None => {
                    error!("managed context did not provide a dispatcher for executor {}", id);
                    Err(ExecutorConfigError::DispatcherUnavailable)
                }
            },
        }
    }

    /// Returns the ExecutorId
    pub const fn id(&self) -> ExecutorId {
        self.id
    }

    /// Returns the dispatcher's execution mode
    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    /// Hands the task off to the dispatcher.
    /// - if the task is None, then no action is taken
    ///
    /// ## Errors
    /// If the dispatcher rejects the task.
    ///
    /// ## Panics
    /// For synchronous executors, a panic raised by the task propagates to the caller.
    pub fn execute<T: Into<Option<Task>>>(&self, task: T) -> Result<(), ExecutorError> {
        trace!("ManagedExecutor({})::execute: entering", self.id);
        let result = match task.into() {
            Some(task) => self.dispatch(task),
            None => Ok(()),
        };
        trace!("ManagedExecutor({})::execute: exiting", self.id);
        result
    }

    fn dispatch(&self, task: Task) -> Result<(), ExecutorError> {
        let counters = self.counters.clone();
        let task = Task::new(move || {
            let result = catch_unwind(AssertUnwindSafe(move || task.run()));
            counters.completed.inc();
            if let Err(err) = result {
                counters.panicked.inc();
                resume_unwind(err);
            }
        });
        self.counters.dispatched.inc();
        self.dispatcher.dispatch_async(task).map_err(|err| {
            self.counters.rejected.inc();
            warn!("ManagedExecutor({}): {}", self.id, err);
            ExecutorError::DispatchRejected(err)
        })
    }

    /// Submits a value producing task for execution, and returns a future for its result.
    /// - a panic raised by the task is captured by the future
    pub fn submit<F, T>(&self, callable: F) -> Result<TaskFuture<T>, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (task, future) = future_task(callable);
        self.execute(task)?;
        Ok(future)
    }

    /// Submits a task for execution, and returns a future that signals when it is done.
    pub fn submit_runnable<F>(&self, runnable: F) -> Result<TaskFuture<()>, ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(runnable)
    }

    /// Submits a task for execution, and returns a future that yields the specified result when the
    /// task is done.
    pub fn submit_with_result<F, T>(
        &self,
        runnable: F,
        result: T,
    ) -> Result<TaskFuture<T>, ExecutorError>
    where
        F: FnOnce() + Send + 'static,
        T: Send + 'static,
    {
        self.submit(move || {
            runnable();
            result
        })
    }

    /// Submits all of the tasks, and waits until all of them are done.
    /// - the futures are returned in the same order as the tasks
    /// - if any task fails to be submitted, then the tasks that were already submitted are cancelled
    pub fn invoke_all<I, F, T>(&self, tasks: I) -> Result<Vec<TaskFuture<T>>, ExecutorError>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut futures = self.submit_all(tasks)?;
        for future in futures.iter_mut() {
            future.wait();
        }
        Ok(futures)
    }

    /// Submits all of the tasks, and waits until all of them are done or the timeout expires.
    /// - futures that are not done when the timeout expires are cancelled, i.e., every returned
    ///   future is done and [get](task/struct.TaskFuture.html#method.get) will not block
    /// - tasks that have not started will never run. Tasks that are already running are not
    ///   interrupted, but their outcome is discarded.
    pub fn invoke_all_timeout<I, F, T>(
        &self,
        tasks: I,
        timeout: Duration,
    ) -> Result<Vec<TaskFuture<T>>, ExecutorError>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let mut futures = self.submit_all(tasks)?;
        for future in futures.iter_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !future.wait_timeout(remaining) {
                future.detach();
            }
        }
        Ok(futures)
    }

    fn submit_all<I, F, T>(&self, tasks: I) -> Result<Vec<TaskFuture<T>>, ExecutorError>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let tasks = tasks.into_iter();
        let mut futures = Vec::with_capacity(tasks.size_hint().0);
        for task in tasks {
            match self.submit(task) {
                Ok(future) => futures.push(future),
                Err(err) => {
                    for future in &futures {
                        future.cancel();
                    }
                    return Err(err);
                }
            }
        }
        Ok(futures)
    }

    /// Returns the result of one of the tasks that completed successfully.
    /// - tasks are submitted one at a time, until a task completes successfully
    /// - once a result is obtained, the tasks that have not yet started are cancelled
    ///
    /// ## Errors
    /// - [ExecutorError::NoTasks](enum.ExecutorError.html) if there are no tasks
    /// - [ExecutorError::AllTasksFailed](enum.ExecutorError.html) if none of the tasks succeeded
    pub fn invoke_any<I, F, T, E>(&self, tasks: I) -> Result<T, ExecutorError>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display,
    {
        let mut tasks = tasks.into_iter().peekable();
        if tasks.peek().is_none() {
            return Err(ExecutorError::NoTasks);
        }

        let (sender, receiver) = channel::unbounded::<Result<T, TaskError>>();
        // dropped once every task is submitted, so that the receiver disconnects when the
        // remaining tasks are dropped without running
        let mut sender = Some(sender);
        let mut futures = Vec::new();
        let mut active = 0_usize;
        let mut last_error = TaskError::Abandoned;

        let outcome = loop {
            let completed = match receiver.try_recv() {
                Ok(completed) => completed,
                Err(_) => {
                    if let Some(completion_sender) = sender.as_ref() {
                        if let Some(task) = tasks.next() {
                            let completion_sender = completion_sender.clone();
                            match self.submit_runnable(move || {
                                let _ = completion_sender.send(run_fallible(task));
                            }) {
                                Ok(future) => {
                                    futures.push(future);
                                    active += 1;
                                    continue;
                                }
                                Err(err) => break Err(err),
                            }
                        }
                    }
                    // every task has been submitted
                    sender = None;
                    if active == 0 {
                        break Err(ExecutorError::AllTasksFailed(last_error));
                    }
                    match receiver.recv() {
                        Ok(completed) => completed,
                        Err(_) => break Err(ExecutorError::AllTasksFailed(last_error)),
                    }
                }
            };
            active -= 1;
            match completed {
                Ok(value) => break Ok(value),
                Err(err) => {
                    debug!("ManagedExecutor({})::invoke_any: {}", self.id, err);
                    last_error = err;
                }
            }
        };

        for future in &futures {
            future.cancel();
        }
        outcome
    }

    /// The executor's lifecycle is not owned by its clients, thus it never terminates.
    /// - always returns false immediately
    pub fn await_termination(&self, _timeout: Duration) -> bool {
        false
    }

    /// Always returns false
    pub fn is_terminated(&self) -> bool {
        false
    }

    /// Always returns false
    pub fn is_shutdown(&self) -> bool {
        false
    }

    /// Does nothing. The executor's lifecycle is owned by the registry, or by whoever constructed it,
    /// and application code must not try to shut it down.
    pub fn shutdown(&self) {
        debug!("ManagedExecutor({})::shutdown: ignored", self.id);
    }

    /// Returns an empty list and takes no other action, i.e., there is no queue of pending tasks to drain.
    pub fn shutdown_now(&self) -> Vec<Task> {
        debug!("ManagedExecutor({})::shutdown_now: ignored", self.id);
        Vec::new()
    }

    /// returns the number of tasks that have been dispatched by this Executor
    pub fn task_dispatched_count(&self) -> u64 {
        self.counters.dispatched.get()
    }

    /// returns the number of dispatched tasks that the dispatcher is done with
    /// - includes tasks that panicked, and submitted tasks that were cancelled before they started
    pub fn task_completed_count(&self) -> u64 {
        self.counters.completed.get()
    }

    /// returns the number of dispatched tasks that panicked
    pub fn task_panic_count(&self) -> u64 {
        self.counters.panicked.get()
    }

    /// returns the number of tasks that the dispatcher rejected
    pub fn task_rejected_count(&self) -> u64 {
        self.counters.rejected.get()
    }

    /// returns the number of dispatched tasks that have not yet finished running
    pub fn task_active_count(&self) -> u64 {
        self.counters.active()
    }
}

fn run_fallible<F, T, E>(task: F) -> Result<T, TaskError>
where
    F: FnOnce() -> Result<T, E>,
    E: fmt::Display,
{
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TaskError::Failed(err.to_string())),
        Err(panic) => Err(TaskError::Panicked(panic_message(&*panic))),
    }
}

/// Unique Executor ID, i.e., a [ULID](https://github.com/ulid/spec)
/// - it is displayed and serialized as a ULID string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ExecutorId(pub u128);

impl ExecutorId {
    /// Generates a new unique ID
    pub fn generate() -> Self {
        ExecutorId(rusty_ulid::Ulid::generate().into())
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&rusty_ulid::Ulid::from(self.0), f)
    }
}

impl FromStr for ExecutorId {
    type Err = rusty_ulid::DecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid = rusty_ulid::Ulid::from_str(s)?;
        Ok(ExecutorId(ulid.into()))
    }
}

impl From<ExecutorId> for String {
    fn from(id: ExecutorId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ExecutorId {
    type Error = rusty_ulid::DecodingError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Executor configuration related errors
#[derive(Fail, Debug)]
pub enum ExecutorConfigError {
    /// When a ThreadPool creation failure occurs.
    #[fail(display = "Failed to create ThreadPool: {}", _0)]
    ThreadPoolCreateFailed(#[cause] io::Error),
    /// The managed context is present, but it did not provide a dispatcher.
    #[fail(display = "The managed context did not provide an async dispatcher")]
    DispatcherUnavailable,
    /// When trying to register an Executor using an ID that is already registered.
    #[fail(display = "Executor is already registered: {}", _0)]
    ExecutorAlreadyRegistered(ExecutorId),
    /// The executor config could not be parsed.
    #[fail(display = "Invalid executor config: {}", _0)]
    InvalidConfig(String),
}

/// Executor related errors
#[derive(Fail, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The dispatcher refused to accept a task.
    #[fail(display = "{}", _0)]
    DispatchRejected(#[cause] DispatchError),
    /// invoke_any was called without any tasks.
    #[fail(display = "No tasks were supplied")]
    NoTasks,
    /// None of the tasks passed to invoke_any completed successfully. The last task error is reported.
    #[fail(display = "All tasks failed: {}", _0)]
    AllTasksFailed(TaskError),
}

/// Executor config, which doubles as the executor builder.
/// - serializable, e.g., it can be loaded from the app's JSON config via [from_json](#method.from_json)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorBuilder {
    id: ExecutorId,
    #[serde(default)]
    mode: DispatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stack_size: Option<NonZeroUsize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pool_size: Option<NonZeroUsize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thread_name_prefix: Option<String>,
}

impl ExecutorBuilder {
    /// constructor
    /// - defaults to [DispatchMode::Managed](dispatch/enum.DispatchMode.html)
    pub fn new(id: ExecutorId) -> Self {
        Self {
            id,
            mode: DispatchMode::default(),
            stack_size: None,
            pool_size: None,
            thread_name_prefix: None,
        }
    }

    /// Parses the config from JSON
    pub fn from_json(json: &str) -> Result<Self, ExecutorConfigError> {
        serde_json::from_str(json).map_err(|err| ExecutorConfigError::InvalidConfig(err.to_string()))
    }

    /// Sets the dispatch mode
    pub fn set_mode(self, mode: DispatchMode) -> Self {
        let mut this = self;
        this.mode = mode;
        this
    }

    /// Sets the thread stack size
    pub fn set_stack_size(self, size: NonZeroUsize) -> Self {
        let mut this = self;
        this.stack_size = Some(size);
        this
    }

    /// Sets the thread pool size
    pub fn set_pool_size(self, size: NonZeroUsize) -> Self {
        let mut this = self;
        this.pool_size = Some(size);
        this
    }

    /// Sets the prefix used to name the thread pool's threads
    pub fn set_thread_name_prefix<S: Into<String>>(self, prefix: S) -> Self {
        let mut this = self;
        this.thread_name_prefix = Some(prefix.into());
        this
    }

    /// Returns the ExecutorId
    pub fn executor_id(&self) -> ExecutorId {
        self.id
    }

    /// Returns the dispatch mode
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Returns the thread stack size
    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size.map(NonZeroUsize::get)
    }

    /// Returns the thread pool size
    pub fn pool_size(&self) -> Option<usize> {
        self.pool_size.map(NonZeroUsize::get)
    }

    /// Returns the thread name prefix, which defaults to `{ExecutorId}-`
    pub fn thread_name_prefix(&self) -> String {
        self.thread_name_prefix
            .clone()
            .unwrap_or_else(|| format!("{}-", self.id))
    }

    /// Builds the Executor
    /// - the thread pool settings only apply to [DispatchMode::Managed](dispatch/enum.DispatchMode.html)
    pub fn build(&self) -> Result<ManagedExecutor, ExecutorConfigError> {
        match self.mode {
            DispatchMode::Managed => {
                let dispatcher = PoolDispatcher::new(self)?;
                Ok(ManagedExecutor::new(self.id, Arc::new(dispatcher)))
            }
            DispatchMode::Synchronous => Ok(ManagedExecutor::synchronous(self.id)),
        }
    }

    /// Tries to build and register the Executor with the global ExecutorRegistry
    pub fn register(&self) -> Result<ManagedExecutor, ExecutorConfigError> {
        let mut executors = EXECUTORS.write();
        if executors.executor(self.id).is_some() {
            return Err(ExecutorConfigError::ExecutorAlreadyRegistered(self.id));
        }
        executors.register(self.build()?)
    }
}
