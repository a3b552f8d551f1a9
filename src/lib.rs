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

//! **Managed Executor** provides a familiar task execution contract (execute, submit, invoke all/any)
//! on top of a single asynchronous dispatch primitive.
//!
//! The facade never manages threads itself. Work is handed to an [AsyncDispatch](concurrent/execution/dispatch/trait.AsyncDispatch.html)
//! implementation that is chosen when the executor is constructed:
//! - a thread pool backed dispatcher, which returns as soon as the pool has accepted the task
//! - an inline dispatcher, which runs the task on the calling thread before returning
//! - a dispatcher supplied by an external runtime through a [ManagedContext](concurrent/execution/dispatch/trait.ManagedContext.html)
//!
//! ```rust
//! use managed_executor::concurrent::execution::{ExecutorBuilder, ExecutorId, DispatchMode};
//!
//! let executor = ExecutorBuilder::new(ExecutorId::generate())
//!     .set_mode(DispatchMode::Synchronous)
//!     .build()
//!     .unwrap();
//! let result = executor.submit(|| 1).unwrap();
//! assert_eq!(result.get().unwrap(), 1);
//! ```

#![allow(clippy::unreadable_literal)]
#![deny(missing_docs, missing_debug_implementations)]
#![doc(html_root_url = "https://docs.rs/managed_executor/0.1.0")]

#[allow(unused_imports)]
#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

pub mod concurrent;
pub mod logging;

#[cfg(test)]
pub(crate) fn configure_logging() {
    let config = logging::LogConfigBuilder::new(log::Level::Warn)
        .target_level(env!("CARGO_PKG_NAME"), log::Level::Debug)
        .build();
    let _ = logging::init(config);
}
