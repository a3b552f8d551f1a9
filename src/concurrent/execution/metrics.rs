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

//! execution related metrics
//! - all metrics are labeled with the executor ID, see [EXECUTOR_ID_LABEL](constant.EXECUTOR_ID_LABEL.html)

use super::ExecutorId;
use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();

    /// Metric: Number of tasks that were handed to the executor's dispatcher
    pub(super) static ref TASK_DISPATCHED_COUNTER: IntCounterVec = register_int_counter_vec(
        TASK_DISPATCHED_COUNTER_METRIC_NAME,
        "Task dispatched count"
    );

    /// Metric: Number of dispatched tasks that the dispatcher is done with, i.e., tasks that ran,
    /// including the ones that panicked, and submitted tasks that were skipped because they were
    /// cancelled before they started
    pub(super) static ref TASK_COMPLETED_COUNTER: IntCounterVec = register_int_counter_vec(
        TASK_COMPLETED_COUNTER_METRIC_NAME,
        "Task completed count, including tasks that panicked or were cancelled before they started"
    );

    /// Metric: Number of dispatched tasks that panicked
    pub(super) static ref TASK_PANIC_COUNTER: IntCounterVec = register_int_counter_vec(
        TASK_PANIC_COUNTER_METRIC_NAME,
        "Task panic count"
    );

    /// Metric: Number of tasks that the dispatcher refused to accept
    pub(super) static ref TASK_REJECTED_COUNTER: IntCounterVec = register_int_counter_vec(
        TASK_REJECTED_COUNTER_METRIC_NAME,
        "Task rejected count"
    );

    /// Metric: Thread pool sizes, only reported for executors backed by a thread pool
    pub(super) static ref THREAD_POOL_SIZE_GAUGE: IntGaugeVec = {
        let gauge = IntGaugeVec::new(
            Opts::new(THREAD_POOL_SIZE_GAUGE_METRIC_NAME, "Thread pool size"),
            &[EXECUTOR_ID_LABEL],
        )
        .unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
}

/// Metric name for the dispatched task counter
pub const TASK_DISPATCHED_COUNTER_METRIC_NAME: &str = "executor_task_dispatched_total";
/// Metric name for the completed task counter
pub const TASK_COMPLETED_COUNTER_METRIC_NAME: &str = "executor_task_completed_total";
/// Metric name for the panicked task counter
pub const TASK_PANIC_COUNTER_METRIC_NAME: &str = "executor_task_panic_total";
/// Metric name for the rejected task counter
pub const TASK_REJECTED_COUNTER_METRIC_NAME: &str = "executor_task_rejected_total";
/// Metric name for the thread pool size gauge
pub const THREAD_POOL_SIZE_GAUGE_METRIC_NAME: &str = "executor_thread_pool_size";
/// The ExecutorId is used as the label value
pub const EXECUTOR_ID_LABEL: &str = "executor_id";

fn register_int_counter_vec(name: &str, help: &str) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), &[EXECUTOR_ID_LABEL]).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
}

/// Returns the registry that all execution metrics are registered with
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Gathers Executor related metrics
pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

/// Returns Executor related metric descriptors
pub fn metric_descs() -> Vec<&'static prometheus::core::Desc> {
    let mut descs = Vec::with_capacity(5);
    descs.extend(TASK_DISPATCHED_COUNTER.desc());
    descs.extend(TASK_COMPLETED_COUNTER.desc());
    descs.extend(TASK_PANIC_COUNTER.desc());
    descs.extend(TASK_REJECTED_COUNTER.desc());
    descs.extend(THREAD_POOL_SIZE_GAUGE.desc());
    descs
}

/// The task counters for a single executor
#[derive(Clone)]
pub(super) struct TaskCounters {
    pub(super) dispatched: IntCounter,
    pub(super) completed: IntCounter,
    pub(super) panicked: IntCounter,
    pub(super) rejected: IntCounter,
}

impl TaskCounters {
    pub(super) fn new(id: ExecutorId) -> Self {
        let id = id.to_string();
        let labels = [id.as_str()];
        Self {
            dispatched: TASK_DISPATCHED_COUNTER.with_label_values(&labels),
            completed: TASK_COMPLETED_COUNTER.with_label_values(&labels),
            panicked: TASK_PANIC_COUNTER.with_label_values(&labels),
            rejected: TASK_REJECTED_COUNTER.with_label_values(&labels),
        }
    }

    /// tasks that have been dispatched but have not yet completed
    pub(super) fn active(&self) -> u64 {
        self.dispatched
            .get()
            .saturating_sub(self.completed.get())
            .saturating_sub(self.rejected.get())
    }
}
