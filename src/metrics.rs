//! # Dispatch Metrics
//!
//! OpenTelemetry instruments for manager and dispatcher activity. Instruments
//! are recorded through the global meter provider; with no exporter installed
//! the calls are no-ops.
//!
//! ## Usage
//!
//! ```rust
//! use disttask_core::metrics::*;
//! use opentelemetry::KeyValue;
//!
//! tasks_dispatched_total().add(1, &[KeyValue::new("task_type", "example")]);
//! dispatchers_running().add(1, &[]);
//! ```

use crate::state_machine::TaskState;
use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static DISTTASK_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    DISTTASK_METER.get_or_init(|| opentelemetry::global::meter("disttask"))
}

/// Tasks handed to a freshly started dispatcher
///
/// Labels:
/// - task_type: Registered task type
pub fn tasks_dispatched_total() -> Counter<u64> {
    meter()
        .u64_counter("disttask.tasks.dispatched.total")
        .with_description("Total number of tasks picked up by a dispatcher")
        .build()
}

/// Tasks failed by the manager or a dispatcher
///
/// Labels:
/// - reason: unknown_task_type, init_failed, batch_failed
pub fn tasks_failed_total() -> Counter<u64> {
    meter()
        .u64_counter("disttask.tasks.failed.total")
        .with_description("Total number of tasks moved to failed")
        .build()
}

/// Tasks reaching a terminal state through a dispatcher
///
/// Labels:
/// - state: Terminal task state
pub fn tasks_finished_total() -> Counter<u64> {
    meter()
        .u64_counter("disttask.tasks.finished.total")
        .with_description("Total number of tasks that reached a terminal state")
        .build()
}

pub fn subtasks_dispatched_total() -> Counter<u64> {
    meter()
        .u64_counter("disttask.subtasks.dispatched.total")
        .with_description("Total number of subtasks written in dispatched batches")
        .build()
}

/// Drive loops currently alive in this process
pub fn dispatchers_running() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("disttask.dispatchers.running")
        .with_description("Number of dispatcher drive loops currently running")
        .build()
}

pub(crate) fn task_type_label(task_type: &str) -> [KeyValue; 1] {
    [KeyValue::new("task_type", task_type.to_string())]
}

pub(crate) fn record_task_failed(reason: &'static str) {
    tasks_failed_total().add(1, &[KeyValue::new("reason", reason)]);
}

pub(crate) fn record_task_finished(state: TaskState) {
    tasks_finished_total().add(1, &[KeyValue::new("state", state.as_str())]);
}
