//! Prometheus metrics for the master runtime

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

lazy_static! {
    /// Total task submissions
    ///
    /// Labels:
    /// - status: "accepted", "rejected"
    pub static ref TASKS_SUBMITTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "weft_tasks_submitted_total",
        "Total number of task submissions",
        &["status"]
    )
    .expect("weft_tasks_submitted_total metric registration");

    /// Total task completions
    ///
    /// Labels:
    /// - outcome: "done", "failed", "cancelled", "retried"
    pub static ref TASKS_COMPLETED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "weft_tasks_completed_total",
        "Total number of task completions",
        &["outcome"]
    )
    .expect("weft_tasks_completed_total metric registration");

    /// Wall time of task attempts as reported by workers
    ///
    /// Labels:
    /// - outcome: "done", "failed"
    pub static ref TASK_WALL_SECONDS: HistogramVec = register_histogram_vec!(
        "weft_task_wall_seconds",
        "Wall time of task attempts",
        &["outcome"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]
    )
    .expect("weft_task_wall_seconds metric registration");

    /// Placements decided by the scheduler
    ///
    /// Labels:
    /// - policy: scheduler policy name
    pub static ref PLACEMENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "weft_placements_total",
        "Total number of scheduler placements",
        &["policy"]
    )
    .expect("weft_placements_total metric registration");

    /// Tasks currently ready but not placed
    pub static ref READY_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "weft_ready_queue_depth",
        "Number of ready actions awaiting placement"
    )
    .expect("weft_ready_queue_depth metric registration");

    /// Registered workers
    pub static ref WORKER_POOL_SIZE: IntGauge = register_int_gauge!(
        "weft_worker_pool_size",
        "Number of registered workers"
    )
    .expect("weft_worker_pool_size metric registration");
}
