//! Worker-agent seam and job message types
//!
//! The runtime knows workers only through the [`WorkerAgent`] trait; concrete
//! transports (SSH, NIO, containers, cloud connectors) implement the same
//! message set elsewhere. A job message carries renamings, source locations,
//! the chosen implementation and the sandbox path; completions flow back via
//! [`crate::Weft::notify_completion`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use weft_core::{
    Direction, Implementation, ParamType, ResourceDescription, StdStream, TaskId, WorkerId,
};

/// Where a renaming can currently be found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub worker: WorkerId,
    pub uri: SourceUri,
}

/// Physical location of a renaming on a source worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceUri {
    /// A file path on the source worker
    File(PathBuf),
    /// An in-memory object held by the source worker's registry
    Object,
    /// A persistent storage id; any node can resolve it
    Storage(String),
    /// A binding-object handle on the source worker
    Binding(String),
}

/// One parameter of a job message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParam {
    pub name: String,
    pub param_type: ParamType,
    pub direction: Direction,
    pub stream: StdStream,
    pub prefix: Option<String>,

    /// Renaming of the value this parameter reads, if any
    pub source_renaming: Option<String>,

    /// Renaming under which the produced value must be registered, if any
    pub target_renaming: Option<String>,

    /// Known locations of the source renaming
    pub sources: Vec<DataSource>,

    /// Inline payload: the target path for files and collections, the psco /
    /// binding id, serialized bytes for by-value objects, or a primitive
    pub payload: JobPayload,

    /// Whether fetching must leave the source register intact
    pub preserve_source: bool,

    /// Sub-parameters for collections, in element order
    pub elements: Vec<JobParam>,
}

/// Inline payload of a job parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobPayload {
    /// Target path the worker must materialize the value at
    File(PathBuf),
    /// Serialized object bytes shipped with the job (by-value submission)
    Object(Vec<u8>),
    /// The id is the value
    Id(String),
    /// Primitive rendered as a JSON value
    Primitive(serde_json::Value),
    None,
}

/// A job the scheduler has placed on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub task_id: TaskId,
    pub attempt: u32,
    pub signature: String,
    pub implementation: Implementation,
    pub params: Vec<JobParam>,
    pub sandbox: PathBuf,
    /// Renamings this worker may evict before running the job
    pub obsoletes: Vec<String>,
    pub priority: i32,
}

/// Terminal status reported by a worker for one job attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobStatus {
    Done,
    Failed { error: String, retriable: bool, host_sticky: bool },
    Cancelled,
}

impl JobStatus {
    pub fn failed_from(error: &weft_core::Error) -> Self {
        JobStatus::Failed {
            error: error.to_string(),
            retriable: error.is_retriable(),
            host_sticky: error.is_host_sticky(),
        }
    }
}

/// A value produced by a job, to be registered in the location registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducedData {
    pub renaming: String,
    pub size_bytes: u64,
    /// Where the value lives on the producing worker
    pub uri: SourceUri,
}

/// Profiling record accompanying a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilingRecord {
    pub wall_ms: u64,
    pub transferred_bytes: u64,
}

/// Completion message for one job attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletion {
    pub task_id: TaskId,
    pub attempt: u32,
    pub worker: WorkerId,
    pub status: JobStatus,
    pub produced: Vec<ProducedData>,
    pub profile: ProfilingRecord,
}

/// Abstraction over a remote worker.
///
/// Implementations deliver jobs to the worker process and must eventually
/// answer every submitted job with a [`JobCompletion`] through the runtime
/// handle, including after a cancellation (status `Cancelled`).
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// Worker identifier, unique in the pool
    fn id(&self) -> WorkerId;

    /// Worker kind matched against implementation targets
    fn kind(&self) -> &str;

    /// Total resources the worker offers
    fn resources(&self) -> ResourceDescription;

    /// Deliver a job to the worker. Delivery failure means the worker is
    /// unreachable; execution failures arrive as completions instead.
    async fn submit(&self, job: JobRequest) -> weft_core::Result<()>;

    /// Fire-and-forget cancellation of a running job.
    async fn cancel(&self, task_id: TaskId) -> weft_core::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_status_carries_classification() {
        let status = JobStatus::failed_from(&weft_core::Error::WorkerUnreachable("w2".into()));
        match status {
            JobStatus::Failed {
                retriable,
                host_sticky,
                ..
            } => {
                assert!(retriable);
                assert!(host_sticky);
            }
            _ => panic!("expected Failed"),
        }
    }

    #[test]
    fn test_job_request_roundtrips_through_json() {
        let job = JobRequest {
            task_id: TaskId(9),
            attempt: 1,
            signature: "merge(FILE_T,FILE_T)".into(),
            implementation: Implementation::new(
                "merge(FILE_T,FILE_T)",
                ResourceDescription::new(2, 512),
            ),
            params: vec![JobParam {
                name: "left".into(),
                param_type: ParamType::File,
                direction: Direction::In,
                stream: StdStream::Unspecified,
                prefix: None,
                source_renaming: Some("d3_v1".into()),
                target_renaming: None,
                sources: vec![DataSource {
                    worker: WorkerId::new("w1"),
                    uri: SourceUri::File("/scratch/w1/d3_v1".into()),
                }],
                payload: JobPayload::File("/scratch/w2/d3_v1".into()),
                preserve_source: true,
                elements: Vec::new(),
            }],
            sandbox: "/scratch/w2".into(),
            obsoletes: vec!["d1_v1".into()],
            priority: 0,
        };

        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: JobRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.task_id, job.task_id);
        assert_eq!(decoded.params, job.params);
        assert_eq!(decoded.obsoletes, job.obsoletes);
    }
}
