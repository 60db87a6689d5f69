use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use asyncjob_core::{JobId, JobStatus, NodeId};
use asyncjob_infra::jobs::{Job, NewJob, ResourceKey};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub dispatcher: String,
    pub cmd: String,
    #[serde(default)]
    pub payload: JsonValue,
    pub instance_type: Option<String>,
    pub instance_id: Option<i64>,
    /// Parent job, for log correlation.
    pub related: Option<JobId>,
    /// Serialize against other jobs on this resource.
    pub resource: Option<ResourceRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceRequest {
    pub resource_type: String,
    pub resource_id: i64,
    /// Concurrent jobs allowed on the resource.
    #[serde(default = "default_size_limit")]
    pub size_limit: u32,
}

fn default_size_limit() -> u32 {
    1
}

impl SubmitJobRequest {
    pub fn into_parts(self) -> (NewJob, Option<(ResourceKey, u32)>) {
        let mut job = NewJob::new(self.dispatcher, self.cmd, self.payload);
        if let (Some(instance_type), Some(instance_id)) = (self.instance_type, self.instance_id) {
            job = job.with_instance(instance_type, instance_id);
        }
        if let Some(parent) = self.related {
            job = job.related_to(parent);
        }
        let resource = self.resource.map(|r| {
            (
                ResourceKey::new(r.resource_type, r.resource_id),
                r.size_limit,
            )
        });
        (job, resource)
    }
}

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    /// Stamp `last_polled` on read.
    #[serde(default)]
    pub poll: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetAcceptingRequest {
    pub accepting: bool,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub uuid: String,
    pub dispatcher: String,
    pub cmd: String,
    pub status: JobStatus,
    pub process_status: i32,
    pub result_code: i32,
    pub result: Option<JsonValue>,
    pub instance_type: Option<String>,
    pub instance_id: Option<i64>,
    pub related: Option<JobId>,
    pub init_node_id: NodeId,
    pub executing_node_id: Option<NodeId>,
    pub complete_node_id: Option<NodeId>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            uuid: job.uuid.to_string(),
            dispatcher: job.dispatcher,
            cmd: job.cmd,
            status: job.status,
            process_status: job.process_status,
            result_code: job.result_code,
            result: job.result,
            instance_type: job.instance_type,
            instance_id: job.instance_id,
            related: job.related,
            init_node_id: job.init_node_id,
            executing_node_id: job.executing_node_id,
            complete_node_id: job.complete_node_id,
            created: job.created,
            last_updated: job.last_updated,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AcceptingResponse {
    pub node_id: NodeId,
    pub accepting: bool,
}
