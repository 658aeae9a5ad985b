//! Core entities stored and scheduled by the control plane.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Unique node identifier.
pub type NodeId = String;
/// Unique job identifier.
pub type JobId = String;
/// Unique evaluation identifier.
pub type EvalId = String;
/// Unique allocation identifier.
pub type AllocId = String;

/// Well-known job ID addressing the evaluation garbage collector.
pub const CORE_JOB_EVAL_GC: &str = "eval-gc";
/// Well-known job ID addressing the node garbage collector.
pub const CORE_JOB_NODE_GC: &str = "node-gc";
/// Well-known job ID addressing the job garbage collector.
pub const CORE_JOB_JOB_GC: &str = "job-gc";
/// Priority used for internal core evaluations.
pub const CORE_JOB_PRIORITY: u32 = 100;

/// Generates a fresh opaque identifier.
#[must_use]
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Node status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node has registered but is not yet ready for placements.
    Init,
    /// Node is ready to receive allocations.
    Ready,
    /// Node is unreachable or has been marked down.
    Down,
}

impl NodeStatus {
    /// Returns true if the node is in a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Down)
    }
}

/// A worker machine in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub id: NodeId,
    /// Datacenter the node belongs to.
    pub datacenter: String,
    /// Human-readable node name.
    pub name: String,
    /// Operator-assigned node class.
    pub node_class: String,
    /// Fingerprint of constraint-relevant attributes, opaque to the core.
    pub computed_class: String,
    /// Fingerprinted attributes (kernel, drivers, topology).
    pub attributes: BTreeMap<String, String>,
    /// Total resources the node advertises.
    pub resources: Resources,
    /// Resources reserved for the host itself.
    pub reserved: Resources,
    /// Current status.
    pub status: NodeStatus,
    /// Free-form detail on the current status.
    pub status_description: String,
    /// Existing allocations should migrate off; new placements are blocked.
    pub drain: bool,
    /// Index at which the node was created.
    pub create_index: u64,
    /// Index of the last modification.
    pub modify_index: u64,
}

impl Node {
    /// Validates the node before it is admitted to a write transaction.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("node ID"));
        }
        if self.name.is_empty() {
            return Err(ValidationError::MissingField("node name"));
        }
        if self.datacenter.is_empty() {
            return Err(ValidationError::MissingField("node datacenter"));
        }
        Ok(())
    }
}

/// Resources advertised by a node or demanded by a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in MHz.
    pub cpu_mhz: u32,
    /// Memory in MB.
    pub memory_mb: u32,
    /// Disk in MB.
    pub disk_mb: u32,
    /// IO operations per second.
    pub iops: u32,
    /// Network devices.
    pub networks: Vec<NetworkResource>,
}

/// A network device and the bandwidth/ports claimed on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkResource {
    /// Device name, e.g. `eth0`.
    pub device: String,
    /// CIDR block of the device.
    pub cidr: String,
    /// Address assigned on the device.
    pub ip: String,
    /// Bandwidth in Mbits.
    pub mbits: u32,
    /// Ports reserved on the device.
    pub reserved_ports: Vec<u16>,
}

/// Scheduler type of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Long-running services.
    Service,
    /// Run-to-completion workloads.
    Batch,
    /// One allocation per eligible node.
    System,
    /// Internal administrative work (garbage collection).
    #[serde(rename = "_core")]
    Core,
}

/// Job status, derived from the job's evaluations and allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No work has been placed yet.
    Pending,
    /// At least one allocation is live.
    Running,
    /// All evaluations and allocations are terminal.
    Dead,
}

impl JobStatus {
    /// Returns true if the job is in a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Dead)
    }
}

/// A workload definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Human-readable job name.
    pub name: String,
    /// Scheduler type.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Priority, 1..=100, higher dispatches first.
    pub priority: u32,
    /// Whether all task groups must be placed atomically.
    pub all_at_once: bool,
    /// Datacenters the job may be placed in.
    pub datacenters: Vec<String>,
    /// Placement constraints applying to all task groups.
    pub constraints: Vec<Constraint>,
    /// Task groups to place.
    pub task_groups: Vec<TaskGroup>,
    /// Rolling-update settings.
    pub update: UpdateStrategy,
    /// Periodic schedule, if the job launches on a timer.
    pub periodic: Option<PeriodicConfig>,
    /// Free-form metadata.
    pub meta: BTreeMap<String, String>,
    /// Derived status; maintained by the state store.
    pub status: JobStatus,
    /// Index at which the job was created.
    pub create_index: u64,
    /// Index of the last modification, including status recomputation.
    pub modify_index: u64,
    /// Index of the last user-submitted modification.
    pub job_modify_index: u64,
}

impl Job {
    /// Returns true if the job launches on a periodic schedule.
    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.periodic.as_ref().is_some_and(|p| p.enabled)
    }

    /// Returns true if the job is eligible for garbage collection.
    ///
    /// Periodic jobs are never collected while registered; their instances
    /// are ordinary batch jobs and are collected individually.
    #[must_use]
    pub fn gc_eligible(&self) -> bool {
        self.status.is_terminal() && !self.is_periodic() && self.job_type != JobType::Core
    }

    /// Validates the job before it is admitted to a write transaction.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("job ID"));
        }
        if self.name.is_empty() {
            return Err(ValidationError::MissingField("job name"));
        }
        if !(1..=100).contains(&self.priority) {
            return Err(ValidationError::InvalidPriority(self.priority));
        }
        if self.datacenters.is_empty() {
            return Err(ValidationError::MissingField("job datacenters"));
        }
        if self.task_groups.is_empty() {
            return Err(ValidationError::MissingField("job task groups"));
        }
        for (i, group) in self.task_groups.iter().enumerate() {
            if group.name.is_empty() {
                return Err(ValidationError::UnnamedTaskGroup(i));
            }
            if group.tasks.is_empty() {
                return Err(ValidationError::EmptyTaskGroup(group.name.clone()));
            }
        }
        Ok(())
    }
}

/// A placement constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Attribute the constraint examines, e.g. `${node.class}`.
    pub target: String,
    /// Comparison operand, e.g. `=`, `regexp`, `version`.
    pub operand: String,
    /// Value compared against.
    pub value: String,
}

/// A set of tasks co-located on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    /// Group name, unique within the job.
    pub name: String,
    /// Desired instance count.
    pub count: u32,
    /// Constraints applying to this group only.
    pub constraints: Vec<Constraint>,
    /// Tasks in the group.
    pub tasks: Vec<Task>,
    /// Free-form metadata.
    pub meta: BTreeMap<String, String>,
}

/// A single unit of work inside a task group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task name, unique within the group.
    pub name: String,
    /// Driver responsible for executing the task.
    pub driver: String,
    /// Driver-specific configuration.
    pub config: BTreeMap<String, String>,
    /// Environment variables injected into the task.
    pub env: BTreeMap<String, String>,
    /// Resources demanded by the task.
    pub resources: Resources,
    /// Free-form metadata.
    pub meta: BTreeMap<String, String>,
}

/// Rolling-update settings for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateStrategy {
    /// Delay between update batches, in seconds.
    pub stagger_secs: u64,
    /// Number of task groups updated in parallel.
    pub max_parallel: u32,
}

impl UpdateStrategy {
    /// Returns true if rolling updates are enabled.
    #[must_use]
    pub const fn rolling(&self) -> bool {
        self.max_parallel > 0
    }
}

/// Periodic launch schedule for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicConfig {
    /// Whether the schedule is active.
    pub enabled: bool,
    /// Cron expression evaluated in UTC.
    pub schedule: String,
}

/// Reason an evaluation was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggeredBy {
    /// A job was registered or updated.
    JobRegister,
    /// A job was deregistered.
    JobDeregister,
    /// A node joined, changed status, or changed drain mode.
    NodeUpdate,
    /// A periodic job hit its schedule.
    PeriodicJob,
    /// An operator forced garbage collection.
    ForceGc,
    /// A rolling update needs another pass.
    RollingUpdate,
    /// A failed evaluation is being retried with back-off.
    FailedFollowUp,
}

/// Evaluation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    /// Waiting to be dispatched to a scheduler.
    Pending,
    /// Produced failed placements; parked until capacity changes.
    Blocked,
    /// Scheduling finished.
    Complete,
    /// Scheduling failed.
    Failed,
    /// Superseded by another evaluation for the same job.
    Canceled,
}

impl EvalStatus {
    /// Returns true if the evaluation is in a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Canceled)
    }
}

/// An intent to schedule a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Unique evaluation identifier.
    pub id: EvalId,
    /// Dispatch priority, inherited from the job.
    pub priority: u32,
    /// Scheduler type that must process this evaluation.
    #[serde(rename = "type")]
    pub eval_type: JobType,
    /// Reason the evaluation was created.
    pub triggered_by: TriggeredBy,
    /// Job being evaluated.
    pub job_id: JobId,
    /// `job_modify_index` of the job version this evaluation saw.
    pub job_modify_index: u64,
    /// Node that triggered the evaluation, for node-update triggers.
    pub node_id: Option<NodeId>,
    /// `modify_index` of the triggering node.
    pub node_modify_index: u64,
    /// Current status.
    pub status: EvalStatus,
    /// Free-form detail on the current status.
    pub status_description: String,
    /// Delay before the broker makes the evaluation available, in
    /// milliseconds. Used by failed follow-ups for back-off.
    pub wait_millis: u64,
    /// Follow-up evaluation created from this one, if any.
    pub next_eval: Option<EvalId>,
    /// Evaluation this one follows up, if any.
    pub previous_eval: Option<EvalId>,
    /// Node classes proven feasible (`true`) or infeasible (`false`) at
    /// the last scheduling attempt. Classes absent from the map were never
    /// seen and must be re-tried.
    pub class_eligibility: BTreeMap<String, bool>,
    /// True if the job's constraints referenced attributes outside the
    /// computed-class fingerprint; such evaluations must be woken on any
    /// capacity change.
    pub escaped_computed_class: bool,
    /// Store index the scheduler snapshotted when processing.
    pub snapshot_index: u64,
    /// Index at which the evaluation was created.
    pub create_index: u64,
    /// Index of the last modification.
    pub modify_index: u64,
}

impl Evaluation {
    /// Creates a pending evaluation for a job.
    #[must_use]
    pub fn for_job(job: &Job, triggered_by: TriggeredBy) -> Self {
        Self {
            id: generate_id(),
            priority: job.priority,
            eval_type: job.job_type,
            triggered_by,
            job_id: job.id.clone(),
            job_modify_index: job.job_modify_index,
            node_id: None,
            node_modify_index: 0,
            status: EvalStatus::Pending,
            status_description: String::new(),
            wait_millis: 0,
            next_eval: None,
            previous_eval: None,
            class_eligibility: BTreeMap::new(),
            escaped_computed_class: false,
            snapshot_index: 0,
            create_index: 0,
            modify_index: 0,
        }
    }

    /// Returns true if the evaluation is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the broker should queue this evaluation.
    #[must_use]
    pub fn should_enqueue(&self) -> bool {
        self.status == EvalStatus::Pending
    }

    /// Returns true if the blocked tracker should hold this evaluation.
    #[must_use]
    pub fn should_block(&self) -> bool {
        self.status == EvalStatus::Blocked
    }

    /// Validates the evaluation before it is admitted to a write
    /// transaction.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("evaluation ID"));
        }
        if self.job_id.is_empty() {
            return Err(ValidationError::MissingField("evaluation job ID"));
        }
        Ok(())
    }
}

/// Desired state of an allocation, owned by the schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocDesiredStatus {
    /// The allocation should be running.
    Run,
    /// The allocation should be stopped.
    Stop,
    /// The allocation should be evicted to make room.
    Evict,
}

/// Observed state of an allocation, owned by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocClientStatus {
    /// The client has not started the allocation yet.
    Pending,
    /// The allocation is running.
    Running,
    /// All tasks finished successfully.
    Complete,
    /// A task failed.
    Failed,
    /// The node was lost while the allocation was live.
    Lost,
}

impl AllocClientStatus {
    /// Returns true if the client-observed state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Lost)
    }
}

/// A placement decision binding one task group to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Unique allocation identifier.
    pub id: AllocId,
    /// Evaluation that produced this placement.
    pub eval_id: EvalId,
    /// Human-readable name, `job.group[index]`.
    pub name: String,
    /// Node the task group is placed on.
    pub node_id: NodeId,
    /// Job the allocation belongs to.
    pub job_id: JobId,
    /// Task group placed.
    pub task_group: String,
    /// Resources claimed on the node.
    pub resources: Resources,
    /// Placement metrics recorded by the scheduler.
    pub metrics: AllocMetrics,
    /// Desired state, owned by the schedulers.
    pub desired_status: AllocDesiredStatus,
    /// Free-form detail on the desired state.
    pub desired_description: String,
    /// Observed state, owned by the client.
    pub client_status: AllocClientStatus,
    /// Free-form detail on the observed state.
    pub client_description: String,
    /// Per-task observed state.
    pub task_states: BTreeMap<String, TaskState>,
    /// Index of the last scheduler-driven modification.
    pub alloc_modify_index: u64,
    /// Index at which the allocation was created.
    pub create_index: u64,
    /// Index of the last modification.
    pub modify_index: u64,
}

impl Allocation {
    /// Returns true if the allocation is in a terminal state, either
    /// because the scheduler decided to stop it or because the client
    /// reported it finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.desired_status,
            AllocDesiredStatus::Stop | AllocDesiredStatus::Evict
        ) || self.client_status.is_terminal()
    }
}

/// Scheduler metrics for one placement attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocMetrics {
    /// Nodes examined.
    pub nodes_evaluated: u32,
    /// Nodes excluded by constraint filtering, by constraint.
    pub nodes_filtered: BTreeMap<String, u32>,
    /// Node classes found eligible.
    pub classes_eligible: u32,
    /// Node classes excluded by constraint filtering.
    pub classes_filtered: u32,
    /// Scoring details per candidate node.
    pub scores: BTreeMap<String, f64>,
}

/// Lifecycle of a single task inside an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLifecycle {
    /// Task has not started.
    Pending,
    /// Task is running.
    Running,
    /// Task has exited.
    Dead,
}

/// Client-reported state of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Current lifecycle stage.
    pub state: TaskLifecycle,
    /// Events leading to the current state, oldest first.
    pub events: Vec<TaskEvent>,
}

/// One event in a task's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Event kind, e.g. `started`, `driver-failure`, `killed`.
    pub kind: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Free-form detail.
    pub message: String,
}

/// Record of the last dispatch of a periodic job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicLaunch {
    /// Periodic job this record belongs to.
    pub id: JobId,
    /// Wall-clock time of the last dispatch.
    pub launch: DateTime<Utc>,
    /// Index at which the record was created.
    pub create_index: u64,
    /// Index of the last modification.
    pub modify_index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job {
            id: generate_id(),
            name: "web".to_owned(),
            job_type: JobType::Service,
            priority: 50,
            all_at_once: false,
            datacenters: vec!["dc1".to_owned()],
            constraints: Vec::new(),
            task_groups: vec![TaskGroup {
                name: "frontend".to_owned(),
                count: 3,
                constraints: Vec::new(),
                tasks: vec![Task {
                    name: "server".to_owned(),
                    driver: "exec".to_owned(),
                    config: BTreeMap::new(),
                    env: BTreeMap::new(),
                    resources: Resources::default(),
                    meta: BTreeMap::new(),
                }],
                meta: BTreeMap::new(),
            }],
            update: UpdateStrategy::default(),
            periodic: None,
            meta: BTreeMap::new(),
            status: JobStatus::Pending,
            create_index: 0,
            modify_index: 0,
            job_modify_index: 0,
        }
    }

    #[test]
    fn job_validation() {
        let job = sample_job();
        assert!(job.validate().is_ok());

        let mut bad = sample_job();
        bad.priority = 0;
        assert!(matches!(
            bad.validate(),
            Err(ValidationError::InvalidPriority(0))
        ));

        let mut bad = sample_job();
        bad.datacenters.clear();
        assert!(bad.validate().is_err());

        let mut bad = sample_job();
        bad.task_groups[0].tasks.clear();
        assert!(matches!(
            bad.validate(),
            Err(ValidationError::EmptyTaskGroup(_))
        ));
    }

    #[test]
    fn periodic_detection() {
        let mut job = sample_job();
        assert!(!job.is_periodic());

        job.periodic = Some(PeriodicConfig {
            enabled: false,
            schedule: "0 * * * * *".to_owned(),
        });
        assert!(!job.is_periodic());

        job.periodic = Some(PeriodicConfig {
            enabled: true,
            schedule: "0 * * * * *".to_owned(),
        });
        assert!(job.is_periodic());
    }

    #[test]
    fn gc_eligibility() {
        let mut job = sample_job();
        assert!(!job.gc_eligible());

        job.status = JobStatus::Dead;
        assert!(job.gc_eligible());

        job.periodic = Some(PeriodicConfig {
            enabled: true,
            schedule: "0 * * * * *".to_owned(),
        });
        assert!(!job.gc_eligible());
    }

    #[test]
    fn eval_for_job_inherits_priority_and_type() {
        let job = sample_job();
        let eval = Evaluation::for_job(&job, TriggeredBy::JobRegister);

        assert_eq!(eval.priority, job.priority);
        assert_eq!(eval.eval_type, JobType::Service);
        assert_eq!(eval.job_id, job.id);
        assert_eq!(eval.status, EvalStatus::Pending);
        assert!(eval.should_enqueue());
        assert!(!eval.should_block());
    }

    #[test]
    fn alloc_terminality() {
        let mut alloc = Allocation {
            id: generate_id(),
            eval_id: generate_id(),
            name: "web.frontend[0]".to_owned(),
            node_id: generate_id(),
            job_id: generate_id(),
            task_group: "frontend".to_owned(),
            resources: Resources::default(),
            metrics: AllocMetrics::default(),
            desired_status: AllocDesiredStatus::Run,
            desired_description: String::new(),
            client_status: AllocClientStatus::Pending,
            client_description: String::new(),
            task_states: BTreeMap::new(),
            alloc_modify_index: 0,
            create_index: 0,
            modify_index: 0,
        };
        assert!(!alloc.is_terminal());

        alloc.client_status = AllocClientStatus::Failed;
        assert!(alloc.is_terminal());

        alloc.client_status = AllocClientStatus::Running;
        alloc.desired_status = AllocDesiredStatus::Evict;
        assert!(alloc.is_terminal());
    }

    #[test]
    fn status_serialisation_tokens() {
        let json = serde_json::to_string(&JobType::Core).unwrap();
        assert_eq!(json, "\"_core\"");

        let json = serde_json::to_string(&TriggeredBy::ForceGc).unwrap();
        assert_eq!(json, "\"force-gc\"");

        let json = serde_json::to_string(&TriggeredBy::FailedFollowUp).unwrap();
        assert_eq!(json, "\"failed-follow-up\"");
    }
}
