//! 测试数据构建器，提供合理的默认值

use chrono::{DateTime, Utc};

use scheduler_domain::{
    DagNode, ExecuteState, Instance, Job, JobState, JobType, RetryType, RouteStrategy, RunState,
    RunType, Task, TriggerType, Worker,
};

pub const DEFAULT_GROUP: &str = "default";

/// 作业构建器，默认是每小时执行一次的普通作业
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            job: Job {
                job_id: 0,
                group: DEFAULT_GROUP.to_string(),
                job_name: "test-job".to_string(),
                job_type: JobType::General,
                job_state: JobState::Enabled,
                job_executor: "TestExecutor".to_string(),
                job_param: None,
                trigger_type: TriggerType::Cron,
                trigger_value: "0 0 * * * *".to_string(),
                route_strategy: RouteStrategy::RoundRobin,
                retry_type: RetryType::None,
                retry_count: 0,
                retry_interval_ms: 0,
                last_trigger_time: None,
                next_trigger_time: None,
                version: 1,
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn with_id(mut self, job_id: i64) -> Self {
        self.job.job_id = job_id;
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.job.group = group.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.job.job_name = name.to_string();
        self
    }

    pub fn with_executor(mut self, executor: &str) -> Self {
        self.job.job_executor = executor.to_string();
        self
    }

    /// 工作流作业，执行器为DAG表达式
    pub fn with_workflow(mut self, expression: &str) -> Self {
        self.job.job_type = JobType::Workflow;
        self.job.job_executor = expression.to_string();
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.job.job_state = state;
        self
    }

    pub fn with_param(mut self, param: &str) -> Self {
        self.job.job_param = Some(param.to_string());
        self
    }

    pub fn with_trigger(mut self, trigger_type: TriggerType, value: &str) -> Self {
        self.job.trigger_type = trigger_type;
        self.job.trigger_value = value.to_string();
        self
    }

    pub fn with_route_strategy(mut self, route_strategy: RouteStrategy) -> Self {
        self.job.route_strategy = route_strategy;
        self
    }

    pub fn with_retry(mut self, retry_type: RetryType, retry_count: i32, retry_interval_ms: i64) -> Self {
        self.job.retry_type = retry_type;
        self.job.retry_count = retry_count;
        self.job.retry_interval_ms = retry_interval_ms;
        self
    }

    pub fn with_trigger_times(
        mut self,
        last: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> Self {
        self.job.last_trigger_time = last;
        self.job.next_trigger_time = next;
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InstanceBuilder {
    instance: Instance,
}

impl InstanceBuilder {
    pub fn new(instance_id: i64, job_id: i64) -> Self {
        Self {
            instance: Instance::new(instance_id, job_id, RunType::Manual, Utc::now(), 0),
        }
    }

    pub fn with_run_type(mut self, run_type: RunType) -> Self {
        self.instance.run_type = run_type;
        self
    }

    pub fn with_run_state(mut self, run_state: RunState) -> Self {
        self.instance.run_state = run_state;
        if run_state.is_terminal() {
            self.instance.run_end_time = Some(Utc::now());
        }
        self
    }

    pub fn with_trigger_time(mut self, trigger_time: DateTime<Utc>) -> Self {
        self.instance.trigger_time = trigger_time;
        self
    }

    pub fn with_retried_count(mut self, retried_count: i32) -> Self {
        self.instance.retried_count = retried_count;
        self
    }

    pub fn with_parent(mut self, root_instance_id: i64, parent_instance_id: i64) -> Self {
        self.instance.root_instance_id = Some(root_instance_id);
        self.instance.parent_instance_id = Some(parent_instance_id);
        self
    }

    pub fn with_retrying(mut self, retrying: bool) -> Self {
        self.instance.retrying = retrying;
        self
    }

    /// 工作流节点实例
    pub fn with_workflow_node(mut self, workflow_instance_id: i64, node: &str) -> Self {
        self.instance.workflow_instance_id = Some(workflow_instance_id);
        self.instance.workflow_node = Some(DagNode::node(node));
        self
    }

    pub fn build(self) -> Instance {
        self.instance
    }
}

pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(task_id: i64, instance_id: i64) -> Self {
        Self {
            task: Task::new(task_id, instance_id, 1, 1, None, None),
        }
    }

    pub fn with_task_no(mut self, task_no: i32, task_count: i32) -> Self {
        self.task.task_no = task_no;
        self.task.task_count = task_count;
        self
    }

    pub fn with_state(mut self, state: ExecuteState) -> Self {
        self.task.execute_state = state;
        if state.is_terminal() {
            self.task.execute_end_time = Some(Utc::now());
        }
        self
    }

    pub fn with_worker(mut self, worker: Worker) -> Self {
        self.task.worker = Some(worker);
        self
    }

    pub fn with_param(mut self, param: &str) -> Self {
        self.task.task_param = Some(param.to_string());
        self
    }

    pub fn with_start_request_id(mut self, start_request_id: &str) -> Self {
        self.task.start_request_id = Some(start_request_id.to_string());
        self
    }

    pub fn with_dispatch_failed_count(mut self, count: i32) -> Self {
        self.task.dispatch_failed_count = count;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

pub struct WorkerBuilder {
    group: String,
    worker_id: String,
    host: String,
    port: u16,
}

impl WorkerBuilder {
    pub fn new(worker_id: &str) -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            worker_id: worker_id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn build(self) -> Worker {
        Worker::new(self.group, self.worker_id, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_builder_defaults() {
        let job = JobBuilder::new().with_id(7).build();
        assert_eq!(job.job_id, 7);
        assert_eq!(job.group, DEFAULT_GROUP);
        assert!(job.is_enabled());
        assert!(!job.is_workflow());
        assert!(!job.is_retryable());
    }

    #[test]
    fn test_workflow_builders() {
        let job = JobBuilder::new().with_workflow("A -> B").build();
        assert!(job.is_workflow());

        let node = InstanceBuilder::new(2, 1).with_workflow_node(1, "A").build();
        assert!(node.is_workflow_node());
        assert_eq!(node.lock_id(), 1);
    }

    #[test]
    fn test_terminal_builders_set_end_time() {
        let task = TaskBuilder::new(1, 1).with_state(ExecuteState::Completed).build();
        assert!(task.execute_end_time.is_some());
        let instance = InstanceBuilder::new(1, 1).with_run_state(RunState::Canceled).build();
        assert!(instance.run_end_time.is_some());
        assert_eq!(WorkerBuilder::new("w1").with_port(9000).build().port, 9000);
    }
}
