use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection};
use tracing::{debug, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    DagNode, DependRepository, ExecuteState, Instance, InstanceRepository, Job, JobDepend,
    JobRepository, JobState, RunState, Savepoint, Task, TaskRepository, Transaction, Worker,
    WorkflowEdge, WorkflowRepository,
};

use super::mapping::{
    map_insert_error, placeholders, row_to_depend, row_to_edge, row_to_instance, row_to_job,
    row_to_task,
};

const INSTANCE_COLUMNS: &str = "instance_id, root_instance_id, parent_instance_id, workflow_instance_id, \
    job_id, trigger_time, run_type, run_state, run_start_time, run_end_time, retried_count, retrying, \
    workflow_node, next_scan_time, version, created_at, updated_at";

const TASK_COLUMNS: &str = "task_id, instance_id, task_no, task_count, task_param, execute_state, worker, \
    start_request_id, dispatch_failed_count, execute_start_time, execute_end_time, execute_snapshot, \
    error_msg, version";

/// SQLite事务，保存点使用 `SAVEPOINT sp_N` 语句
pub struct SqliteTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
    depth: u32,
}

impl SqliteTransaction {
    pub(crate) fn new(tx: sqlx::Transaction<'static, Sqlite>) -> Self {
        Self { tx: Some(tx), depth: 0 }
    }

    fn conn(&mut self) -> SchedulerResult<&mut SqliteConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| SchedulerError::illegal_state("事务已结束"))
    }

    fn check_savepoint(&self, savepoint: Savepoint) -> SchedulerResult<()> {
        if savepoint.0 == 0 || savepoint.0 > self.depth {
            return Err(SchedulerError::illegal_state(format!("无效的保存点: {savepoint:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for SqliteTransaction {
    async fn get_job(&mut self, job_id: i64) -> SchedulerResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM sched_job WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_jobs(&mut self, job_ids: &[i64]) -> SchedulerResult<Vec<Job>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM sched_job WHERE job_id IN ({}) ORDER BY job_id",
            placeholders(job_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in job_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.conn()?).await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn exists_job_name(&mut self, group: &str, job_name: &str) -> SchedulerResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sched_job WHERE job_group = ? AND job_name = ?")
                .bind(group)
                .bind(job_name)
                .fetch_one(self.conn()?)
                .await?;
        Ok(count > 0)
    }

    async fn insert_job(&mut self, job: &Job) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sched_job (job_id, job_group, job_name, job_type, job_state, job_executor,
                job_param, trigger_type, trigger_value, route_strategy, retry_type, retry_count,
                retry_interval_ms, last_trigger_time, next_trigger_time, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.job_id)
        .bind(&job.group)
        .bind(&job.job_name)
        .bind(job.job_type.as_str())
        .bind(job.job_state.as_str())
        .bind(&job.job_executor)
        .bind(&job.job_param)
        .bind(job.trigger_type.as_str())
        .bind(&job.trigger_value)
        .bind(job.route_strategy.as_str())
        .bind(job.retry_type.as_str())
        .bind(job.retry_count)
        .bind(job.retry_interval_ms)
        .bind(job.last_trigger_time)
        .bind(job.next_trigger_time)
        .bind(job.version)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.conn()?)
        .await
        .map_err(|e| map_insert_error(e, format!("作业已存在: {}", job.job_id)))?;
        debug!("作业已保存: {} ({})", job.job_name, job.job_id);
        Ok(())
    }

    async fn update_job_state(
        &mut self,
        job_id: i64,
        to_state: JobState,
        from_state: JobState,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE sched_job SET job_state = ?, version = version + 1, updated_at = ? \
             WHERE job_id = ? AND job_state = ?",
        )
        .bind(to_state.as_str())
        .bind(Utc::now())
        .bind(job_id)
        .bind(from_state.as_str())
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_next_trigger_time(
        &mut self,
        job_id: i64,
        expect_next: Option<DateTime<Utc>>,
        last_trigger_time: Option<DateTime<Utc>>,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE sched_job SET last_trigger_time = ?, next_trigger_time = ?, \
             version = version + 1, updated_at = ? \
             WHERE job_id = ? AND next_trigger_time IS ?",
        )
        .bind(last_trigger_time)
        .bind(next_trigger_time)
        .bind(Utc::now())
        .bind(job_id)
        .bind(expect_next)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_fixed_next_trigger_time(
        &mut self,
        job_id: i64,
        next_trigger_time: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE sched_job SET next_trigger_time = ?, version = version + 1, updated_at = ? \
             WHERE job_id = ? AND job_state = ?",
        )
        .bind(next_trigger_time)
        .bind(Utc::now())
        .bind(job_id)
        .bind(JobState::Enabled.as_str())
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_job(&mut self, job_id: i64) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM sched_job WHERE job_id = ? AND job_state = ?")
            .bind(job_id)
            .bind(JobState::Disabled.as_str())
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DependRepository for SqliteTransaction {
    async fn insert_depends(&mut self, depends: &[JobDepend]) -> SchedulerResult<()> {
        for depend in depends {
            sqlx::query(
                "INSERT INTO sched_depend (parent_job_id, child_job_id, sequence) VALUES (?, ?, ?)",
            )
            .bind(depend.parent_job_id)
            .bind(depend.child_job_id)
            .bind(depend.sequence)
            .execute(self.conn()?)
            .await
            .map_err(|e| {
                map_insert_error(
                    e,
                    format!("依赖关系已存在: {} -> {}", depend.parent_job_id, depend.child_job_id),
                )
            })?;
        }
        Ok(())
    }

    async fn find_by_parent_job_id(&mut self, parent_job_id: i64) -> SchedulerResult<Vec<JobDepend>> {
        let rows = sqlx::query("SELECT * FROM sched_depend WHERE parent_job_id = ? ORDER BY child_job_id")
            .bind(parent_job_id)
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(row_to_depend).collect()
    }

    async fn find_by_child_job_ids(&mut self, child_job_ids: &[i64]) -> SchedulerResult<Vec<JobDepend>> {
        if child_job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM sched_depend WHERE child_job_id IN ({}) ORDER BY child_job_id, sequence",
            placeholders(child_job_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in child_job_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.conn()?).await?;
        rows.iter().map(row_to_depend).collect()
    }

    async fn delete_depends_by_job_id(&mut self, job_id: i64) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM sched_depend WHERE parent_job_id = ? OR child_job_id = ?")
            .bind(job_id)
            .bind(job_id)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl InstanceRepository for SqliteTransaction {
    async fn get_instance(&mut self, instance_id: i64) -> SchedulerResult<Option<Instance>> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM sched_instance WHERE instance_id = ?");
        let row = sqlx::query(&sql)
            .bind(instance_id)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_instance).transpose()
    }

    async fn lock_instance(&mut self, instance_id: i64) -> SchedulerResult<Option<Instance>> {
        // SQLite没有行锁，空更新即可取得数据库写锁
        let result = sqlx::query("UPDATE sched_instance SET version = version WHERE instance_id = ?")
            .bind(instance_id)
            .execute(self.conn()?)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_instance(instance_id).await
    }

    async fn insert_instance(&mut self, instance: &Instance) -> SchedulerResult<()> {
        let sql = format!(
            "INSERT INTO sched_instance ({INSTANCE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(instance.instance_id)
            .bind(instance.root_instance_id)
            .bind(instance.parent_instance_id)
            .bind(instance.workflow_instance_id)
            .bind(instance.job_id)
            .bind(instance.trigger_time)
            .bind(instance.run_type.as_str())
            .bind(instance.run_state.as_str())
            .bind(instance.run_start_time)
            .bind(instance.run_end_time)
            .bind(instance.retried_count)
            .bind(instance.retrying)
            .bind(instance.workflow_node.as_ref().map(|n| n.to_string()))
            .bind(instance.next_scan_time)
            .bind(instance.version)
            .bind(instance.created_at)
            .bind(instance.updated_at)
            .execute(self.conn()?)
            .await
            .map_err(|e| {
                map_insert_error(
                    e,
                    format!(
                        "实例唯一键冲突: {}, {}, {}",
                        instance.job_id, instance.trigger_time, instance.run_type
                    ),
                )
            })?;
        Ok(())
    }

    async fn start_instance(&mut self, instance_id: i64, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE sched_instance SET run_state = ?, run_start_time = COALESCE(run_start_time, ?), \
             version = version + 1, updated_at = ? WHERE instance_id = ? AND run_state = ?",
        )
        .bind(RunState::Running.as_str())
        .bind(now)
        .bind(Utc::now())
        .bind(instance_id)
        .bind(RunState::Waiting.as_str())
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn terminate_instance(
        &mut self,
        instance_id: i64,
        to_state: RunState,
        from_states: &[RunState],
        run_end_time: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        if from_states.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE sched_instance SET run_state = ?, run_end_time = COALESCE(?, run_end_time), \
             version = version + 1, updated_at = ? WHERE instance_id = ? AND run_state IN ({})",
            placeholders(from_states.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to_state.as_str())
            .bind(to_state.is_terminal().then_some(run_end_time))
            .bind(Utc::now())
            .bind(instance_id);
        for state in from_states {
            query = query.bind(state.as_str());
        }
        Ok(query.execute(self.conn()?).await?.rows_affected() > 0)
    }

    async fn update_instance_state(
        &mut self,
        instance_id: i64,
        to_state: RunState,
        from_states: &[RunState],
    ) -> SchedulerResult<bool> {
        if from_states.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE sched_instance SET run_state = ?, \
             run_end_time = CASE WHEN ? THEN run_end_time ELSE NULL END, \
             version = version + 1, updated_at = ? WHERE instance_id = ? AND run_state IN ({})",
            placeholders(from_states.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to_state.as_str())
            .bind(to_state.is_terminal())
            .bind(Utc::now())
            .bind(instance_id);
        for state in from_states {
            query = query.bind(state.as_str());
        }
        Ok(query.execute(self.conn()?).await?.rows_affected() > 0)
    }

    async fn update_next_scan_time(
        &mut self,
        instance_id: i64,
        next_scan_time: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE sched_instance SET next_scan_time = ?, version = version + 1, updated_at = ? \
             WHERE instance_id = ?",
        )
        .bind(next_scan_time)
        .bind(Utc::now())
        .bind(instance_id)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_retrying(
        &mut self,
        instance_id: i64,
        retrying: bool,
        to_state: RunState,
        from_state: RunState,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE sched_instance SET retrying = ?, run_state = ?, version = version + 1, updated_at = ? \
             WHERE instance_id = ? AND run_state = ? AND retrying <> ?",
        )
        .bind(retrying)
        .bind(to_state.as_str())
        .bind(Utc::now())
        .bind(instance_id)
        .bind(from_state.as_str())
        .bind(retrying)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_workflow_nodes(&mut self, workflow_instance_id: i64) -> SchedulerResult<Vec<Instance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM sched_instance \
             WHERE workflow_instance_id = ? AND instance_id <> ? ORDER BY instance_id"
        );
        let rows = sqlx::query(&sql)
            .bind(workflow_instance_id)
            .bind(workflow_instance_id)
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(row_to_instance).collect()
    }

    async fn find_retry_children(&mut self, parent_instance_id: i64) -> SchedulerResult<Vec<Instance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM sched_instance \
             WHERE parent_instance_id = ? AND run_type = ? ORDER BY instance_id"
        );
        let rows = sqlx::query(&sql)
            .bind(parent_instance_id)
            .bind(scheduler_domain::RunType::Retry.as_str())
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(row_to_instance).collect()
    }

    async fn delete_instance(&mut self, instance_id: i64) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM sched_instance WHERE instance_id = ?")
            .bind(instance_id)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TaskRepository for SqliteTransaction {
    async fn get_task(&mut self, task_id: i64) -> SchedulerResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM sched_task WHERE task_id = ?");
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn find_tasks(&mut self, instance_id: i64) -> SchedulerResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM sched_task WHERE instance_id = ? ORDER BY task_no");
        let rows = sqlx::query(&sql)
            .bind(instance_id)
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn insert_tasks(&mut self, tasks: &[Task]) -> SchedulerResult<()> {
        let sql = format!(
            "INSERT INTO sched_task ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        for task in tasks {
            sqlx::query(&sql)
                .bind(task.task_id)
                .bind(task.instance_id)
                .bind(task.task_no)
                .bind(task.task_count)
                .bind(&task.task_param)
                .bind(task.execute_state.as_str())
                .bind(task.worker.as_ref().map(Worker::serialize))
                .bind(&task.start_request_id)
                .bind(task.dispatch_failed_count)
                .bind(task.execute_start_time)
                .bind(task.execute_end_time)
                .bind(&task.execute_snapshot)
                .bind(&task.error_msg)
                .bind(task.version)
                .execute(self.conn()?)
                .await
                .map_err(|e| map_insert_error(e, format!("任务ID已存在: {}", task.task_id)))?;
        }
        Ok(())
    }

    async fn start_task(
        &mut self,
        task_id: i64,
        worker: &Worker,
        start_request_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE sched_task SET execute_state = ?, worker = ?, start_request_id = ?, \
             execute_start_time = ?, version = version + 1 WHERE task_id = ? AND execute_state = ?",
        )
        .bind(ExecuteState::Executing.as_str())
        .bind(worker.serialize())
        .bind(start_request_id)
        .bind(now)
        .bind(task_id)
        .bind(ExecuteState::Waiting.as_str())
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn check_start_idempotent(
        &mut self,
        task_id: i64,
        worker: &Worker,
        start_request_id: &str,
    ) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sched_task \
             WHERE task_id = ? AND execute_state = ? AND worker = ? AND start_request_id = ?",
        )
        .bind(task_id)
        .bind(ExecuteState::Executing.as_str())
        .bind(worker.serialize())
        .bind(start_request_id)
        .fetch_one(self.conn()?)
        .await?;
        Ok(count > 0)
    }

    async fn terminate_task(
        &mut self,
        task_id: i64,
        worker: Option<&Worker>,
        to_state: ExecuteState,
        from_state: ExecuteState,
        execute_end_time: Option<DateTime<Utc>>,
        error_msg: Option<&str>,
    ) -> SchedulerResult<bool> {
        let worker = worker.map(Worker::serialize);
        let result = sqlx::query(
            "UPDATE sched_task SET execute_state = ?, execute_end_time = ?, \
             error_msg = COALESCE(?, error_msg), version = version + 1 \
             WHERE task_id = ? AND execute_state = ? AND (? IS NULL OR worker = ?)",
        )
        .bind(to_state.as_str())
        .bind(execute_end_time)
        .bind(error_msg)
        .bind(task_id)
        .bind(from_state.as_str())
        .bind(&worker)
        .bind(&worker)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_tasks_state(
        &mut self,
        instance_id: i64,
        to_state: ExecuteState,
        from_states: &[ExecuteState],
        execute_end_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<u64> {
        if from_states.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE sched_task SET execute_state = ?, execute_end_time = ?, version = version + 1 \
             WHERE instance_id = ? AND execute_state IN ({})",
            placeholders(from_states.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to_state.as_str())
            .bind(execute_end_time)
            .bind(instance_id);
        for state in from_states {
            query = query.bind(state.as_str());
        }
        Ok(query.execute(self.conn()?).await?.rows_affected())
    }

    async fn force_change_tasks_state(
        &mut self,
        instance_id: i64,
        to_state: ExecuteState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE sched_task SET execute_state = ?, execute_end_time = ?, dispatch_failed_count = 0, \
             start_request_id = NULL, version = version + 1 WHERE instance_id = ?",
        )
        .bind(to_state.as_str())
        .bind(to_state.is_terminal().then(Utc::now))
        .bind(instance_id)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected())
    }

    async fn increment_dispatch_failed_count(
        &mut self,
        task_id: i64,
        current_count: i32,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE sched_task SET dispatch_failed_count = dispatch_failed_count + 1, version = version + 1 \
             WHERE task_id = ? AND execute_state = ? AND dispatch_failed_count = ?",
        )
        .bind(task_id)
        .bind(ExecuteState::Waiting.as_str())
        .bind(current_count)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn savepoint_task(
        &mut self,
        task_id: i64,
        worker: &Worker,
        execute_snapshot: &str,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE sched_task SET execute_snapshot = ?, version = version + 1 \
             WHERE task_id = ? AND execute_state = ? AND worker = ?",
        )
        .bind(execute_snapshot)
        .bind(task_id)
        .bind(ExecuteState::Executing.as_str())
        .bind(worker.serialize())
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_tasks(&mut self, instance_id: i64) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM sched_task WHERE instance_id = ?")
            .bind(instance_id)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WorkflowRepository for SqliteTransaction {
    async fn insert_edges(&mut self, edges: &[WorkflowEdge]) -> SchedulerResult<()> {
        for edge in edges {
            sqlx::query(
                "INSERT INTO sched_workflow (workflow_instance_id, pre_node, cur_node, sequence, run_state, instance_id) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(edge.workflow_instance_id)
            .bind(edge.pre_node.to_string())
            .bind(edge.cur_node.to_string())
            .bind(edge.sequence)
            .bind(edge.run_state.as_str())
            .bind(edge.instance_id)
            .execute(self.conn()?)
            .await
            .map_err(|e| {
                map_insert_error(
                    e,
                    format!(
                        "工作流边已存在: {}, {} -> {}",
                        edge.workflow_instance_id, edge.pre_node, edge.cur_node
                    ),
                )
            })?;
        }
        Ok(())
    }

    async fn find_edges(&mut self, workflow_instance_id: i64) -> SchedulerResult<Vec<WorkflowEdge>> {
        let rows = sqlx::query(
            "SELECT * FROM sched_workflow WHERE workflow_instance_id = ? ORDER BY sequence",
        )
        .bind(workflow_instance_id)
        .fetch_all(self.conn()?)
        .await?;
        rows.iter().map(row_to_edge).collect()
    }

    async fn update_node_state(
        &mut self,
        workflow_instance_id: i64,
        cur_node: &DagNode,
        to_state: RunState,
        from_states: &[RunState],
        instance_id: Option<i64>,
    ) -> SchedulerResult<u64> {
        if from_states.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE sched_workflow SET run_state = ?, instance_id = COALESCE(?, instance_id) \
             WHERE workflow_instance_id = ? AND cur_node = ? AND run_state IN ({})",
            placeholders(from_states.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to_state.as_str())
            .bind(instance_id)
            .bind(workflow_instance_id)
            .bind(cur_node.to_string());
        for state in from_states {
            query = query.bind(state.as_str());
        }
        Ok(query.execute(self.conn()?).await?.rows_affected())
    }

    async fn update_edges_state(
        &mut self,
        workflow_instance_id: i64,
        to_state: RunState,
        from_states: &[RunState],
    ) -> SchedulerResult<u64> {
        if from_states.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE sched_workflow SET run_state = ? WHERE workflow_instance_id = ? AND run_state IN ({})",
            placeholders(from_states.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to_state.as_str())
            .bind(workflow_instance_id);
        for state in from_states {
            query = query.bind(state.as_str());
        }
        Ok(query.execute(self.conn()?).await?.rows_affected())
    }

    async fn resume_waiting_edges(&mut self, workflow_instance_id: i64) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE sched_workflow SET run_state = ? \
             WHERE workflow_instance_id = ? AND run_state = ? AND instance_id IS NULL",
        )
        .bind(RunState::Waiting.as_str())
        .bind(workflow_instance_id)
        .bind(RunState::Paused.as_str())
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected())
    }

    async fn replace_node_instance(
        &mut self,
        workflow_instance_id: i64,
        cur_node: &DagNode,
        from_instance_id: i64,
        to_instance_id: i64,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE sched_workflow SET instance_id = ? \
             WHERE workflow_instance_id = ? AND cur_node = ? AND run_state = ? AND instance_id = ?",
        )
        .bind(to_instance_id)
        .bind(workflow_instance_id)
        .bind(cur_node.to_string())
        .bind(RunState::Running.as_str())
        .bind(from_instance_id)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_edges(&mut self, workflow_instance_id: i64) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM sched_workflow WHERE workflow_instance_id = ?")
            .bind(workflow_instance_id)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn savepoint(&mut self) -> SchedulerResult<Savepoint> {
        let depth = self.depth + 1;
        sqlx::query(&format!("SAVEPOINT sp_{depth}"))
            .execute(self.conn()?)
            .await?;
        self.depth = depth;
        Ok(Savepoint(depth))
    }

    async fn release_savepoint(&mut self, savepoint: Savepoint) -> SchedulerResult<()> {
        self.check_savepoint(savepoint)?;
        sqlx::query(&format!("RELEASE SAVEPOINT sp_{}", savepoint.0))
            .execute(self.conn()?)
            .await?;
        self.depth = savepoint.0 - 1;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, savepoint: Savepoint) -> SchedulerResult<()> {
        self.check_savepoint(savepoint)?;
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT sp_{}", savepoint.0))
            .execute(self.conn()?)
            .await?;
        self.depth = savepoint.0;
        Ok(())
    }

    async fn commit(&mut self) -> SchedulerResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SchedulerError::illegal_state("事务已结束"))?;
        tx.commit().await?;
        self.depth = 0;
        Ok(())
    }

    async fn rollback(&mut self) -> SchedulerResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SchedulerError::illegal_state("事务已结束"))?;
        tx.rollback().await?;
        self.depth = 0;
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.tx.is_some() {
            // sqlx会在连接归还时回滚
            warn!("事务未提交即被释放，回滚全部修改");
        }
    }
}
