//! 数据行到领域实体的映射，枚举以字符串编码存储

use std::str::FromStr;

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{DagNode, Instance, Job, JobDepend, Task, Worker, WorkflowEdge};

fn parse_column<T>(row: &SqliteRow, column: &str) -> SchedulerResult<T>
where
    T: FromStr<Err = SchedulerError>,
{
    let value: String = row.try_get(column)?;
    value.parse()
}

fn parse_optional_column<T>(row: &SqliteRow, column: &str) -> SchedulerResult<Option<T>>
where
    T: FromStr<Err = SchedulerError>,
{
    let value: Option<String> = row.try_get(column)?;
    value.map(|v| v.parse()).transpose()
}

pub(crate) fn row_to_job(row: &SqliteRow) -> SchedulerResult<Job> {
    Ok(Job {
        job_id: row.try_get("job_id")?,
        group: row.try_get("job_group")?,
        job_name: row.try_get("job_name")?,
        job_type: parse_column(row, "job_type")?,
        job_state: parse_column(row, "job_state")?,
        job_executor: row.try_get("job_executor")?,
        job_param: row.try_get("job_param")?,
        trigger_type: parse_column(row, "trigger_type")?,
        trigger_value: row.try_get("trigger_value")?,
        route_strategy: parse_column(row, "route_strategy")?,
        retry_type: parse_column(row, "retry_type")?,
        retry_count: row.try_get("retry_count")?,
        retry_interval_ms: row.try_get("retry_interval_ms")?,
        last_trigger_time: row.try_get("last_trigger_time")?,
        next_trigger_time: row.try_get("next_trigger_time")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn row_to_depend(row: &SqliteRow) -> SchedulerResult<JobDepend> {
    Ok(JobDepend {
        parent_job_id: row.try_get("parent_job_id")?,
        child_job_id: row.try_get("child_job_id")?,
        sequence: row.try_get("sequence")?,
    })
}

pub(crate) fn row_to_instance(row: &SqliteRow) -> SchedulerResult<Instance> {
    Ok(Instance {
        instance_id: row.try_get("instance_id")?,
        root_instance_id: row.try_get("root_instance_id")?,
        parent_instance_id: row.try_get("parent_instance_id")?,
        workflow_instance_id: row.try_get("workflow_instance_id")?,
        job_id: row.try_get("job_id")?,
        trigger_time: row.try_get("trigger_time")?,
        run_type: parse_column(row, "run_type")?,
        run_state: parse_column(row, "run_state")?,
        run_start_time: row.try_get("run_start_time")?,
        run_end_time: row.try_get("run_end_time")?,
        retried_count: row.try_get("retried_count")?,
        retrying: row.try_get("retrying")?,
        workflow_node: parse_optional_column::<DagNode>(row, "workflow_node")?,
        next_scan_time: row.try_get("next_scan_time")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
    Ok(Task {
        task_id: row.try_get("task_id")?,
        instance_id: row.try_get("instance_id")?,
        task_no: row.try_get("task_no")?,
        task_count: row.try_get("task_count")?,
        task_param: row.try_get("task_param")?,
        execute_state: parse_column(row, "execute_state")?,
        worker: parse_optional_column::<Worker>(row, "worker")?,
        start_request_id: row.try_get("start_request_id")?,
        dispatch_failed_count: row.try_get("dispatch_failed_count")?,
        execute_start_time: row.try_get("execute_start_time")?,
        execute_end_time: row.try_get("execute_end_time")?,
        execute_snapshot: row.try_get("execute_snapshot")?,
        error_msg: row.try_get("error_msg")?,
        version: row.try_get("version")?,
    })
}

pub(crate) fn row_to_edge(row: &SqliteRow) -> SchedulerResult<WorkflowEdge> {
    Ok(WorkflowEdge {
        workflow_instance_id: row.try_get("workflow_instance_id")?,
        pre_node: parse_column(row, "pre_node")?,
        cur_node: parse_column(row, "cur_node")?,
        sequence: row.try_get("sequence")?,
        run_state: parse_column(row, "run_state")?,
        instance_id: row.try_get("instance_id")?,
    })
}

/// `IN` 子句的占位符
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// 把唯一约束冲突转换为Conflict
pub(crate) fn map_insert_error(err: sqlx::Error, what: impl std::fmt::Display) -> SchedulerError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            SchedulerError::conflict(format!("{what}: {db}"))
        }
        _ => SchedulerError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
