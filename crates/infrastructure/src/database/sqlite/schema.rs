/// 建表语句，按顺序执行
pub(crate) const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sched_job (
        job_id INTEGER PRIMARY KEY,
        job_group TEXT NOT NULL,
        job_name TEXT NOT NULL,
        job_type TEXT NOT NULL,
        job_state TEXT NOT NULL,
        job_executor TEXT NOT NULL,
        job_param TEXT,
        trigger_type TEXT NOT NULL,
        trigger_value TEXT NOT NULL,
        route_strategy TEXT NOT NULL,
        retry_type TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        retry_interval_ms INTEGER NOT NULL DEFAULT 0,
        last_trigger_time TEXT,
        next_trigger_time TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (job_group, job_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sched_depend (
        parent_job_id INTEGER NOT NULL,
        child_job_id INTEGER NOT NULL,
        sequence INTEGER NOT NULL,
        PRIMARY KEY (parent_job_id, child_job_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sched_instance (
        instance_id INTEGER PRIMARY KEY,
        root_instance_id INTEGER,
        parent_instance_id INTEGER,
        workflow_instance_id INTEGER,
        job_id INTEGER NOT NULL,
        trigger_time TEXT NOT NULL,
        run_type TEXT NOT NULL,
        run_state TEXT NOT NULL,
        run_start_time TEXT,
        run_end_time TEXT,
        retried_count INTEGER NOT NULL DEFAULT 0,
        retrying INTEGER NOT NULL DEFAULT 0,
        workflow_node TEXT,
        next_scan_time TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sched_task (
        task_id INTEGER PRIMARY KEY,
        instance_id INTEGER NOT NULL,
        task_no INTEGER NOT NULL,
        task_count INTEGER NOT NULL,
        task_param TEXT,
        execute_state TEXT NOT NULL,
        worker TEXT,
        start_request_id TEXT,
        dispatch_failed_count INTEGER NOT NULL DEFAULT 0,
        execute_start_time TEXT,
        execute_end_time TEXT,
        execute_snapshot TEXT,
        error_msg TEXT,
        version INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sched_workflow (
        workflow_instance_id INTEGER NOT NULL,
        pre_node TEXT NOT NULL,
        cur_node TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        run_state TEXT NOT NULL,
        instance_id INTEGER,
        PRIMARY KEY (workflow_instance_id, pre_node, cur_node)
    )
    "#,
    // 调度/依赖触发的实例不能重复创建
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uk_sched_instance_trigger
        ON sched_instance (job_id, trigger_time, run_type)
        WHERE run_type IN ('SCHEDULE', 'DEPEND')
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sched_instance_workflow ON sched_instance (workflow_instance_id)",
    "CREATE INDEX IF NOT EXISTS idx_sched_instance_parent ON sched_instance (parent_instance_id)",
    "CREATE INDEX IF NOT EXISTS idx_sched_task_instance ON sched_task (instance_id)",
    "CREATE INDEX IF NOT EXISTS idx_sched_depend_child ON sched_depend (child_job_id)",
];
