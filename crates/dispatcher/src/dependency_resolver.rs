use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{DependRepository, Instance, JobDepend, JobRepository, RunState, RunType};

use crate::instance_creator::InstanceCreator;
use crate::tx_scope::TxScope;

/// 父作业实例完成后触发子作业
pub struct DependencyResolver {
    creator: Arc<InstanceCreator>,
}

impl DependencyResolver {
    pub fn new(creator: Arc<InstanceCreator>) -> Self {
        Self { creator }
    }

    /// 为已完成实例的每个子作业创建DEPEND实例，单个子作业失败只记录日志
    pub async fn trigger_children(&self, scope: &mut TxScope, parent: &Instance) -> SchedulerResult<()> {
        if parent.is_workflow_node() || parent.run_state != RunState::Completed {
            return Ok(());
        }
        for depend in scope.find_by_parent_job_id(parent.job_id).await? {
            if let Err(e) = self.trigger_child(scope, parent, &depend).await {
                error!(
                    "触发依赖作业失败: {} -> {}, {}, {}",
                    depend.parent_job_id, depend.child_job_id, parent.instance_id, e
                );
            }
        }
        Ok(())
    }

    async fn trigger_child(&self, scope: &mut TxScope, parent: &Instance, depend: &JobDepend) -> SchedulerResult<()> {
        let child = scope
            .get_job(depend.child_job_id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(depend.child_job_id))?;
        if !child.is_enabled() {
            warn!("依赖的子作业已停用: {}", child.job_id);
            return Ok(());
        }

        // 多个父作业同时完成时按序号错开触发时间
        let trigger_time = Utc::now() + Duration::milliseconds(i64::from(depend.sequence));
        let savepoint = scope.savepoint().await?;
        match self
            .creator
            .create_instance(scope, &child, RunType::Depend, trigger_time, Some(parent))
            .await
        {
            Ok(instance) => {
                scope.release(savepoint).await?;
                info!(
                    "触发依赖作业: {} -> {}, {}",
                    parent.instance_id, child.job_id, instance.instance_id
                );
                Ok(())
            }
            Err(e) => {
                scope.rollback_to(savepoint).await?;
                Err(e)
            }
        }
    }
}
