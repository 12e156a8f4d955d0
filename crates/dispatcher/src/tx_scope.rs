//! 事务作用域
//!
//! 包装一次存储事务，并收集只能在提交之后执行的动作（向Worker投递指令）。
//! 保存点回滚时，保存点之后登记的动作一并丢弃。

use std::ops::{Deref, DerefMut};

use tracing::warn;

use scheduler_core::SchedulerResult;
use scheduler_domain::{
    ExecuteTaskParam, Instance, Job, Savepoint, Task, Transaction, TransactionManager,
};

/// 一批待分发的任务
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub job: Job,
    pub instance: Instance,
    pub tasks: Vec<Task>,
    /// 重新分发时按Worker负载分配
    pub redispatch: bool,
    /// 实例下等待/执行中的任务，用于计算负载
    pub pausable_tasks: Vec<Task>,
}

impl DispatchRequest {
    pub fn new(job: Job, instance: Instance, tasks: Vec<Task>) -> Self {
        Self {
            job,
            instance,
            tasks,
            redispatch: false,
            pausable_tasks: Vec::new(),
        }
    }

    pub fn redispatch(job: Job, instance: Instance, tasks: Vec<Task>, pausable_tasks: Vec<Task>) -> Self {
        Self {
            job,
            instance,
            tasks,
            redispatch: true,
            pausable_tasks,
        }
    }
}

/// 提交后执行的动作
#[derive(Debug, Clone)]
pub enum AfterCommit {
    /// 按路由策略分发TRIGGER指令
    Dispatch(DispatchRequest),
    /// 直接投递已构建好的指令（暂停/取消执行中的任务）
    Send {
        group: String,
        params: Vec<ExecuteTaskParam>,
    },
}

pub struct TxScope {
    tx: Box<dyn Transaction>,
    after_commit: Vec<AfterCommit>,
    marks: Vec<(Savepoint, usize)>,
}

impl TxScope {
    pub async fn begin(manager: &dyn TransactionManager) -> SchedulerResult<Self> {
        Ok(Self {
            tx: manager.begin().await?,
            after_commit: Vec::new(),
            marks: Vec::new(),
        })
    }

    pub fn after_commit(&mut self, action: AfterCommit) {
        self.after_commit.push(action);
    }

    pub fn pending_actions(&self) -> usize {
        self.after_commit.len()
    }

    pub async fn savepoint(&mut self) -> SchedulerResult<Savepoint> {
        let savepoint = self.tx.savepoint().await?;
        self.marks.push((savepoint, self.after_commit.len()));
        Ok(savepoint)
    }

    pub async fn release(&mut self, savepoint: Savepoint) -> SchedulerResult<()> {
        self.tx.release_savepoint(savepoint).await?;
        self.marks.retain(|(sp, _)| sp.0 < savepoint.0);
        Ok(())
    }

    /// 回滚到保存点并释放它，丢弃之后登记的动作
    pub async fn rollback_to(&mut self, savepoint: Savepoint) -> SchedulerResult<()> {
        self.tx.rollback_to_savepoint(savepoint).await?;
        if let Some((_, len)) = self.marks.iter().find(|(sp, _)| *sp == savepoint) {
            self.after_commit.truncate(*len);
        }
        self.release(savepoint).await
    }

    /// 提交事务，返回需要执行的动作
    pub async fn commit(mut self) -> SchedulerResult<Vec<AfterCommit>> {
        self.tx.commit().await?;
        Ok(std::mem::take(&mut self.after_commit))
    }

    pub async fn rollback(mut self) -> SchedulerResult<()> {
        if !self.after_commit.is_empty() {
            warn!("事务回滚，丢弃 {} 个待执行动作", self.after_commit.len());
        }
        self.tx.rollback().await
    }
}

impl Deref for TxScope {
    type Target = dyn Transaction;

    fn deref(&self) -> &Self::Target {
        self.tx.as_ref()
    }
}

impl DerefMut for TxScope {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tx.as_mut()
    }
}
