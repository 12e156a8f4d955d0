use chrono::{DateTime, Utc};

use crate::entities::Task;
use crate::value_objects::{ExecuteState, RunState};

/// 根据任务状态汇总出的实例状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedRunState {
    /// 没有等待/执行中的任务，且至少一个任务已暂停
    Paused,
    /// 所有任务都已终止
    Terminal {
        state: RunState,
        end_time: DateTime<Utc>,
    },
}

impl ResolvedRunState {
    pub fn run_state(&self) -> RunState {
        match self {
            ResolvedRunState::Paused => RunState::Paused,
            ResolvedRunState::Terminal { state, .. } => *state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResolvedRunState::Terminal { .. })
    }
}

/// 实例运行状态计算
pub struct RunStateResolver;

impl RunStateResolver {
    /// 计算实例的汇总状态，存在等待/执行中的任务时返回None
    pub fn resolve(tasks: &[Task], now: DateTime<Utc>) -> Option<ResolvedRunState> {
        Self::resolve_states(
            tasks.iter().map(|t| (t.execute_state, t.execute_end_time)),
            now,
        )
    }

    pub fn resolve_states<I>(states: I, now: DateTime<Utc>) -> Option<ResolvedRunState>
    where
        I: IntoIterator<Item = (ExecuteState, Option<DateTime<Utc>>)>,
    {
        let states: Vec<(ExecuteState, Option<DateTime<Utc>>)> = states.into_iter().collect();

        if states.iter().all(|(state, _)| state.is_terminal()) {
            let state = if states.iter().any(|(state, _)| state.is_failure()) {
                RunState::Canceled
            } else {
                RunState::Completed
            };
            // 未启动就被取消的任务没有结束时间
            let end_time = states
                .iter()
                .filter_map(|(_, end)| *end)
                .max()
                .unwrap_or(now);
            return Some(ResolvedRunState::Terminal { state, end_time });
        }

        if states.iter().any(|(state, _)| state.is_pausable()) {
            return None;
        }

        Some(ResolvedRunState::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn states(list: &[(ExecuteState, Option<DateTime<Utc>>)]) -> Vec<(ExecuteState, Option<DateTime<Utc>>)> {
        list.to_vec()
    }

    #[test]
    fn test_all_completed_uses_latest_end_time() {
        let now = Utc::now();
        let t1 = now - Duration::seconds(30);
        let t2 = now - Duration::seconds(10);
        let t3 = now - Duration::seconds(20);
        let resolved = RunStateResolver::resolve_states(
            states(&[
                (ExecuteState::Completed, Some(t1)),
                (ExecuteState::Completed, Some(t2)),
                (ExecuteState::Completed, Some(t3)),
            ]),
            now,
        );
        assert_eq!(
            resolved,
            Some(ResolvedRunState::Terminal {
                state: RunState::Completed,
                end_time: t2
            })
        );
    }

    #[test]
    fn test_waiting_task_is_indeterminate() {
        let now = Utc::now();
        let resolved = RunStateResolver::resolve_states(
            states(&[
                (ExecuteState::Completed, Some(now)),
                (ExecuteState::ManualCanceled, Some(now)),
                (ExecuteState::Waiting, None),
            ]),
            now,
        );
        assert_eq!(resolved, None);
    }

    #[test]
    fn test_executing_task_is_indeterminate() {
        let now = Utc::now();
        let resolved = RunStateResolver::resolve_states(
            states(&[(ExecuteState::Paused, None), (ExecuteState::Executing, None)]),
            now,
        );
        assert_eq!(resolved, None);
    }

    #[test]
    fn test_any_failure_cancels() {
        let now = Utc::now();
        let resolved = RunStateResolver::resolve_states(
            states(&[
                (ExecuteState::Completed, Some(now)),
                (ExecuteState::BroadcastAborted, None),
            ]),
            now,
        )
        .unwrap();
        assert_eq!(resolved.run_state(), RunState::Canceled);
        assert!(resolved.is_terminal());
    }

    #[test]
    fn test_missing_end_times_fall_back_to_now() {
        let now = Utc::now();
        let resolved = RunStateResolver::resolve_states(
            states(&[(ExecuteState::DispatchFailed, None)]),
            now,
        );
        assert_eq!(
            resolved,
            Some(ResolvedRunState::Terminal {
                state: RunState::Canceled,
                end_time: now
            })
        );
    }

    #[test]
    fn test_paused_mixed_with_terminal() {
        let now = Utc::now();
        let resolved = RunStateResolver::resolve_states(
            states(&[
                (ExecuteState::Completed, Some(now)),
                (ExecuteState::Paused, None),
                (ExecuteState::ExecuteFailed, Some(now)),
            ]),
            now,
        );
        assert_eq!(resolved, Some(ResolvedRunState::Paused));
    }

    #[test]
    fn test_every_state_combination_matches_definition() {
        let now = Utc::now();
        for a in ExecuteState::ALL {
            for b in ExecuteState::ALL {
                let resolved =
                    RunStateResolver::resolve_states(vec![(*a, None), (*b, None)], now);
                let all_terminal = a.is_terminal() && b.is_terminal();
                let any_active = a.is_pausable() || b.is_pausable();
                match resolved {
                    Some(ResolvedRunState::Terminal { state, .. }) => {
                        assert!(all_terminal);
                        assert_eq!(state.is_failure(), a.is_failure() || b.is_failure());
                    }
                    Some(ResolvedRunState::Paused) => {
                        assert!(!all_terminal && !any_active);
                    }
                    None => assert!(any_active),
                }
            }
        }
    }
}
