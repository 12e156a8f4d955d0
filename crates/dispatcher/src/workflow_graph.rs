//! 工作流实例图
//!
//! 由一个工作流实例的全部边构建。边的状态即目标节点的状态，
//! 指向同一节点的所有边状态一致。

use std::collections::{HashSet, VecDeque};

use scheduler_domain::{DagNode, RunState, WorkflowEdge};

/// 推进工作流时对一个节点的决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAdvance {
    /// 前置节点全部成功，创建节点实例
    Start {
        node: DagNode,
        /// 用于推导节点实例触发时间
        sequence: i32,
        predecessor_instance_ids: Vec<i64>,
    },
    /// 存在失败的前置节点，节点不再运行
    Cancel { node: DagNode },
}

impl NodeAdvance {
    pub fn node(&self) -> &DagNode {
        match self {
            NodeAdvance::Start { node, .. } | NodeAdvance::Cancel { node } => node,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    edges: Vec<WorkflowEdge>,
}

impl WorkflowGraph {
    pub fn new(mut edges: Vec<WorkflowEdge>) -> Self {
        edges.sort_by_key(|e| e.sequence);
        Self { edges }
    }

    pub fn edges(&self) -> &[WorkflowEdge] {
        &self.edges
    }

    pub fn get(&self, pre_node: &DagNode, cur_node: &DagNode) -> Option<&WorkflowEdge> {
        self.edges
            .iter()
            .find(|e| &e.pre_node == pre_node && &e.cur_node == cur_node)
    }

    /// 节点状态，Start视为已完成
    pub fn node_state(&self, node: &DagNode) -> Option<RunState> {
        if node.is_start() {
            return Some(RunState::Completed);
        }
        self.edges
            .iter()
            .find(|e| &e.cur_node == node)
            .map(|e| e.run_state)
    }

    /// 前置节点的边（以前置节点为目标的边）
    pub fn predecessors(&self, node: &DagNode) -> Vec<&WorkflowEdge> {
        let pre_nodes: HashSet<&DagNode> = self
            .edges
            .iter()
            .filter(|e| &e.cur_node == node)
            .map(|e| &e.pre_node)
            .collect();
        self.edges
            .iter()
            .filter(|e| pre_nodes.contains(&e.cur_node))
            .collect()
    }

    /// 从节点出发的边
    pub fn successors(&self, node: &DagNode) -> Vec<&WorkflowEdge> {
        self.edges.iter().filter(|e| &e.pre_node == node).collect()
    }

    pub fn set_node_state(&mut self, node: &DagNode, state: RunState) {
        for edge in self.edges.iter_mut().filter(|e| &e.cur_node == node) {
            edge.run_state = state;
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.edges.iter().all(|e| e.run_state.is_terminal())
    }

    pub fn any_failure(&self) -> bool {
        self.edges.iter().any(|e| e.run_state.is_failure())
    }

    pub fn all_terminal_or_paused(&self) -> bool {
        self.edges
            .iter()
            .all(|e| e.run_state.is_terminal() || e.run_state == RunState::Paused)
    }

    /// 所有节点终止后主实例的状态
    pub fn terminal_state(&self) -> RunState {
        if self.any_failure() {
            RunState::Canceled
        } else {
            RunState::Completed
        }
    }

    /// End节点未终止且其前置节点都已终止时，返回End应写入的状态
    pub fn end_state(&self) -> Option<RunState> {
        let end = DagNode::End;
        if self
            .edges
            .iter()
            .filter(|e| e.cur_node.is_end())
            .all(|e| e.run_state.is_terminal())
        {
            return None;
        }
        let predecessors = self.predecessors(&end);
        if !predecessors.iter().all(|e| e.run_state.is_terminal()) {
            return None;
        }
        if predecessors.iter().any(|e| e.run_state.is_failure()) {
            Some(RunState::Canceled)
        } else {
            Some(RunState::Completed)
        }
    }

    /// 检查整个图中等待的节点
    pub fn advance_all(&mut self) -> Vec<NodeAdvance> {
        let targets: Vec<DagNode> = self.edges.iter().map(|e| e.cur_node.clone()).collect();
        self.advance(targets)
    }

    /// 节点结束后检查它的后续节点
    pub fn advance_from(&mut self, node: &DagNode) -> Vec<NodeAdvance> {
        let targets: Vec<DagNode> = self
            .successors(node)
            .into_iter()
            .map(|e| e.cur_node.clone())
            .collect();
        self.advance(targets)
    }

    /// 每个节点最多处理一次。被取消的节点会继续检查其后续节点，
    /// 决定同时写回内存中的边状态，调用方负责持久化。
    fn advance(&mut self, targets: Vec<DagNode>) -> Vec<NodeAdvance> {
        let mut result = Vec::new();
        let mut seen: HashSet<DagNode> = HashSet::new();
        let mut queue: VecDeque<DagNode> = targets.into();

        while let Some(target) = queue.pop_front() {
            if target.is_end() || !seen.insert(target.clone()) {
                continue;
            }
            let Some(edge) = self
                .edges
                .iter()
                .find(|e| e.cur_node == target && e.run_state == RunState::Waiting)
            else {
                continue;
            };
            let sequence = edge.sequence;

            let predecessors = self.predecessors(&target);
            if predecessors.iter().any(|e| !e.run_state.is_terminal()) {
                continue;
            }
            if predecessors.iter().any(|e| e.run_state.is_failure()) {
                self.set_node_state(&target, RunState::Canceled);
                queue.extend(self.successors(&target).into_iter().map(|e| e.cur_node.clone()));
                result.push(NodeAdvance::Cancel { node: target });
            } else {
                let mut predecessor_instance_ids: Vec<i64> =
                    predecessors.iter().filter_map(|e| e.instance_id).collect();
                predecessor_instance_ids.sort_unstable();
                predecessor_instance_ids.dedup();
                self.set_node_state(&target, RunState::Running);
                result.push(NodeAdvance::Start {
                    node: target,
                    sequence,
                    predecessor_instance_ids,
                });
            }
        }
        result
    }
}
