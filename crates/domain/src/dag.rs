//! 工作流DAG定义
//!
//! 工作流作业的执行器字段保存DAG表达式：以 `->` 连接节点名组成链，
//! 多条链用 `;` 或换行分隔，例如 `A -> B -> D; A -> C -> D`。

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use scheduler_core::{SchedulerError, SchedulerResult};

const START_NAME: &str = "Start";
const END_NAME: &str = "End";

/// DAG节点，`Start`/`End` 为虚拟的起止节点
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DagNode {
    Start,
    End,
    Node(String),
}

impl DagNode {
    pub fn node<S: Into<String>>(name: S) -> Self {
        DagNode::Node(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            DagNode::Start => START_NAME,
            DagNode::End => END_NAME,
            DagNode::Node(name) => name,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, DagNode::Start)
    }

    pub fn is_end(&self) -> bool {
        matches!(self, DagNode::End)
    }
}

impl fmt::Display for DagNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DagNode {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            START_NAME => Ok(DagNode::Start),
            END_NAME => Ok(DagNode::End),
            name => {
                validate_node_name(name)?;
                Ok(DagNode::Node(name.to_string()))
            }
        }
    }
}

impl TryFrom<String> for DagNode {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DagNode> for String {
    fn from(node: DagNode) -> Self {
        node.name().to_string()
    }
}

fn validate_node_name(name: &str) -> SchedulerResult<()> {
    if name.is_empty() {
        return Err(SchedulerError::invalid_job_config("DAG节点名称不能为空"));
    }
    if name == START_NAME || name == END_NAME {
        return Err(SchedulerError::invalid_job_config(format!(
            "DAG节点名称不能使用保留字: {name}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
    {
        return Err(SchedulerError::invalid_job_config(format!(
            "DAG节点名称包含非法字符: {name}"
        )));
    }
    Ok(())
}

/// DAG中的一条边
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DagEdge {
    pub source: DagNode,
    pub target: DagNode,
}

impl DagEdge {
    pub fn new(source: DagNode, target: DagNode) -> Self {
        Self { source, target }
    }
}

impl fmt::Display for DagEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

/// 解析后的DAG表达式，边的顺序是确定的
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagExpression {
    edges: Vec<DagEdge>,
}

impl DagExpression {
    /// 解析DAG表达式，补全Start/End边并校验无环
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        let mut nodes: Vec<DagNode> = Vec::new();
        let mut inner_edges: Vec<DagEdge> = Vec::new();
        let mut seen_edges: HashSet<DagEdge> = HashSet::new();

        for chain in expr.split([';', '\n']).map(str::trim).filter(|c| !c.is_empty()) {
            let mut previous: Option<DagNode> = None;
            for name in chain.split("->").map(str::trim) {
                validate_node_name(name)?;
                let node = DagNode::node(name);
                if !nodes.contains(&node) {
                    nodes.push(node.clone());
                }
                if let Some(source) = previous.take() {
                    if source == node {
                        return Err(SchedulerError::invalid_job_config(format!(
                            "DAG节点不能指向自身: {node}"
                        )));
                    }
                    let edge = DagEdge::new(source, node.clone());
                    if seen_edges.insert(edge.clone()) {
                        inner_edges.push(edge);
                    }
                }
                previous = Some(node);
            }
        }

        if nodes.is_empty() {
            return Err(SchedulerError::invalid_job_config(format!(
                "DAG表达式为空: {expr:?}"
            )));
        }

        let has_incoming: HashSet<&DagNode> = inner_edges.iter().map(|e| &e.target).collect();
        let has_outgoing: HashSet<&DagNode> = inner_edges.iter().map(|e| &e.source).collect();

        let mut edges = Vec::with_capacity(inner_edges.len() + nodes.len() * 2);
        for node in nodes.iter().filter(|n| !has_incoming.contains(n)) {
            edges.push(DagEdge::new(DagNode::Start, node.clone()));
        }
        edges.extend(inner_edges.iter().cloned());
        for node in nodes.iter().filter(|n| !has_outgoing.contains(n)) {
            edges.push(DagEdge::new(node.clone(), DagNode::End));
        }

        let dag = Self { edges };
        if dag.has_cycle() {
            return Err(SchedulerError::invalid_job_config(format!(
                "DAG表达式存在环: {expr}"
            )));
        }
        Ok(dag)
    }

    pub fn edges(&self) -> &[DagEdge] {
        &self.edges
    }

    /// 所有业务节点（不含Start/End）
    pub fn nodes(&self) -> Vec<&DagNode> {
        let mut result: Vec<&DagNode> = Vec::new();
        for edge in &self.edges {
            for node in [&edge.source, &edge.target] {
                if matches!(node, DagNode::Node(_)) && !result.contains(&node) {
                    result.push(node);
                }
            }
        }
        result
    }

    fn has_cycle(&self) -> bool {
        let mut in_degree: HashMap<&DagNode, usize> = HashMap::new();
        let mut adjacency: HashMap<&DagNode, Vec<&DagNode>> = HashMap::new();
        for edge in &self.edges {
            in_degree.entry(&edge.source).or_insert(0);
            *in_degree.entry(&edge.target).or_insert(0) += 1;
            adjacency.entry(&edge.source).or_default().push(&edge.target);
        }

        let mut queue: VecDeque<&DagNode> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&node, _)| node)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop_front() {
            processed += 1;
            for &next in adjacency.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }
        processed < in_degree.len()
    }
}
