//! # Graph 模块
//!
//! 依赖图解析：把声明了依赖关系的节点排成拓扑序。
//!
//! ## 算法
//!
//! 深度优先遍历，维护一个"在栈上"集合：
//!
//! 1. 依赖先于自身被完整访问，然后自身追加到结果末尾
//! 2. 访问到已在栈上的节点即为环，返回 [`GraphError::CircularDependency`]
//! 3. 相互独立的节点保持声明顺序
//!
//! 解析是纯函数：失败时不产生任何部分结果。
//! 命令（[`crate::command::Command`]）和时间轴阶段（[`crate::timeline::Stage`]）共用这套解析。

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;

/// 可参与依赖解析的节点
pub trait DependencyNode {
    /// 节点 ID
    fn node_id(&self) -> &str;

    /// 依赖的节点 ID
    fn dependencies(&self) -> &[String];
}

/// 执行计划：满足依赖顺序的 ID 序列
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionPlan {
    order: Vec<String>,
}

impl ExecutionPlan {
    /// 按顺序迭代 ID
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// ID 列表
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// ID 在计划中的位置
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|x| x == id)
    }

    /// 节点数量
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.order.join(" -> "))
    }
}

/// 解析执行计划
///
/// # 错误
///
/// - [`GraphError::DuplicateId`]：ID 重复
/// - [`GraphError::UnknownDependency`]：依赖未声明
/// - [`GraphError::CircularDependency`]：存在环，错误中包含环路径
pub fn resolve<N: DependencyNode>(nodes: &[N]) -> Result<ExecutionPlan, GraphError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if index.insert(node.node_id(), i).is_some() {
            return Err(GraphError::DuplicateId {
                id: node.node_id().to_string(),
            });
        }
    }

    for node in nodes {
        if let Some(missing) = node
            .dependencies()
            .iter()
            .find(|dep| !index.contains_key(dep.as_str()))
        {
            return Err(GraphError::UnknownDependency {
                id: node.node_id().to_string(),
                dependency: missing.clone(),
            });
        }
    }

    let mut visitor = Visitor {
        nodes,
        index: &index,
        visited: HashSet::with_capacity(nodes.len()),
        stack: Vec::new(),
        order: Vec::with_capacity(nodes.len()),
    };
    for i in 0..nodes.len() {
        visitor.visit(i)?;
    }

    Ok(ExecutionPlan {
        order: visitor.order,
    })
}

struct Visitor<'a, N> {
    nodes: &'a [N],
    index: &'a HashMap<&'a str, usize>,
    visited: HashSet<usize>,
    /// 当前 DFS 路径（同时作为"在栈上"集合）
    stack: Vec<usize>,
    order: Vec<String>,
}

impl<N: DependencyNode> Visitor<'_, N> {
    fn visit(&mut self, i: usize) -> Result<(), GraphError> {
        if self.visited.contains(&i) {
            return Ok(());
        }
        if let Some(pos) = self.stack.iter().position(|&s| s == i) {
            let mut cycle: Vec<String> = self.stack[pos..]
                .iter()
                .map(|&s| self.nodes[s].node_id().to_string())
                .collect();
            let id = self.nodes[i].node_id().to_string();
            cycle.push(id.clone());
            return Err(GraphError::CircularDependency { id, cycle });
        }

        self.stack.push(i);
        let node = &self.nodes[i];
        for dep in node.dependencies() {
            let j = self.index[dep.as_str()];
            self.visit(j)?;
        }
        self.stack.pop();

        self.visited.insert(i);
        self.order.push(node.node_id().to_string());
        Ok(())
    }
}
