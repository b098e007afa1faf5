//! # History 模块
//!
//! 状态转换历史。
//!
//! - 只记录已完成的转换（`from -> to`、触发事件、完成时间）
//! - 容量有限，超出时移除最早的记录
//! - 可序列化，与状态快照一起持久化

use serde::{Deserialize, Serialize};

/// 默认容量
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// 一次已完成的转换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// 源状态
    pub from: String,
    /// 目标状态
    pub to: String,
    /// 触发事件
    pub event: String,
    /// 完成时间（毫秒，宿主时钟）
    pub timestamp: f64,
}

impl TransitionRecord {
    /// 创建记录
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        event: impl Into<String>,
        timestamp: f64,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            event: event.into(),
            timestamp,
        }
    }
}

/// 转换历史
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionHistory {
    /// 记录（按时间顺序）
    records: Vec<TransitionRecord>,
    /// 最大记录数
    #[serde(default = "default_capacity")]
    capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

impl Default for TransitionHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionHistory {
    /// 创建默认容量的历史
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }

    /// 设置容量
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self.trim();
        self
    }

    /// 添加记录
    pub fn push(&mut self, record: TransitionRecord) {
        self.records.push(record);
        self.trim();
    }

    /// 用持久化的记录替换当前内容（仍受容量限制）
    pub fn replace(&mut self, records: Vec<TransitionRecord>) {
        self.records = records;
        self.trim();
    }

    fn trim(&mut self) {
        if self.records.len() > self.capacity {
            let excess = self.records.len() - self.capacity;
            self.records.drain(..excess);
        }
    }

    /// 全部记录
    pub fn records(&self) -> &[TransitionRecord] {
        &self.records
    }

    /// 最近一条
    pub fn last(&self) -> Option<&TransitionRecord> {
        self.records.last()
    }

    /// 容量
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 清空
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// 记录数
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = TransitionHistory::new();
        for i in 0..60 {
            history.push(TransitionRecord::new("a", "b", format!("e{i}"), f64::from(i)));
        }
        assert_eq!(history.len(), 50);
        assert_eq!(history.records()[0].event, "e10");
        assert_eq!(history.last().unwrap().event, "e59");
    }

    #[test]
    fn test_shrinking_capacity_trims() {
        let mut history = TransitionHistory::new();
        for i in 0..5 {
            history.push(TransitionRecord::new("a", "b", "go", f64::from(i)));
        }
        let history = history.with_capacity(2);
        assert_eq!(history.len(), 2);
        assert_eq!(history.records()[0].timestamp, 3.0);
    }

    #[test]
    fn test_serialization() {
        let mut history = TransitionHistory::new().with_capacity(10);
        history.push(TransitionRecord::new("idle", "open", "toggle", 12.5));

        let json = serde_json::to_string(&history).unwrap();
        let loaded: TransitionHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, history);
    }
}
