//! # Persist 模块
//!
//! 状态机快照与键值存储。
//!
//! ## 快照格式
//!
//! ```json
//! {
//!   "version": { "major": 1, "minor": 0 },
//!   "current_state": "open",
//!   "previous_state": "closed",
//!   "history": [{ "from": "closed", "to": "open", "event": "toggle", "timestamp": 120.0 }],
//!   "data": { "count": 3 }
//! }
//! ```
//!
//! ## 文件布局（[`FileStore`]）
//!
//! ```text
//! <dir>/
//! ├── <key>.json
//! └── ...
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::history::TransitionRecord;
use crate::error::StoreError;

/// 快照格式版本
///
/// - MAJOR: 不兼容的格式变更
/// - MINOR: 向后兼容的新字段
pub const SNAPSHOT_VERSION_MAJOR: u32 = 1;
pub const SNAPSHOT_VERSION_MINOR: u32 = 0;

/// 快照版本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotVersion {
    pub major: u32,
    pub minor: u32,
}

impl SnapshotVersion {
    /// 当前版本
    pub fn current() -> Self {
        Self {
            major: SNAPSHOT_VERSION_MAJOR,
            minor: SNAPSHOT_VERSION_MINOR,
        }
    }

    /// major 相同即兼容
    pub fn is_compatible(&self) -> bool {
        self.major == SNAPSHOT_VERSION_MAJOR
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// 状态机快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    /// 格式版本
    #[serde(default)]
    pub version: SnapshotVersion,
    /// 当前状态
    pub current_state: String,
    /// 上一个状态
    #[serde(default)]
    pub previous_state: Option<String>,
    /// 转换历史
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
    /// 附加数据
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl MachineSnapshot {
    /// 序列化为 JSON
    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string_pretty(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// 从 JSON 反序列化（检查版本）
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let snapshot: MachineSnapshot =
            serde_json::from_str(json).map_err(|e| StoreError::Deserialization(e.to_string()))?;

        if !snapshot.version.is_compatible() {
            return Err(StoreError::Deserialization(format!(
                "快照版本不兼容: {} vs 当前 {}",
                snapshot.version,
                SnapshotVersion::current()
            )));
        }

        Ok(snapshot)
    }
}

/// 键值存储
pub trait KeyValueStore {
    /// 读取；不存在时返回 `Ok(None)`
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// 写入
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// 删除
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RefCell<HashMap<String, String>>,
}

impl MemoryStore {
    /// 创建空存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 条目数
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

/// 文件存储：每个键一个 JSON 文件
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// 创建文件存储
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// 确保目录存在
    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)
                .map_err(|e| StoreError::Io(format!("无法创建存储目录: {}", e)))?;
        }
        Ok(())
    }

    /// 键对应的文件路径（路径分隔符等字符替换为 `_`）
    pub fn key_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| StoreError::Io(format!("无法读取 {}: {}", path.display(), e)))?;
        Ok(Some(text))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_dir()?;
        let path = self.key_path(key);
        fs::write(&path, value)
            .map_err(|e| StoreError::Io(format!("无法写入 {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "快照已写入");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.key_path(key);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| StoreError::Io(format!("无法删除 {}: {}", path.display(), e)))?;
        }
        Ok(())
    }
}
