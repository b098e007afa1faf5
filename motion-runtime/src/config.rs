//! # Config 模块
//!
//! 运行时配置，集中管理所有可调参数。
//!
//! 所有字段都有默认值，配置文件中只需写出要覆盖的项：
//!
//! ```json
//! { "history_capacity": 20, "default_easing": "ease-out", "log_filter": "motion_runtime=debug" }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::easing::EasingDescriptor;
use crate::error::ConfigError;
use crate::interpolation::Interpolator;

/// 运行时配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// 状态机历史容量
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// 未指定缓动时使用的缓动
    #[serde(default)]
    pub default_easing: EasingDescriptor,

    /// 吸附阈值（占数值范围的比例）
    #[serde(default = "default_snap_threshold_ratio")]
    pub snap_threshold_ratio: f64,

    /// 级联策略的默认间隔（毫秒）
    #[serde(default = "default_cascade_offset_ms")]
    pub cascade_offset_ms: f64,

    /// 状态机持久化键前缀
    #[serde(default = "default_persistence_key_prefix")]
    pub persistence_key_prefix: String,

    /// 持久化目录；为空时只保存在内存中
    #[serde(default)]
    pub persistence_dir: Option<PathBuf>,

    /// 减弱动效且没有替代方案时使用的时长（毫秒）
    #[serde(default)]
    pub reduced_motion_duration_ms: f64,

    /// 日志过滤规则（`tracing_subscriber::EnvFilter` 语法）
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_history_capacity() -> usize {
    crate::machine::DEFAULT_HISTORY_CAPACITY
}

fn default_snap_threshold_ratio() -> f64 {
    crate::interpolation::DEFAULT_SNAP_THRESHOLD
}

fn default_cascade_offset_ms() -> f64 {
    100.0
}

fn default_persistence_key_prefix() -> String {
    "motion-state:".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            default_easing: EasingDescriptor::default(),
            snap_threshold_ratio: default_snap_threshold_ratio(),
            cascade_offset_ms: default_cascade_offset_ms(),
            persistence_key_prefix: default_persistence_key_prefix(),
            persistence_dir: None,
            reduced_motion_duration_ms: 0.0,
            log_filter: default_log_filter(),
        }
    }
}

impl MotionConfig {
    /// 加载配置文件
    ///
    /// 文件不存在、读取失败、解析失败或校验失败时返回默认配置并记录警告。
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "配置文件不存在，使用默认配置");
            return Self::default();
        }

        match Self::try_load(path) {
            Ok(config) => {
                info!(path = %path.display(), "配置文件加载成功");
                config
            }
            Err(e) => {
                warn!(error = %e, "配置文件无效，使用默认配置");
                Self::default()
            }
        }
    }

    /// 加载并校验配置文件
    pub fn try_load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        fs::write(path, json).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, message: &str| ConfigError::Invalid {
            field: field.to_string(),
            message: message.to_string(),
        };

        if self.history_capacity == 0 {
            return Err(invalid("history_capacity", "必须大于 0"));
        }
        if !(0.0..1.0).contains(&self.snap_threshold_ratio) {
            return Err(invalid("snap_threshold_ratio", "必须在 [0, 1) 之间"));
        }
        if !(self.cascade_offset_ms.is_finite() && self.cascade_offset_ms >= 0.0) {
            return Err(invalid("cascade_offset_ms", "必须是非负数"));
        }
        if !(self.reduced_motion_duration_ms.is_finite() && self.reduced_motion_duration_ms >= 0.0) {
            return Err(invalid("reduced_motion_duration_ms", "必须是非负数"));
        }
        Ok(())
    }

    /// 按配置创建插值引擎
    pub fn interpolator(&self) -> Interpolator {
        Interpolator::new().with_snap_threshold(self.snap_threshold_ratio)
    }

    /// 状态机的持久化键
    pub fn persistence_key(&self, machine: &str) -> String {
        format!("{}{machine}", self.persistence_key_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MotionConfig::default();
        assert_eq!(config.history_capacity, 50);
        assert_eq!(config.snap_threshold_ratio, 0.05);
        assert_eq!(config.reduced_motion_duration_ms, 0.0);
        assert_eq!(config.default_easing, EasingDescriptor::Named("ease-in-out".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motion.json");
        fs::write(&path, r#"{ "history_capacity": 10, "default_easing": "linear" }"#).unwrap();

        let config = MotionConfig::load(&path);
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.default_easing, EasingDescriptor::Named("linear".to_string()));
        assert_eq!(config.cascade_offset_ms, 100.0);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_missing_or_malformed_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(MotionConfig::load(dir.path().join("absent.json")), MotionConfig::default());

        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(MotionConfig::load(&path), MotionConfig::default());
        assert!(matches!(MotionConfig::try_load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motion.json");
        fs::write(&path, r#"{ "snap_threshold_ratio": 1.5 }"#).unwrap();

        let err = MotionConfig::try_load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "snap_threshold_ratio"));
        assert_eq!(MotionConfig::load(&path), MotionConfig::default());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motion.json");
        let config = MotionConfig {
            history_capacity: 7,
            persistence_dir: Some(dir.path().join("states")),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(MotionConfig::try_load(&path).unwrap(), config);
    }

    #[test]
    fn test_persistence_key() {
        let config = MotionConfig::default();
        assert_eq!(config.persistence_key("menu"), "motion-state:menu");
    }
}
