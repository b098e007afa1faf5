//! # Value 模块
//!
//! 可插值的值与逐属性类型表。
//!
//! 值本身不携带类型信息：`"#ff0000"` 是颜色还是普通字符串，
//! 由调用方在 [`InterpolationConfig`] 中显式声明，不做运行期推断。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::blend::BlendMode;
use crate::easing::EasingDescriptor;

/// 可插值的值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// 数值
    Number(f64),
    /// 文本（颜色、变换、路径、CSS 值、普通字符串）
    Text(String),
    /// 列表
    List(Vec<Value>),
    /// 键值表
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// 获取数值
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// 获取文本
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// 从 JSON 值转换（布尔值转为 0/1，null 转为 0）
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Number(0.0),
            serde_json::Value::Bool(b) => Value::Number(if *b { 1.0 } else { 0.0 }),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", super::decompose::format_number(*n)),
            Value::Text(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// 属性类型（插值分派表的键）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PropertyType {
    /// 标量
    #[default]
    Number,
    /// 颜色
    Color,
    /// 变换
    Transform,
    /// 路径
    Path,
    /// 列表，逐元素插值
    Array { element: Box<PropertyType> },
    /// 对象，逐字段插值；未在表中声明的字段按 0.5 切换
    Object {
        #[serde(default)]
        fields: BTreeMap<String, PropertyType>,
    },
    /// 字符串
    String,
    /// 带单位的 CSS 值，如 `12px`
    CssValue,
}

/// 单个属性的插值配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertyConfig {
    /// 类型
    #[serde(default, rename = "type")]
    pub kind: PropertyType,
    /// 自定义插值器名称（在 `Interpolator` 中注册）
    #[serde(default)]
    pub custom: Option<String>,
    /// 限制范围 `[min, max]`
    #[serde(default)]
    pub clamp: Option<[f64; 2]>,
    /// 吸附点
    #[serde(default)]
    pub snap: Vec<f64>,
    /// 属性自身的缓动
    #[serde(default)]
    pub easing: Option<EasingDescriptor>,
    /// 属性延迟（占总进度的比例，0.0 - 1.0）
    #[serde(default)]
    pub delay: f64,
}

impl PropertyConfig {
    /// 创建指定类型的配置
    pub fn of(kind: PropertyType) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// 设置限制范围
    pub fn with_clamp(mut self, min: f64, max: f64) -> Self {
        self.clamp = Some([min, max]);
        self
    }

    /// 设置吸附点
    pub fn with_snap(mut self, points: Vec<f64>) -> Self {
        self.snap = points;
        self
    }

    /// 设置缓动
    pub fn with_easing(mut self, easing: EasingDescriptor) -> Self {
        self.easing = Some(easing);
        self
    }

    /// 设置延迟
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay.clamp(0.0, 1.0);
        self
    }

    /// 设置自定义插值器
    pub fn with_custom(mut self, name: impl Into<String>) -> Self {
        self.custom = Some(name.into());
        self
    }
}

/// 插值配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InterpolationConfig {
    /// 属性名 -> 配置
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyConfig>,
    /// 全局混合模式
    #[serde(default)]
    pub blend_mode: BlendMode,
}

impl InterpolationConfig {
    /// 创建空配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加属性配置
    pub fn with_property(mut self, key: impl Into<String>, config: PropertyConfig) -> Self {
        self.properties.insert(key.into(), config);
        self
    }

    /// 设置混合模式
    pub fn with_blend_mode(mut self, mode: BlendMode) -> Self {
        self.blend_mode = mode;
        self
    }
}
