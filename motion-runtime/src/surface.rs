//! # Surface 模块
//!
//! 引擎与宿主之间的能力接口。
//!
//! ## 核心概念
//!
//! - `TargetRef`: 逻辑目标引用（如 `"#card"`、`"item-3"`），由宿主解释
//! - `Surface`: 可写入样式/属性的活动表面，引擎只通过它提交计算结果
//! - `TargetResolver`: 把逻辑引用解析为零个或多个表面
//! - `MotionPreference`: 动效偏好（减弱动效、复杂度策略）
//!
//! 引擎从不构造或检查表面本身。

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::interpolation::Value;

/// 逻辑目标引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetRef(pub String);

impl TargetRef {
    /// 创建引用
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// 引用字符串
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TargetRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TargetRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 写入通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackKind {
    /// 样式
    #[default]
    Style,
    /// 属性
    Property,
}

/// 活动表面
///
/// 使用 `&self`：实现方通过内部可变性（`RefCell` 等）保存写入结果，
/// 这样同一表面可以同时被多个动画共享。
pub trait Surface {
    /// 提交样式值
    fn apply_style(&self, key: &str, value: &Value);

    /// 提交属性值
    fn apply_property(&self, key: &str, value: &Value);
}

/// 表面句柄
pub type SurfaceHandle = Rc<dyn Surface>;

/// 按通道写入
pub fn apply_value(surface: &dyn Surface, kind: TrackKind, key: &str, value: &Value) {
    match kind {
        TrackKind::Style => surface.apply_style(key, value),
        TrackKind::Property => surface.apply_property(key, value),
    }
}

/// 目标解析能力
pub trait TargetResolver {
    /// 解析逻辑引用；找不到时返回空列表
    fn resolve(&self, target: &TargetRef) -> Vec<SurfaceHandle>;
}

/// 动效偏好能力
pub trait MotionPreference {
    /// 是否偏好减弱动效
    fn prefers_reduced_motion(&self) -> bool;

    /// 指定类别与时长的动画是否允许播放
    fn is_allowed(&self, _category: Option<&str>, _duration: f64) -> bool {
        true
    }
}

/// 默认偏好：不减弱，全部允许
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPreference;

impl MotionPreference for NoPreference {
    fn prefers_reduced_motion(&self) -> bool {
        false
    }
}

/// 静态偏好
///
/// `max_duration` 之外的动画、以及 `blocked` 中的类别都视为不允许。
#[derive(Debug, Clone, Default)]
pub struct StaticPreference {
    /// 是否偏好减弱动效
    pub reduced: bool,
    /// 允许的最大时长
    pub max_duration: Option<f64>,
    /// 禁止的类别
    pub blocked: Vec<String>,
}

impl StaticPreference {
    /// 偏好减弱动效
    pub fn reduced() -> Self {
        Self {
            reduced: true,
            ..Default::default()
        }
    }

    /// 设置最大时长
    pub fn with_max_duration(mut self, max: f64) -> Self {
        self.max_duration = Some(max);
        self
    }

    /// 禁止类别
    pub fn block(mut self, category: impl Into<String>) -> Self {
        self.blocked.push(category.into());
        self
    }
}

impl MotionPreference for StaticPreference {
    fn prefers_reduced_motion(&self) -> bool {
        self.reduced
    }

    fn is_allowed(&self, category: Option<&str>, duration: f64) -> bool {
        if let Some(category) = category
            && self.blocked.iter().any(|b| b == category)
        {
            return false;
        }
        self.max_duration.is_none_or(|max| duration <= max)
    }
}

/// 内存表面：记录每次写入
///
/// 适合无界面宿主与测试。
#[derive(Debug, Default)]
pub struct MemorySurface {
    styles: RefCell<BTreeMap<String, Value>>,
    properties: RefCell<BTreeMap<String, Value>>,
    writes: RefCell<usize>,
}

impl MemorySurface {
    /// 创建空表面
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// 当前样式值
    pub fn style(&self, key: &str) -> Option<Value> {
        self.styles.borrow().get(key).cloned()
    }

    /// 当前属性值
    pub fn property(&self, key: &str) -> Option<Value> {
        self.properties.borrow().get(key).cloned()
    }

    /// 全部样式
    pub fn styles(&self) -> BTreeMap<String, Value> {
        self.styles.borrow().clone()
    }

    /// 写入次数
    pub fn write_count(&self) -> usize {
        *self.writes.borrow()
    }
}

impl Surface for MemorySurface {
    fn apply_style(&self, key: &str, value: &Value) {
        self.styles.borrow_mut().insert(key.to_string(), value.clone());
        *self.writes.borrow_mut() += 1;
    }

    fn apply_property(&self, key: &str, value: &Value) {
        self.properties
            .borrow_mut()
            .insert(key.to_string(), value.clone());
        *self.writes.borrow_mut() += 1;
    }
}

/// 注册表解析器：按引用字符串查表
#[derive(Default)]
pub struct SurfaceRegistry {
    surfaces: HashMap<TargetRef, Vec<SurfaceHandle>>,
}

impl std::fmt::Debug for SurfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceRegistry")
            .field("targets", &self.surfaces.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SurfaceRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册表面（同一引用可对应多个表面）
    pub fn register(&mut self, target: impl Into<TargetRef>, surface: SurfaceHandle) {
        self.surfaces.entry(target.into()).or_default().push(surface);
    }

    /// 注销引用
    pub fn unregister(&mut self, target: &TargetRef) {
        self.surfaces.remove(target);
    }

    /// 已注册的引用数量
    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}

impl TargetResolver for SurfaceRegistry {
    fn resolve(&self, target: &TargetRef) -> Vec<SurfaceHandle> {
        self.surfaces.get(target).cloned().unwrap_or_default()
    }
}

/// 固定解析器：任何引用都解析为同一组表面
///
/// 用于已经在构建期解析好表面的组件（状态机、同步组条目）。
#[derive(Clone, Default)]
pub struct FixedResolver(pub Vec<SurfaceHandle>);

impl std::fmt::Debug for FixedResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FixedResolver").field(&self.0.len()).finish()
    }
}

impl TargetResolver for FixedResolver {
    fn resolve(&self, _target: &TargetRef) -> Vec<SurfaceHandle> {
        self.0.clone()
    }
}
