//! # Animation 模块
//!
//! 动画描述与动画库。
//!
//! 动画可以按名称引用（[`AnimationRef::Named`]），也可以内联描述
//! （[`AnimationRef::Inline`]）。两者都在构建期（编译计划、时间轴、状态机时）
//! 经 [`AnimationLibrary`] 解析为具体的 [`AnimationDescriptor`]，播放期不再判断类型。

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::easing::EasingDescriptor;
use crate::interpolation::{InterpolationConfig, Value};
use crate::surface::TrackKind;

/// 单条轨道：一个键从 `from` 过渡到 `to`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// 样式或属性名
    pub key: String,
    /// 写入通道
    #[serde(default)]
    pub kind: TrackKind,
    /// 起始值
    pub from: Value,
    /// 目标值
    pub to: Value,
}

/// 动画描述
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnimationDescriptor {
    /// 时长（毫秒）
    #[serde(default)]
    pub duration: f64,
    /// 前置延迟（毫秒）
    #[serde(default)]
    pub delay: f64,
    /// 缓动
    #[serde(default)]
    pub easing: Option<EasingDescriptor>,
    /// 轨道
    #[serde(default)]
    pub tracks: Vec<Track>,
    /// 逐属性插值配置
    #[serde(default)]
    pub interpolation: InterpolationConfig,
}

impl AnimationDescriptor {
    /// 创建指定时长的空动画
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    /// 添加样式轨道
    pub fn style(mut self, key: impl Into<String>, from: impl Into<Value>, to: impl Into<Value>) -> Self {
        self.tracks.push(Track {
            key: key.into(),
            kind: TrackKind::Style,
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// 添加属性轨道
    pub fn property(
        mut self,
        key: impl Into<String>,
        from: impl Into<Value>,
        to: impl Into<Value>,
    ) -> Self {
        self.tracks.push(Track {
            key: key.into(),
            kind: TrackKind::Property,
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// 设置缓动
    pub fn with_easing(mut self, easing: impl Into<EasingDescriptor>) -> Self {
        self.easing = Some(easing.into());
        self
    }

    /// 设置延迟
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// 设置插值配置
    pub fn with_interpolation(mut self, config: InterpolationConfig) -> Self {
        self.interpolation = config;
        self
    }

    /// 总占用时间（延迟 + 时长）
    pub fn span(&self) -> f64 {
        self.delay.max(0.0) + self.duration.max(0.0)
    }

    /// 结束帧（所有轨道的 `to`），按通道分开
    pub fn final_values(&self) -> (BTreeMap<String, Value>, BTreeMap<String, Value>) {
        let mut styles = BTreeMap::new();
        let mut properties = BTreeMap::new();
        for track in &self.tracks {
            match track.kind {
                TrackKind::Style => styles.insert(track.key.clone(), track.to.clone()),
                TrackKind::Property => properties.insert(track.key.clone(), track.to.clone()),
            };
        }
        (styles, properties)
    }
}

/// 动画引用
///
/// JSON 中字符串表示名称，对象表示内联描述：
///
/// ```json
/// "fade-in"
/// { "duration": 300, "tracks": [{ "key": "opacity", "from": 0, "to": 1 }] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnimationRef {
    /// 按名称引用动画库中的动画
    Named(String),
    /// 内联描述
    Inline(AnimationDescriptor),
}

impl From<&str> for AnimationRef {
    fn from(value: &str) -> Self {
        AnimationRef::Named(value.to_string())
    }
}

impl From<AnimationDescriptor> for AnimationRef {
    fn from(value: AnimationDescriptor) -> Self {
        AnimationRef::Inline(value)
    }
}

/// 动画库
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnimationLibrary {
    animations: HashMap<String, AnimationDescriptor>,
}

impl AnimationLibrary {
    /// 创建空动画库
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册动画（同名覆盖）
    pub fn register(&mut self, name: impl Into<String>, descriptor: AnimationDescriptor) {
        self.animations.insert(name.into(), descriptor);
    }

    /// 链式注册
    pub fn with(mut self, name: impl Into<String>, descriptor: AnimationDescriptor) -> Self {
        self.register(name, descriptor);
        self
    }

    /// 按名称获取
    pub fn get(&self, name: &str) -> Option<&AnimationDescriptor> {
        self.animations.get(name)
    }

    /// 是否包含
    pub fn contains(&self, name: &str) -> bool {
        self.animations.contains_key(name)
    }

    /// 解析引用；名称未注册时返回 `Err(名称)`
    pub fn resolve(&self, reference: &AnimationRef) -> Result<AnimationDescriptor, String> {
        match reference {
            AnimationRef::Named(name) => self.get(name).cloned().ok_or_else(|| name.clone()),
            AnimationRef::Inline(descriptor) => Ok(descriptor.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_deserializes_both_forms() {
        let named: AnimationRef = serde_json::from_str(r#""fade-in""#).unwrap();
        assert_eq!(named, AnimationRef::Named("fade-in".to_string()));

        let inline: AnimationRef = serde_json::from_str(
            r#"{"duration": 300, "tracks": [{"key": "opacity", "from": 0, "to": 1}]}"#,
        )
        .unwrap();
        match inline {
            AnimationRef::Inline(desc) => {
                assert_eq!(desc.duration, 300.0);
                assert_eq!(desc.tracks[0].kind, TrackKind::Style);
                assert_eq!(desc.tracks[0].to, Value::Number(1.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_library_resolve() {
        let library = AnimationLibrary::new().with(
            "fade-in",
            AnimationDescriptor::new(200.0).style("opacity", 0.0, 1.0),
        );
        let desc = library.resolve(&AnimationRef::from("fade-in")).unwrap();
        assert_eq!(desc.duration, 200.0);
        assert_eq!(library.resolve(&AnimationRef::from("nope")), Err("nope".to_string()));

        let inline = AnimationDescriptor::new(50.0).with_delay(10.0);
        assert_eq!(library.resolve(&inline.clone().into()).unwrap(), inline);
        assert_eq!(inline.span(), 60.0);
    }

    #[test]
    fn test_final_values_split_by_kind() {
        let desc = AnimationDescriptor::new(100.0)
            .style("opacity", 0.0, 1.0)
            .property("value", 0.0, 10.0);
        let (styles, properties) = desc.final_values();
        assert_eq!(styles.get("opacity"), Some(&Value::Number(1.0)));
        assert_eq!(properties.get("value"), Some(&Value::Number(10.0)));
    }
}
