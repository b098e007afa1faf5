//! # Easing 模块
//!
//! 缓动函数库，用于动画的时间插值。
//!
//! ## 两层结构
//!
//! - [`EasingDescriptor`]：声明式描述（可序列化，来自计划/阶段定义）
//! - [`Easing`]：解析后的可调用缓动，在构建期解析一次，热路径上只做计算
//!
//! 描述无效时（贝塞尔控制点越界、步数为 0、周期非正、未知名称……）
//! 统一降级为线性缓动并记录警告，不会让阶段失败。

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// 缓动函数类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EasingFunction {
    /// 线性（匀速）
    Linear,
    /// 缓入（先慢后快）
    EaseIn,
    /// 缓出（先快后慢）
    EaseOut,
    /// 缓入缓出（两头慢中间快）
    #[default]
    EaseInOut,
    /// 二次缓入
    EaseInQuad,
    /// 二次缓出
    EaseOutQuad,
    /// 二次缓入缓出
    EaseInOutQuad,
    /// 三次缓入
    EaseInCubic,
    /// 三次缓出
    EaseOutCubic,
    /// 三次缓入缓出
    EaseInOutCubic,
    /// 正弦缓入
    EaseInSine,
    /// 正弦缓出
    EaseOutSine,
    /// 正弦缓入缓出
    EaseInOutSine,
    /// 弹性缓出
    EaseOutElastic,
    /// 弹跳缓出
    EaseOutBounce,
}

impl EasingFunction {
    /// 计算缓动值
    ///
    /// # 参数
    /// - `t`: 时间进度 (0.0 - 1.0)
    ///
    /// # 返回
    /// - 缓动后的进度值
    pub fn apply(&self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);

        match self {
            EasingFunction::Linear => t,
            EasingFunction::EaseIn | EasingFunction::EaseInCubic => t * t * t,
            EasingFunction::EaseOut | EasingFunction::EaseOutCubic => 1.0 - (1.0 - t).powi(3),
            EasingFunction::EaseInOut | EasingFunction::EaseInOutCubic => {
                if t < 0.5 {
                    4.0 * t * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
                }
            }
            EasingFunction::EaseInQuad => t * t,
            EasingFunction::EaseOutQuad => 1.0 - (1.0 - t) * (1.0 - t),
            EasingFunction::EaseInOutQuad => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
                }
            }
            EasingFunction::EaseInSine => 1.0 - (t * PI / 2.0).cos(),
            EasingFunction::EaseOutSine => (t * PI / 2.0).sin(),
            EasingFunction::EaseInOutSine => -((PI * t).cos() - 1.0) / 2.0,
            EasingFunction::EaseOutElastic => elastic_out(t, 1.0, 0.3),
            EasingFunction::EaseOutBounce => ease_out_bounce(t),
        }
    }

    /// 按名称查找预设
    ///
    /// 忽略大小写、`-` 和 `_`，因此 `ease-in-out`、`easeInOut`、`EASE_IN_OUT` 等价。
    /// `ease` 视为 `ease-in-out`。
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();

        let easing = match normalized.as_str() {
            "linear" => Self::Linear,
            "easein" => Self::EaseIn,
            "easeout" => Self::EaseOut,
            "ease" | "easeinout" => Self::EaseInOut,
            "easeinquad" => Self::EaseInQuad,
            "easeoutquad" => Self::EaseOutQuad,
            "easeinoutquad" => Self::EaseInOutQuad,
            "easeincubic" => Self::EaseInCubic,
            "easeoutcubic" => Self::EaseOutCubic,
            "easeinoutcubic" => Self::EaseInOutCubic,
            "easeinsine" => Self::EaseInSine,
            "easeoutsine" => Self::EaseOutSine,
            "easeinoutsine" => Self::EaseInOutSine,
            "easeoutelastic" | "elastic" => Self::EaseOutElastic,
            "easeoutbounce" | "bounce" => Self::EaseOutBounce,
            _ => return None,
        };
        Some(easing)
    }
}

/// 阶梯缓动的边界策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepPosition {
    /// 在区间开始时跳变（`jump-start` / `start`）
    #[serde(alias = "jump-start")]
    Start,
    /// 在区间结束时跳变（`jump-end` / `end`）
    #[default]
    #[serde(alias = "jump-end")]
    End,
    /// 两端都不跳变
    #[serde(alias = "jump-none")]
    None,
    /// 两端都跳变
    #[serde(alias = "jump-both")]
    Both,
}

impl StepPosition {
    fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "start" | "jump-start" => Some(Self::Start),
            "end" | "jump-end" => Some(Self::End),
            "none" | "jump-none" => Some(Self::None),
            "both" | "jump-both" => Some(Self::Both),
            _ => None,
        }
    }
}

/// 组合缓动中的一项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedEasing {
    /// 预设名称
    pub name: String,
    /// 权重（非负）
    pub weight: f64,
}

/// 缓动描述
///
/// JSON 中可以直接写字符串，也可以写对象：
///
/// ```text
/// "ease-in-out"
/// "cubic-bezier(0.4, 0, 0.2, 1)"
/// "steps(4, end)"
/// { "bezier": [0.4, 0, 0.2, 1] }
/// { "steps": 4, "position": "start" }
/// { "amplitude": 1.2, "period": 0.4 }
/// { "composite": [{ "name": "ease-in", "weight": 1 }, { "name": "linear", "weight": 3 }] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EasingDescriptor {
    /// 预设名称或函数式字符串
    Named(String),
    /// 三次贝塞尔 `[x1, y1, x2, y2]`
    CubicBezier { bezier: [f64; 4] },
    /// 阶梯
    Steps {
        steps: u32,
        #[serde(default)]
        position: StepPosition,
    },
    /// 弹性
    Elastic { amplitude: f64, period: f64 },
    /// 加权组合
    Composite { composite: Vec<WeightedEasing> },
}

impl Default for EasingDescriptor {
    fn default() -> Self {
        Self::Named("ease-in-out".to_string())
    }
}

impl From<EasingFunction> for EasingDescriptor {
    fn from(value: EasingFunction) -> Self {
        // serde 名称与 from_name 兼容
        let name = serde_json::to_value(value)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "linear".to_string());
        Self::Named(name)
    }
}

impl EasingDescriptor {
    /// 解析为可调用的缓动
    ///
    /// 无效描述降级为线性。
    pub fn resolve(&self) -> Easing {
        match self.try_resolve() {
            Some(easing) => easing,
            None => {
                warn!(descriptor = ?self, "缓动描述无效，降级为线性");
                Easing::LINEAR
            }
        }
    }

    fn try_resolve(&self) -> Option<Easing> {
        match self {
            EasingDescriptor::Named(name) => parse_named(name),
            EasingDescriptor::CubicBezier { bezier } => {
                let [x1, y1, x2, y2] = *bezier;
                CubicBezier::new(x1, y1, x2, y2).map(Easing::CubicBezier)
            }
            EasingDescriptor::Steps { steps, position } => steps_easing(*steps, *position),
            EasingDescriptor::Elastic { amplitude, period } => elastic_easing(*amplitude, *period),
            EasingDescriptor::Composite { composite } => composite_easing(composite),
        }
    }
}

/// 解析可选描述；`None` 使用默认缓动（三次缓入缓出）
pub fn resolve_or_default(descriptor: Option<&EasingDescriptor>) -> Easing {
    descriptor.map(EasingDescriptor::resolve).unwrap_or_default()
}

/// 解析后的缓动
#[derive(Debug, Clone, PartialEq)]
pub enum Easing {
    /// 预设
    Preset(EasingFunction),
    /// 三次贝塞尔
    CubicBezier(CubicBezier),
    /// 阶梯
    Steps { count: u32, position: StepPosition },
    /// 弹性缓出
    Elastic { amplitude: f64, period: f64 },
    /// 加权组合（权重已归一化）
    Composite(Vec<(EasingFunction, f64)>),
}

impl Default for Easing {
    fn default() -> Self {
        Easing::Preset(EasingFunction::EaseInOut)
    }
}

impl Easing {
    /// 线性缓动
    pub const LINEAR: Easing = Easing::Preset(EasingFunction::Linear);

    /// 计算缓动值，输入会被限制到 [0, 1]
    pub fn apply(&self, t: f64) -> f64 {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        match self {
            Easing::Preset(f) => f.apply(t),
            Easing::CubicBezier(curve) => curve.solve(t),
            Easing::Steps { count, position } => apply_steps(t, *count, *position),
            Easing::Elastic { amplitude, period } => elastic_out(t, *amplitude, *period),
            Easing::Composite(parts) => parts.iter().map(|(f, w)| f.apply(t) * w).sum(),
        }
    }
}

/// 三次贝塞尔曲线，端点固定为 (0,0) 与 (1,1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubicBezier {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
}

impl CubicBezier {
    /// 创建曲线；x 控制点必须位于 [0, 1]
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Option<Self> {
        let finite = [x1, y1, x2, y2].iter().all(|v| v.is_finite());
        if !finite || !(0.0..=1.0).contains(&x1) || !(0.0..=1.0).contains(&x2) {
            return None;
        }
        Some(Self { x1, y1, x2, y2 })
    }

    fn sample(a1: f64, a2: f64, t: f64) -> f64 {
        let mt = 1.0 - t;
        3.0 * mt * mt * t * a1 + 3.0 * mt * t * t * a2 + t * t * t
    }

    fn sample_derivative(a1: f64, a2: f64, t: f64) -> f64 {
        let mt = 1.0 - t;
        3.0 * mt * mt * a1 + 6.0 * mt * t * (a2 - a1) + 3.0 * t * t * (1.0 - a2)
    }

    /// 求解 x = `x` 时的 y
    pub fn solve(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        if x >= 1.0 {
            return 1.0;
        }

        // 牛顿迭代，失败时回退到二分
        let mut t = x;
        for _ in 0..8 {
            let err = Self::sample(self.x1, self.x2, t) - x;
            if err.abs() < 1e-7 {
                return Self::sample(self.y1, self.y2, t);
            }
            let d = Self::sample_derivative(self.x1, self.x2, t);
            if d.abs() < 1e-6 {
                break;
            }
            t -= err / d;
        }

        let (mut lo, mut hi) = (0.0, 1.0);
        t = x;
        for _ in 0..64 {
            let value = Self::sample(self.x1, self.x2, t);
            if (value - x).abs() < 1e-7 {
                break;
            }
            if value < x {
                lo = t;
            } else {
                hi = t;
            }
            t = (lo + hi) / 2.0;
        }
        Self::sample(self.y1, self.y2, t)
    }
}

fn parse_named(raw: &str) -> Option<Easing> {
    let text = raw.trim();
    if let Some(preset) = EasingFunction::from_name(text) {
        return Some(Easing::Preset(preset));
    }

    let (name, args) = split_call(text)?;
    match name {
        "cubic-bezier" => {
            let values = parse_numbers(args)?;
            let [x1, y1, x2, y2] = <[f64; 4]>::try_from(values).ok()?;
            CubicBezier::new(x1, y1, x2, y2).map(Easing::CubicBezier)
        }
        "steps" => {
            let mut parts = args.split(',');
            let count = parts.next()?.trim().parse::<u32>().ok()?;
            let position = match parts.next() {
                Some(p) => StepPosition::from_name(p)?,
                None => StepPosition::End,
            };
            steps_easing(count, position)
        }
        "elastic" => {
            let values = parse_numbers(args)?;
            let [amplitude, period] = <[f64; 2]>::try_from(values).ok()?;
            elastic_easing(amplitude, period)
        }
        _ => None,
    }
}

/// `name(args)` -> (name, args)
fn split_call(text: &str) -> Option<(&str, &str)> {
    let open = text.find('(')?;
    let inner = text[open + 1..].strip_suffix(')')?;
    Some((text[..open].trim(), inner))
}

fn parse_numbers(args: &str) -> Option<Vec<f64>> {
    args.split(',')
        .map(|s| s.trim().parse::<f64>().ok())
        .collect()
}

fn steps_easing(count: u32, position: StepPosition) -> Option<Easing> {
    let minimum = if position == StepPosition::None { 2 } else { 1 };
    (count >= minimum).then_some(Easing::Steps { count, position })
}

fn elastic_easing(amplitude: f64, period: f64) -> Option<Easing> {
    let valid = amplitude.is_finite() && period.is_finite() && amplitude > 0.0 && period > 0.0;
    valid.then_some(Easing::Elastic { amplitude, period })
}

fn composite_easing(parts: &[WeightedEasing]) -> Option<Easing> {
    let mut resolved = Vec::with_capacity(parts.len());
    for part in parts {
        if !part.weight.is_finite() || part.weight < 0.0 {
            return None;
        }
        resolved.push((EasingFunction::from_name(&part.name)?, part.weight));
    }

    let total: f64 = resolved.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return None;
    }
    Some(Easing::Composite(
        resolved.into_iter().map(|(f, w)| (f, w / total)).collect(),
    ))
}

fn apply_steps(t: f64, count: u32, position: StepPosition) -> f64 {
    let n = f64::from(count);
    let step = (t * n).floor();
    let value = match position {
        StepPosition::End => step / n,
        StepPosition::Start => (step + 1.0) / n,
        StepPosition::None => step / (n - 1.0),
        StepPosition::Both => (step + 1.0) / (n + 1.0),
    };
    if t >= 1.0 { 1.0 } else { value.clamp(0.0, 1.0) }
}

/// 弹性缓出
fn elastic_out(t: f64, amplitude: f64, period: f64) -> f64 {
    if t == 0.0 {
        return 0.0;
    }
    if t == 1.0 {
        return 1.0;
    }
    let a = amplitude.max(1.0);
    let s = period / (2.0 * PI) * (1.0 / a).asin();
    a * 2.0_f64.powf(-10.0 * t) * ((t - s) * (2.0 * PI) / period).sin() + 1.0
}

/// 弹跳缓出
fn ease_out_bounce(t: f64) -> f64 {
    let n1 = 7.5625;
    let d1 = 2.75;

    if t < 1.0 / d1 {
        n1 * t * t
    } else if t < 2.0 / d1 {
        let t = t - 1.5 / d1;
        n1 * t * t + 0.75
    } else if t < 2.5 / d1 {
        let t = t - 2.25 / d1;
        n1 * t * t + 0.9375
    } else {
        let t = t - 2.625 / d1;
        n1 * t * t + 0.984375
    }
}
