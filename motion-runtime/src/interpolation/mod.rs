//! # Interpolation 模块
//!
//! 按类型分派的值插值与混合。
//!
//! ## 分派表
//!
//! | 类型 | 策略 |
//! |------|------|
//! | `number` | 线性插值，可选 clamp 和吸附 |
//! | `color` / `transform` / `path` | 经 [`Decomposer`] 分解为分量，逐分量插值后重组 |
//! | `array` / `object` | 按类型表逐元素/逐字段递归 |
//! | `string` | 数值模板一致时逐数值插值，否则在 0.5 处切换 |
//! | `css-value` | 单位一致时插值数值，否则在 0.5 处切换 |
//!
//! 形状不一致的列表/对象（多出或缺少的元素、未声明类型的字段）在进度 0.5 处
//! 整体切换，而不是渐变。

mod blend;
mod decompose;
mod value;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

pub use blend::{BlendMode, blend_numbers};
pub use decompose::{
    ChannelKind, Decomposer, NumericDecomposer, NumericTemplate, format_number, parse_color,
    parse_css_value,
};
pub use value::{InterpolationConfig, PropertyConfig, PropertyType, Value};

use crate::easing::Easing;

/// 默认吸附阈值：范围的 5%
pub const DEFAULT_SNAP_THRESHOLD: f64 = 0.05;

/// 自定义插值器
pub type CustomInterpolator = Rc<dyn Fn(&Value, &Value, f64) -> Value>;

/// 自定义混合函数 `(a, b, progress) -> value`
pub type CustomBlend = Rc<dyn Fn(f64, f64, f64) -> f64>;

/// 线性插值
pub fn lerp(from: f64, to: f64, progress: f64) -> f64 {
    from + (to - from) * progress
}

/// 标量插值：线性插值 -> clamp -> 吸附
///
/// 吸附阈值为 `threshold_ratio * 范围`，范围优先取 clamp 区间宽度，否则取 `|to - from|`。
pub fn interpolate_number(
    from: f64,
    to: f64,
    progress: f64,
    clamp: Option<[f64; 2]>,
    snap: &[f64],
    threshold_ratio: f64,
) -> f64 {
    let mut value = lerp(from, to, progress);

    let range = match clamp {
        Some([a, b]) => {
            let (min, max) = if a <= b { (a, b) } else { (b, a) };
            value = value.clamp(min, max);
            max - min
        }
        None => (to - from).abs(),
    };

    if !snap.is_empty() {
        let threshold = range * threshold_ratio;
        let nearest = snap
            .iter()
            .copied()
            .min_by(|a, b| (a - value).abs().total_cmp(&(b - value).abs()));
        if let Some(point) = nearest
            && (point - value).abs() <= threshold
        {
            value = point;
        }
    }

    value
}

/// 在 0.5 处整体切换
fn switch_at_half(from: &Value, to: &Value, progress: f64) -> Value {
    if progress < 0.5 {
        from.clone()
    } else {
        to.clone()
    }
}

/// 编译后的属性配置（缓动、自定义插值器已解析）
#[derive(Clone)]
pub struct CompiledProperty {
    /// 类型
    pub kind: PropertyType,
    /// 限制范围
    pub clamp: Option<[f64; 2]>,
    /// 吸附点
    pub snap: Vec<f64>,
    /// 属性缓动
    pub easing: Option<Easing>,
    /// 属性延迟（进度比例）
    pub delay: f64,
    /// 自定义插值器
    pub custom: Option<CustomInterpolator>,
}

impl std::fmt::Debug for CompiledProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProperty")
            .field("kind", &self.kind)
            .field("clamp", &self.clamp)
            .field("snap", &self.snap)
            .field("easing", &self.easing)
            .field("delay", &self.delay)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl CompiledProperty {
    /// 把总进度映射为属性进度（先延迟，再缓动）
    pub fn local_progress(&self, progress: f64) -> f64 {
        let progress = progress.clamp(0.0, 1.0);
        let delayed = if self.delay <= 0.0 {
            progress
        } else if self.delay >= 1.0 {
            if progress >= 1.0 { 1.0 } else { 0.0 }
        } else {
            ((progress - self.delay) / (1.0 - self.delay)).clamp(0.0, 1.0)
        };
        match &self.easing {
            Some(easing) => easing.apply(delayed),
            None => delayed,
        }
    }
}

impl Default for CompiledProperty {
    fn default() -> Self {
        Self {
            kind: PropertyType::Number,
            clamp: None,
            snap: Vec::new(),
            easing: None,
            delay: 0.0,
            custom: None,
        }
    }
}

/// 编译后的插值配置
#[derive(Debug, Clone, Default)]
pub struct CompiledInterpolation {
    properties: BTreeMap<String, CompiledProperty>,
    /// 全局混合模式
    pub blend_mode: BlendMode,
}

impl CompiledInterpolation {
    /// 获取属性配置
    pub fn property(&self, key: &str) -> Option<&CompiledProperty> {
        self.properties.get(key)
    }
}

/// 插值器
///
/// 持有分解器和自定义插值器/混合函数注册表。
pub struct Interpolator {
    decomposer: Rc<dyn Decomposer>,
    interpolators: HashMap<String, CustomInterpolator>,
    blends: HashMap<String, CustomBlend>,
    snap_threshold_ratio: f64,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Interpolator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpolator")
            .field("interpolators", &self.interpolators.len())
            .field("blends", &self.blends.len())
            .field("snap_threshold_ratio", &self.snap_threshold_ratio)
            .finish()
    }
}

impl Interpolator {
    /// 创建使用默认分解器的插值器
    pub fn new() -> Self {
        Self {
            decomposer: Rc::new(NumericDecomposer),
            interpolators: HashMap::new(),
            blends: HashMap::new(),
            snap_threshold_ratio: DEFAULT_SNAP_THRESHOLD,
        }
    }

    /// 替换分解器
    pub fn with_decomposer(mut self, decomposer: Rc<dyn Decomposer>) -> Self {
        self.decomposer = decomposer;
        self
    }

    /// 设置吸附阈值比例
    pub fn with_snap_threshold(mut self, ratio: f64) -> Self {
        self.snap_threshold_ratio = ratio.max(0.0);
        self
    }

    /// 注册自定义插值器
    pub fn register_interpolator(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&Value, &Value, f64) -> Value + 'static,
    ) {
        self.interpolators.insert(name.into(), Rc::new(f));
    }

    /// 注册自定义混合函数
    pub fn register_blend(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(f64, f64, f64) -> f64 + 'static,
    ) {
        self.blends.insert(name.into(), Rc::new(f));
    }

    /// 编译插值配置
    ///
    /// 缓动描述在这里解析一次；未注册的自定义插值器记录警告并回退到类型分派。
    pub fn compile(&self, config: &InterpolationConfig) -> CompiledInterpolation {
        let properties = config
            .properties
            .iter()
            .map(|(key, prop)| {
                let custom = prop.custom.as_ref().and_then(|name| {
                    let found = self.interpolators.get(name).cloned();
                    if found.is_none() {
                        tracing::warn!(property = %key, interpolator = %name, "自定义插值器未注册，回退到类型分派");
                    }
                    found
                });
                let compiled = CompiledProperty {
                    kind: prop.kind.clone(),
                    clamp: prop.clamp,
                    snap: prop.snap.clone(),
                    easing: prop.easing.as_ref().map(|e| e.resolve()),
                    delay: prop.delay.clamp(0.0, 1.0),
                    custom,
                };
                (key.clone(), compiled)
            })
            .collect();

        CompiledInterpolation {
            properties,
            blend_mode: config.blend_mode.clone(),
        }
    }

    /// 按类型插值
    pub fn interpolate(&self, kind: &PropertyType, from: &Value, to: &Value, progress: f64) -> Value {
        let p = progress.clamp(0.0, 1.0);
        match kind {
            PropertyType::Number => match (from, to) {
                (Value::Number(a), Value::Number(b)) => Value::Number(lerp(*a, *b, p)),
                _ => switch_at_half(from, to, p),
            },
            PropertyType::Color => self.interpolate_channels(ChannelKind::Color, from, to, p),
            PropertyType::Transform => self.interpolate_channels(ChannelKind::Transform, from, to, p),
            PropertyType::Path => self.interpolate_channels(ChannelKind::Path, from, to, p),
            PropertyType::String => interpolate_string(from, to, p),
            PropertyType::CssValue => interpolate_css(from, to, p),
            PropertyType::Array { element } => match (from, to) {
                (Value::List(a), Value::List(b)) => {
                    let len = if p < 0.5 { a.len() } else { b.len() };
                    let items = (0..len)
                        .map(|i| match (a.get(i), b.get(i)) {
                            (Some(x), Some(y)) => self.interpolate(element, x, y, p),
                            (Some(x), None) => x.clone(),
                            (None, Some(y)) => y.clone(),
                            (None, None) => unreachable!("index within active length"),
                        })
                        .collect();
                    Value::List(items)
                }
                _ => switch_at_half(from, to, p),
            },
            PropertyType::Object { fields } => match (from, to) {
                (Value::Map(a), Value::Map(b)) => {
                    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
                    let mut out = BTreeMap::new();
                    for key in keys {
                        let value = match (a.get(key), b.get(key)) {
                            (Some(x), Some(y)) => match fields.get(key) {
                                Some(field_kind) => self.interpolate(field_kind, x, y, p),
                                None => switch_at_half(x, y, p),
                            },
                            (Some(x), None) if p < 0.5 => x.clone(),
                            (None, Some(y)) if p >= 0.5 => y.clone(),
                            _ => continue,
                        };
                        out.insert(key.clone(), value);
                    }
                    Value::Map(out)
                }
                _ => switch_at_half(from, to, p),
            },
        }
    }

    fn interpolate_channels(&self, kind: ChannelKind, from: &Value, to: &Value, p: f64) -> Value {
        let channels = self
            .decomposer
            .decompose(kind, from)
            .zip(self.decomposer.decompose(kind, to));

        let Some((a, b)) = channels else {
            return switch_at_half(from, to, p);
        };
        if a.len() != b.len() {
            return switch_at_half(from, to, p);
        }

        let mixed: Vec<f64> = a.iter().zip(&b).map(|(x, y)| lerp(*x, *y, p)).collect();
        self.decomposer
            .recompose(kind, &mixed, to)
            .unwrap_or_else(|| switch_at_half(from, to, p))
    }

    /// 按属性配置插值（延迟、缓动、自定义插值器、clamp、吸附）
    ///
    /// 未在配置中声明的属性按 `number` 处理。
    pub fn interpolate_property(
        &self,
        compiled: &CompiledInterpolation,
        key: &str,
        from: &Value,
        to: &Value,
        progress: f64,
    ) -> Value {
        let fallback = CompiledProperty::default();
        let prop = compiled.property(key).unwrap_or(&fallback);
        let local = prop.local_progress(progress);

        if let Some(custom) = &prop.custom {
            return custom(from, to, local);
        }

        match (&prop.kind, from, to) {
            (PropertyType::Number, Value::Number(a), Value::Number(b)) => Value::Number(
                interpolate_number(*a, *b, local, prop.clamp, &prop.snap, self.snap_threshold_ratio),
            ),
            (kind, _, _) => self.interpolate(kind, from, to, local),
        }
    }

    /// 轨道取值
    ///
    /// 全局混合模式为 `Override` 时等同于 [`interpolate_property`](Self::interpolate_property)；
    /// 其他模式先按属性配置求出两端的值，再以局部进度混合。
    pub fn track_value(
        &self,
        compiled: &CompiledInterpolation,
        key: &str,
        from: &Value,
        to: &Value,
        progress: f64,
    ) -> Value {
        if matches!(compiled.blend_mode, BlendMode::Override) {
            return self.interpolate_property(compiled, key, from, to, progress);
        }
        let start = self.interpolate_property(compiled, key, from, to, 0.0);
        let end = self.interpolate_property(compiled, key, from, to, 1.0);
        let fallback = CompiledProperty::default();
        let local = compiled.property(key).unwrap_or(&fallback).local_progress(progress);
        self.blend(&start, &end, local, &compiled.blend_mode)
    }

    /// 插值整个属性表
    ///
    /// 两端都有的键逐属性插值；只在一端出现的键在 0.5 处切换。
    pub fn interpolate_map(
        &self,
        compiled: &CompiledInterpolation,
        from: &BTreeMap<String, Value>,
        to: &BTreeMap<String, Value>,
        progress: f64,
    ) -> BTreeMap<String, Value> {
        let keys: BTreeSet<&String> = from.keys().chain(to.keys()).collect();
        let mut out = BTreeMap::new();
        for key in keys {
            let value = match (from.get(key), to.get(key)) {
                (Some(a), Some(b)) => self.interpolate_property(compiled, key, a, b, progress),
                (Some(a), None) if progress < 0.5 => a.clone(),
                (None, Some(b)) if progress >= 0.5 => b.clone(),
                _ => continue,
            };
            out.insert(key.clone(), value);
        }
        out
    }

    /// 混合两个已插值的值
    pub fn blend(&self, a: &Value, b: &Value, progress: f64, mode: &BlendMode) -> Value {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Value::Number(self.blend_number(*x, *y, progress, mode)),
            (Value::List(xs), Value::List(ys)) if xs.len() == ys.len() => Value::List(
                xs.iter()
                    .zip(ys)
                    .map(|(x, y)| self.blend(x, y, progress, mode))
                    .collect(),
            ),
            (Value::Map(xs), Value::Map(ys)) => {
                let mut out = xs.clone();
                for (key, y) in ys {
                    let value = match xs.get(key) {
                        Some(x) => self.blend(x, y, progress, mode),
                        None if progress >= 1.0 => y.clone(),
                        None => continue,
                    };
                    out.insert(key.clone(), value);
                }
                Value::Map(out)
            }
            _ => {
                if progress >= 1.0 {
                    b.clone()
                } else {
                    a.clone()
                }
            }
        }
    }

    fn blend_number(&self, a: f64, b: f64, progress: f64, mode: &BlendMode) -> f64 {
        if let BlendMode::Custom(name) = mode {
            match self.blends.get(name) {
                Some(f) => return f(a, b, progress.clamp(0.0, 1.0)),
                None => tracing::warn!(blend = %name, "自定义混合函数未注册，按 override 处理"),
            }
        }
        blend_numbers(a, b, progress, mode)
    }
}

fn interpolate_string(from: &Value, to: &Value, p: f64) -> Value {
    let (Some(a), Some(b)) = (from.as_text(), to.as_text()) else {
        return switch_at_half(from, to, p);
    };
    let ta = NumericTemplate::parse(a);
    let tb = NumericTemplate::parse(b);
    if ta.numbers.is_empty() || !ta.is_compatible(&tb) {
        return switch_at_half(from, to, p);
    }
    let mixed: Vec<f64> = ta
        .numbers
        .iter()
        .zip(&tb.numbers)
        .map(|(x, y)| lerp(*x, *y, p))
        .collect();
    tb.render(&mixed)
        .map(Value::Text)
        .unwrap_or_else(|| switch_at_half(from, to, p))
}

fn interpolate_css(from: &Value, to: &Value, p: f64) -> Value {
    match (parse_css_value(from), parse_css_value(to)) {
        (Some((a, ua)), Some((b, ub))) if ua == ub || (a == 0.0 && ua.is_empty()) => {
            Value::Text(format!("{}{}", format_number(lerp(a, b, p)), ub))
        }
        _ => switch_at_half(from, to, p),
    }
}
