//! # Decompose 模块
//!
//! 颜色 / 变换 / 路径的分量分解与重组。
//!
//! 分解属于外部协作方的职责（几何、颜色解析），插值引擎只通过
//! [`Decomposer`] 调用它。默认实现 [`NumericDecomposer`] 覆盖常见格式：
//!
//! - 颜色：`#rgb`、`#rgba`、`#rrggbb`、`#rrggbbaa`、`rgb(...)`、`rgba(...)`
//! - 变换与路径：数值模板（抽取字符串中的全部数字，按模板原样写回）

use super::Value;

/// 分量类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// 颜色（r, g, b, a）
    Color,
    /// 变换参数
    Transform,
    /// 路径坐标
    Path,
}

/// 分量分解器（外部协作方接口）
pub trait Decomposer {
    /// 把值分解为数值分量；无法识别时返回 `None`
    fn decompose(&self, kind: ChannelKind, value: &Value) -> Option<Vec<f64>>;

    /// 用分量重组值；`template` 为目标端点，用于保留格式
    fn recompose(&self, kind: ChannelKind, channels: &[f64], template: &Value) -> Option<Value>;
}

/// 默认分解器
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericDecomposer;

impl Decomposer for NumericDecomposer {
    fn decompose(&self, kind: ChannelKind, value: &Value) -> Option<Vec<f64>> {
        match (kind, value) {
            (ChannelKind::Color, Value::Text(text)) => parse_color(text).map(|c| c.to_vec()),
            (_, Value::Number(n)) => Some(vec![*n]),
            (_, Value::Text(text)) => Some(NumericTemplate::parse(text).numbers),
            (_, Value::List(items)) => items.iter().map(Value::as_number).collect(),
            _ => None,
        }
    }

    fn recompose(&self, kind: ChannelKind, channels: &[f64], template: &Value) -> Option<Value> {
        match (kind, template) {
            (ChannelKind::Color, _) => {
                let [r, g, b, a] = <[f64; 4]>::try_from(channels).ok()?;
                Some(Value::Text(format!(
                    "rgba({}, {}, {}, {})",
                    r.round().clamp(0.0, 255.0),
                    g.round().clamp(0.0, 255.0),
                    b.round().clamp(0.0, 255.0),
                    format_number(a.clamp(0.0, 1.0))
                )))
            }
            (_, Value::Number(_)) => channels.first().map(|n| Value::Number(*n)),
            (_, Value::Text(text)) => NumericTemplate::parse(text)
                .render(channels)
                .map(Value::Text),
            (_, Value::List(items)) if items.len() == channels.len() => Some(Value::List(
                channels.iter().map(|n| Value::Number(*n)).collect(),
            )),
            _ => None,
        }
    }
}

/// 格式化数值：整数不带小数，其余保留至多 3 位小数
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let text = format!("{value:.3}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

/// 解析颜色为 `[r, g, b, a]`（r/g/b 为 0-255，a 为 0-1）
pub fn parse_color(text: &str) -> Option<[f64; 4]> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix('#') {
        return parse_hex(hex);
    }

    let (name, args) = text.split_once('(')?;
    let args = args.strip_suffix(')')?;
    let values: Vec<f64> = args
        .split(',')
        .map(|s| s.trim().parse::<f64>().ok())
        .collect::<Option<_>>()?;
    match (name.trim(), values.as_slice()) {
        ("rgb", [r, g, b]) => Some([*r, *g, *b, 1.0]),
        ("rgba", [r, g, b, a]) => Some([*r, *g, *b, *a]),
        _ => None,
    }
}

fn parse_hex(hex: &str) -> Option<[f64; 4]> {
    let digits: Vec<u8> = hex
        .chars()
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<_>>()?;

    let expand = |d: u8| f64::from(d * 16 + d);
    let pair = |hi: u8, lo: u8| f64::from(hi * 16 + lo);

    match digits.as_slice() {
        [r, g, b] => Some([expand(*r), expand(*g), expand(*b), 1.0]),
        [r, g, b, a] => Some([expand(*r), expand(*g), expand(*b), expand(*a) / 255.0]),
        [r1, r2, g1, g2, b1, b2] => Some([pair(*r1, *r2), pair(*g1, *g2), pair(*b1, *b2), 1.0]),
        [r1, r2, g1, g2, b1, b2, a1, a2] => Some([
            pair(*r1, *r2),
            pair(*g1, *g2),
            pair(*b1, *b2),
            pair(*a1, *a2) / 255.0,
        ]),
        _ => None,
    }
}

/// 数值模板
///
/// `"translate(10px, 20px)"` -> 片段 `["translate(", "px, ", "px)"]` + 数值 `[10, 20]`
#[derive(Debug, Clone, PartialEq)]
pub struct NumericTemplate {
    /// 数值之间的文本片段（长度 = 数值个数 + 1）
    pub segments: Vec<String>,
    /// 抽取出的数值
    pub numbers: Vec<f64>,
}

impl NumericTemplate {
    /// 解析字符串
    pub fn parse(text: &str) -> Self {
        let bytes = text.as_bytes();
        let mut segments = Vec::new();
        let mut numbers = Vec::new();
        let mut segment_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            let starts_number = bytes[i].is_ascii_digit()
                || (bytes[i] == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit))
                || (bytes[i] == b'-'
                    && bytes
                        .get(i + 1)
                        .is_some_and(|b| b.is_ascii_digit() || *b == b'.')
                    && !preceded_by_word(bytes, i));

            if !starts_number {
                i += 1;
                continue;
            }

            let start = i;
            i += 1;
            let mut seen_dot = bytes[start] == b'.';
            while i < bytes.len() {
                match bytes[i] {
                    b'0'..=b'9' => i += 1,
                    b'.' if !seen_dot => {
                        seen_dot = true;
                        i += 1;
                    }
                    _ => break,
                }
            }

            match text[start..i].parse::<f64>() {
                Ok(n) => {
                    segments.push(text[segment_start..start].to_string());
                    numbers.push(n);
                    segment_start = i;
                }
                Err(_) => continue,
            }
        }
        segments.push(text[segment_start..].to_string());

        Self { segments, numbers }
    }

    /// 两个模板的文本片段是否一致（可逐数值插值）
    pub fn is_compatible(&self, other: &NumericTemplate) -> bool {
        self.segments == other.segments
    }

    /// 用新数值写回模板；数值个数不匹配时返回 `None`
    pub fn render(&self, numbers: &[f64]) -> Option<String> {
        if numbers.len() != self.numbers.len() {
            return None;
        }
        let mut out = String::new();
        for (i, segment) in self.segments.iter().enumerate() {
            out.push_str(segment);
            if let Some(n) = numbers.get(i) {
                out.push_str(&format_number(*n));
            }
        }
        Some(out)
    }
}

/// `-` 前是字母时视为连字符（如 `ease-in`），而不是负号
fn preceded_by_word(bytes: &[u8], i: usize) -> bool {
    i > 0 && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_')
}

/// 解析 CSS 值为 (数值, 单位)
pub fn parse_css_value(value: &Value) -> Option<(f64, String)> {
    match value {
        Value::Number(n) => Some((*n, String::new())),
        Value::Text(text) => {
            let text = text.trim();
            let split = text
                .char_indices()
                .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*c == '-' && *i == 0) || *c == '+'))
                .map(|(i, _)| i)
                .unwrap_or(text.len());
            let number = text[..split].parse::<f64>().ok()?;
            Some((number, text[split..].trim().to_string()))
        }
        _ => None,
    }
}
