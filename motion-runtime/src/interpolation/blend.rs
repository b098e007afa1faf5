//! # Blend 模块
//!
//! 混合模式：把两个已插值的值按进度组合。

use serde::{Deserialize, Serialize};

/// 混合模式
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlendMode {
    /// 覆盖：进度到达 1 时取 `b`，否则保持 `a`
    #[default]
    Override,
    /// 叠加：`a + b * p`
    Additive,
    /// 乘法：`a * (b / a)^p`
    Multiply,
    /// 平均：从 `a` 向 `(a + b) / 2` 过渡
    Average,
    /// 取小
    Min,
    /// 取大
    Max,
    /// 自定义混合（在 `Interpolator` 中注册的名称）
    Custom(String),
}

/// 数值混合
///
/// `Custom` 在这里没有实现，按 `Override` 处理；自定义混合由 `Interpolator` 分派。
pub fn blend_numbers(a: f64, b: f64, progress: f64, mode: &BlendMode) -> f64 {
    let p = progress.clamp(0.0, 1.0);
    match mode {
        BlendMode::Override | BlendMode::Custom(_) => {
            if p >= 1.0 {
                b
            } else {
                a
            }
        }
        BlendMode::Additive => a + b * p,
        BlendMode::Multiply => {
            let ratio = b / a;
            if a == 0.0 || !ratio.is_finite() || ratio < 0.0 {
                // 比值无意义时退化为线性
                a + (b - a) * p
            } else {
                a * ratio.powf(p)
            }
        }
        BlendMode::Average => a + ((a + b) / 2.0 - a) * p,
        BlendMode::Min => a.min(b),
        BlendMode::Max => a.max(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiply_geometric() {
        let v = blend_numbers(10.0, 20.0, 0.5, &BlendMode::Multiply);
        assert!((v - 14.142).abs() < 1e-3);
    }

    #[test]
    fn test_multiply_degenerate_falls_back_to_lerp() {
        assert_eq!(blend_numbers(0.0, 10.0, 0.5, &BlendMode::Multiply), 5.0);
        assert_eq!(blend_numbers(-2.0, 2.0, 0.5, &BlendMode::Multiply), 0.0);
    }

    #[test]
    fn test_override_switches_at_end() {
        assert_eq!(blend_numbers(1.0, 2.0, 0.99, &BlendMode::Override), 1.0);
        assert_eq!(blend_numbers(1.0, 2.0, 1.0, &BlendMode::Override), 2.0);
    }

    #[test]
    fn test_other_modes() {
        assert_eq!(blend_numbers(1.0, 2.0, 0.5, &BlendMode::Additive), 2.0);
        assert_eq!(blend_numbers(2.0, 4.0, 1.0, &BlendMode::Average), 3.0);
        assert_eq!(blend_numbers(2.0, 4.0, 0.3, &BlendMode::Min), 2.0);
        assert_eq!(blend_numbers(2.0, 4.0, 0.3, &BlendMode::Max), 4.0);
    }

    #[test]
    fn test_blend_mode_serde() {
        let mode: BlendMode = serde_json::from_str(r#""multiply""#).unwrap();
        assert_eq!(mode, BlendMode::Multiply);
        let custom: BlendMode = serde_json::from_str(r#"{"custom":"screen"}"#).unwrap();
        assert_eq!(custom, BlendMode::Custom("screen".to_string()));
    }
}
