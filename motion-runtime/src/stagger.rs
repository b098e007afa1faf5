//! # Stagger 模块
//!
//! 为 N 个目标生成错开的延迟。
//!
//! ## 计算步骤
//!
//! 1. 排序：分组策略（类别顺序 / 行 / 列）与方向排序（按空间坐标）决定序列；都未指定时保持输入顺序
//! 2. 分布模式把序列位置映射为等级：线性、反向、由中心向外、由边缘向内
//! 3. 基础延迟 `rank * delay`，再按分布缓动重塑（保持总跨度不变）
//! 4. 叠加逐目标的延迟偏移
//! 5. 若设置了总时长上限，按比例缩放延迟，使最后一项的 `delay + duration` 恰好等于上限

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// 分布模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionPattern {
    /// 按顺序
    #[default]
    Linear,
    /// 逆序
    Reversed,
    /// 由中心向外（对称位置同时开始）
    FromCenter,
    /// 由边缘向内
    FromEdges,
}

/// 分组策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "kebab-case")]
pub enum Grouping {
    /// 按类别的显式顺序；未列出的类别按首次出现排在后面
    Category { order: Vec<String> },
    /// 按行号
    Row,
    /// 按列号
    Column,
}

/// 方向排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpatialDirection {
    /// y 升序
    TopToBottom,
    /// y 降序
    BottomToTop,
    /// x 升序
    LeftToRight,
    /// x 降序
    RightToLeft,
}

/// 分布缓动（作用于归一化等级）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionEasing {
    /// 均匀
    #[default]
    Linear,
    /// 开头密集，结尾稀疏
    EaseIn,
    /// 开头稀疏，结尾密集
    EaseOut,
}

impl DistributionEasing {
    fn apply(self, t: f64) -> f64 {
        match self {
            DistributionEasing::Linear => t,
            DistributionEasing::EaseIn => t * t,
            DistributionEasing::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
        }
    }
}

/// 错开配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StaggerConfig {
    /// 相邻等级之间的延迟（毫秒）
    #[serde(default)]
    pub delay: f64,
    /// 分布模式
    #[serde(default)]
    pub pattern: DistributionPattern,
    /// 分组策略
    #[serde(default)]
    pub grouping: Option<Grouping>,
    /// 方向排序
    #[serde(default)]
    pub direction: Option<SpatialDirection>,
    /// 分布缓动
    #[serde(default)]
    pub easing: DistributionEasing,
    /// 总时长上限（毫秒）
    #[serde(default)]
    pub max_total_duration: Option<f64>,
}

impl StaggerConfig {
    /// 创建线性错开配置
    pub fn linear(delay: f64) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// 设置分布模式
    pub fn with_pattern(mut self, pattern: DistributionPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// 设置分组策略
    pub fn with_grouping(mut self, grouping: Grouping) -> Self {
        self.grouping = Some(grouping);
        self
    }

    /// 设置方向排序
    pub fn with_direction(mut self, direction: SpatialDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    /// 设置分布缓动
    pub fn with_easing(mut self, easing: DistributionEasing) -> Self {
        self.easing = easing;
        self
    }

    /// 设置总时长上限
    pub fn with_max_total_duration(mut self, max: f64) -> Self {
        self.max_total_duration = Some(max);
        self
    }
}

/// 错开目标
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StaggerTarget {
    /// 目标引用
    pub id: String,
    /// 类别
    #[serde(default)]
    pub category: Option<String>,
    /// 空间坐标 `[x, y]`
    #[serde(default)]
    pub position: Option<[f64; 2]>,
    /// 行号
    #[serde(default)]
    pub row: Option<usize>,
    /// 列号
    #[serde(default)]
    pub column: Option<usize>,
    /// 时长覆盖
    #[serde(default)]
    pub duration: Option<f64>,
    /// 额外延迟（叠加在计算结果上）
    #[serde(default)]
    pub delay_offset: f64,
}

impl StaggerTarget {
    /// 创建目标
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// 设置类别
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// 设置坐标
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Some([x, y]);
        self
    }

    /// 设置行列
    pub fn in_cell(mut self, row: usize, column: usize) -> Self {
        self.row = Some(row);
        self.column = Some(column);
        self
    }

    /// 设置时长覆盖
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// 设置额外延迟
    pub fn with_delay_offset(mut self, offset: f64) -> Self {
        self.delay_offset = offset;
        self
    }
}

/// 单个目标的计算结果
#[derive(Debug, Clone, PartialEq)]
pub struct StaggerSlot {
    /// 目标引用
    pub id: String,
    /// 在排序后序列中的位置
    pub order: usize,
    /// 分布等级
    pub rank: usize,
    /// 延迟（毫秒）
    pub delay: f64,
    /// 时长（毫秒）
    pub duration: f64,
}

impl StaggerSlot {
    /// 结束时间
    pub fn end(&self) -> f64 {
        self.delay + self.duration
    }
}

/// 错开计划（按输入顺序）
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StaggerPlan {
    /// 每个目标的结果
    pub slots: Vec<StaggerSlot>,
    /// 总跨度 `max(delay + duration)`
    pub total: f64,
}

impl StaggerPlan {
    /// 延迟列表（按输入顺序）
    pub fn delays(&self) -> Vec<f64> {
        self.slots.iter().map(|s| s.delay).collect()
    }
}

/// 计算错开计划
///
/// `base_duration` 用于没有时长覆盖的目标。
pub fn distribute(targets: &[StaggerTarget], base_duration: f64, config: &StaggerConfig) -> StaggerPlan {
    let n = targets.len();
    if n == 0 {
        return StaggerPlan::default();
    }

    let ordering = order_targets(targets, config);
    let mut order_of = vec![0; n];
    for (pos, &i) in ordering.iter().enumerate() {
        order_of[i] = pos;
    }

    let ranks: Vec<usize> = order_of
        .iter()
        .map(|&pos| pattern_rank(pos, n, config.pattern))
        .collect();
    let max_rank = ranks.iter().copied().max().unwrap_or(0);
    let span = max_rank as f64 * config.delay.max(0.0);

    let mut slots: Vec<StaggerSlot> = targets
        .iter()
        .enumerate()
        .map(|(i, target)| {
            let base = if max_rank == 0 {
                0.0
            } else {
                config.easing.apply(ranks[i] as f64 / max_rank as f64) * span
            };
            StaggerSlot {
                id: target.id.clone(),
                order: order_of[i],
                rank: ranks[i],
                delay: (base + target.delay_offset).max(0.0),
                duration: target.duration.unwrap_or(base_duration).max(0.0),
            }
        })
        .collect();

    if let Some(cap) = config.max_total_duration {
        apply_cap(&mut slots, cap.max(0.0));
    }

    let total = slots.iter().map(StaggerSlot::end).fold(0.0, f64::max);
    StaggerPlan { slots, total }
}

/// 排序：返回按序列排列的输入下标
fn order_targets(targets: &[StaggerTarget], config: &StaggerConfig) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..targets.len()).collect();
    if config.grouping.is_none() && config.direction.is_none() {
        return indices;
    }

    let group_keys: Vec<usize> = match &config.grouping {
        Some(Grouping::Category { order }) => {
            let mut extra: Vec<&str> = Vec::new();
            targets
                .iter()
                .map(|t| {
                    let category = t.category.as_deref().unwrap_or("");
                    match order.iter().position(|c| c == category) {
                        Some(pos) => pos,
                        None => {
                            let pos = match extra.iter().position(|c| *c == category) {
                                Some(p) => p,
                                None => {
                                    extra.push(category);
                                    extra.len() - 1
                                }
                            };
                            order.len() + pos
                        }
                    }
                })
                .collect()
        }
        Some(Grouping::Row) => targets.iter().map(|t| t.row.unwrap_or(usize::MAX)).collect(),
        Some(Grouping::Column) => targets.iter().map(|t| t.column.unwrap_or(usize::MAX)).collect(),
        None => vec![0; targets.len()],
    };

    indices.sort_by(|&a, &b| {
        group_keys[a]
            .cmp(&group_keys[b])
            .then_with(|| match config.direction {
                Some(direction) => compare_direction(&targets[a], &targets[b], direction),
                None => Ordering::Equal,
            })
    });
    indices
}

fn compare_direction(a: &StaggerTarget, b: &StaggerTarget, direction: SpatialDirection) -> Ordering {
    // 没有坐标的目标排在最后
    let key = |t: &StaggerTarget| -> f64 {
        match (t.position, direction) {
            (Some([_, y]), SpatialDirection::TopToBottom) => y,
            (Some([_, y]), SpatialDirection::BottomToTop) => -y,
            (Some([x, _]), SpatialDirection::LeftToRight) => x,
            (Some([x, _]), SpatialDirection::RightToLeft) => -x,
            (None, _) => f64::INFINITY,
        }
    };
    key(a).total_cmp(&key(b))
}

fn pattern_rank(pos: usize, n: usize, pattern: DistributionPattern) -> usize {
    let center = (n as f64 - 1.0) / 2.0;
    let center_rank = |p: usize| (p as f64 - center).abs().floor() as usize;
    match pattern {
        DistributionPattern::Linear => pos,
        DistributionPattern::Reversed => n - 1 - pos,
        DistributionPattern::FromCenter => center_rank(pos),
        DistributionPattern::FromEdges => center_rank(0) - center_rank(pos),
    }
}

/// 按比例缩放延迟，使最后一项恰好在 `cap` 结束
///
/// "最后一项"是延迟最大的项（并列时取序列中靠后的）。若它的延迟为 0 或自身时长
/// 已经不小于上限，则所有延迟归零，并按比例压缩时长。
fn apply_cap(slots: &mut [StaggerSlot], cap: f64) {
    let Some(last) = slots
        .iter()
        .max_by(|a, b| a.delay.total_cmp(&b.delay).then(a.order.cmp(&b.order)))
        .cloned()
    else {
        return;
    };

    if last.delay > 0.0 && cap > last.duration {
        let scale = (cap - last.duration) / last.delay;
        for slot in slots.iter_mut() {
            slot.delay *= scale;
        }
        return;
    }

    let longest = slots.iter().map(|s| s.duration).fold(0.0, f64::max);
    for slot in slots.iter_mut() {
        slot.delay = 0.0;
        if longest > 0.0 {
            slot.duration *= cap / longest;
        }
    }
}
