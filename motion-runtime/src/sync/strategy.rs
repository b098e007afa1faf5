//! # Strategy 模块
//!
//! 同步策略：把多个独立时长的动画调和为同一时间原点下的起点、时长与同步点。
//!
//! | 策略 | 起点 | 时长 | 组时长 |
//! |------|------|------|--------|
//! | 统一时长 | 0 | 可适配的改为组时长 | 显式或 `max(时长)` |
//! | 对齐同步点 | 0 | 可适配的统一缩放到目标时长 | 显式或 `max(结束)` |
//! | 同时开始 | 0 | 自身 | 显式或 `max(时长)` |
//! | 同时结束 | `组时长 - 自身`（可适配的为 0） | 可适配的拉伸到组时长 | 显式或 `max(时长)` |
//! | 级联 | `名次 * 间隔` | 自身 | 显式或 `max(结束)` |
//! | 自定义 | 回调 | 回调 | 显式或 `max(结束)` |

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::animation::AnimationDescriptor;
use crate::surface::TargetRef;

/// 标准同步点：开始
pub const POINT_START: &str = "start";
/// 标准同步点：中点
pub const POINT_MIDDLE: &str = "middle";
/// 标准同步点：结束
pub const POINT_END: &str = "end";

/// 参与同步的动画
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedAnimation {
    /// 动画 ID（组内唯一）
    pub id: String,
    /// 目标引用
    pub target: TargetRef,
    /// 动画描述
    pub animation: AnimationDescriptor,
    /// 名义时长
    pub duration: f64,
    /// 命名同步点（0..=1 的相对位置）
    pub sync_points: BTreeMap<String, f64>,
    /// 优先级（级联时同序号的高优先级在前）
    pub priority: i32,
    /// 声明顺序（级联排序依据）
    pub order: i32,
    /// 是否允许调整时长
    pub adapt: bool,
}

impl SyncedAnimation {
    /// 创建；名义时长取动画时长
    pub fn new(id: impl Into<String>, target: impl Into<TargetRef>, animation: AnimationDescriptor) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            duration: animation.duration,
            animation,
            sync_points: BTreeMap::new(),
            priority: 0,
            order: 0,
            adapt: false,
        }
    }

    /// 设置名义时长
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration.max(0.0);
        self
    }

    /// 添加同步点
    pub fn with_sync_point(mut self, name: impl Into<String>, position: f64) -> Self {
        self.sync_points.insert(name.into(), position.clamp(0.0, 1.0));
        self
    }

    /// 设置优先级
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 设置顺序
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// 允许调整时长
    pub fn adaptive(mut self) -> Self {
        self.adapt = true;
        self
    }

    /// 补齐标准同步点
    pub(crate) fn inject_standard_points(&mut self) {
        for (name, position) in [(POINT_START, 0.0), (POINT_MIDDLE, 0.5), (POINT_END, 1.0)] {
            self.sync_points.entry(name.to_string()).or_insert(position);
        }
    }
}

/// 单个动画的计算结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemTiming {
    /// 组时间中的起点
    pub start: f64,
    /// 时长
    pub duration: f64,
    /// 同步点（组时间中的绝对时间）
    pub sync_points: BTreeMap<String, f64>,
}

impl ItemTiming {
    /// 结束时间
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// 自定义计时函数：`(动画, 声明下标) -> 计时`
///
/// 返回的同步点为空时按动画的相对位置计算。
pub type CustomTiming = Rc<dyn Fn(&SyncedAnimation, usize) -> ItemTiming>;

/// 同步策略
#[derive(Clone, Default)]
pub enum SyncStrategy {
    /// 统一时长
    #[default]
    CommonDuration,
    /// 对齐同步点
    AlignSyncPoints,
    /// 同时开始
    SimultaneousStart,
    /// 同时结束
    SimultaneousEnd,
    /// 级联
    Cascade { offset: f64 },
    /// 自定义；没有函数时退化为统一时长
    Custom(Option<CustomTiming>),
}

impl std::fmt::Debug for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStrategy::CommonDuration => write!(f, "CommonDuration"),
            SyncStrategy::AlignSyncPoints => write!(f, "AlignSyncPoints"),
            SyncStrategy::SimultaneousStart => write!(f, "SimultaneousStart"),
            SyncStrategy::SimultaneousEnd => write!(f, "SimultaneousEnd"),
            SyncStrategy::Cascade { offset } => f.debug_struct("Cascade").field("offset", offset).finish(),
            SyncStrategy::Custom(function) => f.debug_tuple("Custom").field(&function.is_some()).finish(),
        }
    }
}

impl SyncStrategy {
    /// 自定义策略
    pub fn custom(function: impl Fn(&SyncedAnimation, usize) -> ItemTiming + 'static) -> Self {
        SyncStrategy::Custom(Some(Rc::new(function)))
    }
}

/// 组计算结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupTiming {
    /// 每个动画的计时（与声明顺序一致）
    pub items: Vec<ItemTiming>,
    /// 组时长
    pub duration: f64,
    /// 组同步点（绝对时间）
    pub sync_points: BTreeMap<String, f64>,
}

/// 计算组计时
///
/// `items` 应已补齐标准同步点；`group_points` 为组级同步点的相对位置。
pub fn compute(
    strategy: &SyncStrategy,
    items: &[SyncedAnimation],
    explicit_duration: Option<f64>,
    group_points: &BTreeMap<String, f64>,
) -> GroupTiming {
    let timings = match strategy {
        SyncStrategy::CommonDuration | SyncStrategy::Custom(None) => {
            common_duration(items, explicit_duration)
        }
        SyncStrategy::AlignSyncPoints => align_sync_points(items, explicit_duration, group_points),
        SyncStrategy::SimultaneousStart => simultaneous_start(items),
        SyncStrategy::SimultaneousEnd => simultaneous_end(items, explicit_duration),
        SyncStrategy::Cascade { offset } => cascade(items, *offset),
        SyncStrategy::Custom(Some(function)) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let mut timing = function(item, index);
                if timing.sync_points.is_empty() {
                    timing.sync_points = points_at(&item.sync_points, timing.start, timing.duration);
                }
                timing
            })
            .collect(),
    };

    let duration = explicit_duration.unwrap_or_else(|| match strategy {
        SyncStrategy::CommonDuration
        | SyncStrategy::Custom(None)
        | SyncStrategy::SimultaneousStart
        | SyncStrategy::SimultaneousEnd => max_duration(items),
        SyncStrategy::Cascade { .. } => cascade_rank(items).last().map_or(0.0, |&i| timings[i].end()),
        _ => timings.iter().map(ItemTiming::end).fold(0.0, f64::max),
    });

    let sync_points = group_sync_points(&timings, duration, group_points);
    GroupTiming {
        items: timings,
        duration,
        sync_points,
    }
}

fn max_duration(items: &[SyncedAnimation]) -> f64 {
    items.iter().map(|i| i.duration).fold(0.0, f64::max)
}

fn points_at(positions: &BTreeMap<String, f64>, start: f64, duration: f64) -> BTreeMap<String, f64> {
    positions
        .iter()
        .map(|(name, position)| (name.clone(), start + position * duration))
        .collect()
}

fn timing(item: &SyncedAnimation, start: f64, duration: f64) -> ItemTiming {
    ItemTiming {
        start,
        duration,
        sync_points: points_at(&item.sync_points, start, duration),
    }
}

fn common_duration(items: &[SyncedAnimation], explicit: Option<f64>) -> Vec<ItemTiming> {
    let group = explicit.unwrap_or_else(|| max_duration(items));
    items
        .iter()
        .map(|item| timing(item, 0.0, if item.adapt { group } else { item.duration }))
        .collect()
}

fn align_sync_points(
    items: &[SyncedAnimation],
    explicit: Option<f64>,
    group_points: &BTreeMap<String, f64>,
) -> Vec<ItemTiming> {
    let target = explicit.unwrap_or_else(|| {
        let fixed = items.iter().filter(|i| !i.adapt).map(|i| i.duration);
        match fixed.clone().next() {
            Some(_) => fixed.fold(0.0, f64::max),
            None => max_duration(items),
        }
    });

    items
        .iter()
        .map(|item| {
            // 同步点并集：动画自身声明的优先，其次是组级声明
            let mut positions = group_points.clone();
            positions.extend(item.sync_points.iter().map(|(k, v)| (k.clone(), *v)));

            let duration = if item.adapt { target } else { item.duration };
            ItemTiming {
                start: 0.0,
                duration,
                sync_points: points_at(&positions, 0.0, duration),
            }
        })
        .collect()
}

fn simultaneous_start(items: &[SyncedAnimation]) -> Vec<ItemTiming> {
    items.iter().map(|item| timing(item, 0.0, item.duration)).collect()
}

fn simultaneous_end(items: &[SyncedAnimation], explicit: Option<f64>) -> Vec<ItemTiming> {
    let group = explicit.unwrap_or_else(|| max_duration(items));
    items
        .iter()
        .map(|item| {
            if item.adapt {
                timing(item, 0.0, group)
            } else {
                timing(item, group - item.duration, item.duration)
            }
        })
        .collect()
}

/// 级联次序：`order` 升序，其次 `priority` 降序，最后按声明顺序
fn cascade_rank(items: &[SyncedAnimation]) -> Vec<usize> {
    let mut ranked: Vec<usize> = (0..items.len()).collect();
    ranked.sort_by_key(|&i| (items[i].order, std::cmp::Reverse(items[i].priority), i));
    ranked
}

fn cascade(items: &[SyncedAnimation], offset: f64) -> Vec<ItemTiming> {
    let mut timings = vec![ItemTiming::default(); items.len()];
    for (rank, &index) in cascade_rank(items).iter().enumerate() {
        let item = &items[index];
        timings[index] = timing(item, rank as f64 * offset, item.duration);
    }
    timings
}

/// 组同步点
///
/// - `start` / `middle` / `end` 固定为组时长的 0 / 0.5 / 1
/// - 组级声明的同步点按组时长换算
/// - 仅由动画声明的同步点取所有动画中最晚到达的时间
fn group_sync_points(
    timings: &[ItemTiming],
    duration: f64,
    group_points: &BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    let mut points = BTreeMap::new();
    for timing in timings {
        for (name, &time) in &timing.sync_points {
            points
                .entry(name.clone())
                .and_modify(|t: &mut f64| *t = t.max(time))
                .or_insert(time);
        }
    }
    for (name, position) in group_points {
        points.insert(name.clone(), position * duration);
    }
    points.insert(POINT_START.to_string(), 0.0);
    points.insert(POINT_MIDDLE.to_string(), duration / 2.0);
    points.insert(POINT_END.to_string(), duration);
    points
}
