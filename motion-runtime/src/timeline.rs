//! # Timeline 模块
//!
//! 把阶段声明与关系提示编译为绝对时间。
//!
//! ## 放置规则
//!
//! 顶层阶段按依赖拓扑序逐个放置，放置提示 [`Placement`] 决定默认起点：
//!
//! | 提示 | 起点 |
//! |------|------|
//! | `sequential` | 上一阶段结束 |
//! | `parallel` | 0 |
//! | `stagger(d)` | `index * d` |
//! | `cascade(o)` | 上一阶段结束 - `o`（不小于 0） |
//!
//! 组内子阶段由 [`GroupRelationship`] 决定相对组起点的偏移。
//!
//! 无论哪种提示，计算出的起点都不早于依赖阶段的结束时间；显式 `start_time`
//! 总是覆盖计算结果（顶层为绝对时间，组内相对组起点）。
//!
//! 单个阶段的跨度为 `duration * (repeat + 1) + repeat_delay * repeat`。
//! 依赖只在同一层级的兄弟阶段之间解析。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::animation::{AnimationDescriptor, AnimationLibrary, AnimationRef};
use crate::easing::{Easing, EasingDescriptor, resolve_or_default};
use crate::error::TimelineError;
use crate::graph::{self, DependencyNode};
use crate::interpolation::format_number;
use crate::stagger::{StaggerConfig, StaggerTarget, distribute};
use crate::surface::{MotionPreference, NoPreference, TargetRef};

/// 播放方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// 正向
    #[default]
    Normal,
    /// 反向
    Reverse,
    /// 奇数次迭代反向
    Alternate,
    /// 偶数次迭代反向
    AlternateReverse,
}

/// 组内关系
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GroupRelationship {
    /// 全部从组起点开始
    #[default]
    StartTogether,
    /// 全部在组结束时结束
    EndTogether,
    /// 相邻子阶段重叠 `amount` 毫秒
    Overlap { amount: f64 },
    /// 相邻子阶段间隔 `amount` 毫秒
    Gap { amount: f64 },
    /// 首尾相接（等同顺序放置）
    Chain,
}

/// 顶层放置提示
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Placement {
    /// 顺序
    #[default]
    Sequential,
    /// 并行
    Parallel,
    /// 固定间隔错开
    Stagger { delay: f64 },
    /// 层叠：每个阶段提前 `overlap` 毫秒开始
    Cascade { overlap: f64 },
}

/// 减弱动效时的替代参数
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReducedMotionAlternative {
    /// 替代时长
    #[serde(default)]
    pub duration: f64,
    /// 替代缓动
    #[serde(default)]
    pub easing: Option<EasingDescriptor>,
}

/// 阶段类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StageKind {
    /// 对一个目标播放动画
    Style {
        target: TargetRef,
        animation: AnimationRef,
    },
    /// 对多个目标错开播放
    Stagger {
        targets: Vec<StaggerTarget>,
        #[serde(default)]
        config: StaggerConfig,
        #[serde(default)]
        animation: Option<AnimationRef>,
    },
    /// 调用注册的回调
    Callback { name: String },
    /// 派发事件
    Event {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// 嵌套组
    Group {
        #[serde(default)]
        relationship: GroupRelationship,
        children: Vec<Stage>,
    },
}

/// 阶段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// 阶段 ID
    pub id: String,
    /// 类型
    #[serde(flatten)]
    pub kind: StageKind,
    /// 单次迭代时长；为 0 时取动画自身时长
    #[serde(default)]
    pub duration: f64,
    /// 缓动
    #[serde(default)]
    pub easing: Option<EasingDescriptor>,
    /// 显式起点
    #[serde(default)]
    pub start_time: Option<f64>,
    /// 方向
    #[serde(default)]
    pub direction: Direction,
    /// 额外重复次数
    #[serde(default)]
    pub repeat: u32,
    /// 重复间隔
    #[serde(default)]
    pub repeat_delay: f64,
    /// 往返（奇数次迭代反向）
    #[serde(default)]
    pub yoyo: bool,
    /// 依赖的兄弟阶段
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 减弱动效替代
    #[serde(default)]
    pub reduced_motion: Option<ReducedMotionAlternative>,
    /// 类别（供动效偏好策略判断）
    #[serde(default)]
    pub category: Option<String>,
}

impl Stage {
    fn new_internal(id: impl Into<String>, kind: StageKind) -> Self {
        Self {
            id: id.into(),
            kind,
            duration: 0.0,
            easing: None,
            start_time: None,
            direction: Direction::Normal,
            repeat: 0,
            repeat_delay: 0.0,
            yoyo: false,
            dependencies: Vec::new(),
            reduced_motion: None,
            category: None,
        }
    }

    /// 样式阶段
    pub fn style(
        id: impl Into<String>,
        target: impl Into<TargetRef>,
        animation: impl Into<AnimationRef>,
    ) -> Self {
        Self::new_internal(
            id,
            StageKind::Style {
                target: target.into(),
                animation: animation.into(),
            },
        )
    }

    /// 错开阶段
    pub fn stagger(
        id: impl Into<String>,
        targets: Vec<StaggerTarget>,
        config: StaggerConfig,
        animation: Option<AnimationRef>,
    ) -> Self {
        Self::new_internal(
            id,
            StageKind::Stagger {
                targets,
                config,
                animation,
            },
        )
    }

    /// 回调阶段
    pub fn callback(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new_internal(id, StageKind::Callback { name: name.into() })
    }

    /// 事件阶段
    pub fn event(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new_internal(
            id,
            StageKind::Event {
                name: name.into(),
                payload: serde_json::Value::Null,
            },
        )
    }

    /// 组阶段
    pub fn group(id: impl Into<String>, relationship: GroupRelationship, children: Vec<Stage>) -> Self {
        Self::new_internal(
            id,
            StageKind::Group {
                relationship,
                children,
            },
        )
    }

    /// 设置时长
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    /// 设置缓动
    pub fn with_easing(mut self, easing: impl Into<EasingDescriptor>) -> Self {
        self.easing = Some(easing.into());
        self
    }

    /// 设置显式起点
    pub fn at(mut self, start_time: f64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// 设置方向
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// 设置重复
    pub fn with_repeat(mut self, repeat: u32, repeat_delay: f64) -> Self {
        self.repeat = repeat;
        self.repeat_delay = repeat_delay;
        self
    }

    /// 设置往返
    pub fn with_yoyo(mut self, yoyo: bool) -> Self {
        self.yoyo = yoyo;
        self
    }

    /// 添加依赖
    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// 设置减弱动效替代
    pub fn with_reduced_motion(mut self, alternative: ReducedMotionAlternative) -> Self {
        self.reduced_motion = Some(alternative);
        self
    }

    /// 设置类别
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    fn span_of(&self, iteration: f64) -> f64 {
        iteration * f64::from(self.repeat + 1) + self.repeat_delay.max(0.0) * f64::from(self.repeat)
    }
}

impl DependencyNode for Stage {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

/// 条目进入/退出时要执行的动作
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EntryAction {
    /// 纯计时（组、错开父条目）
    #[default]
    None,
    /// 对目标播放动画
    Style {
        target: TargetRef,
        animation: AnimationDescriptor,
    },
    /// 调用回调
    Callback { name: String },
    /// 派发事件
    Event {
        name: String,
        payload: serde_json::Value,
    },
}

/// 时间轴条目
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    /// 阶段 ID（错开子条目为 `"{id}[{i}]"`）
    pub id: String,
    /// 所属组或错开阶段
    pub parent: Option<String>,
    /// 绝对起点
    pub start: f64,
    /// 绝对终点
    pub end: f64,
    /// 单次迭代时长
    pub iteration: f64,
    /// 缓动
    pub easing: Easing,
    /// 方向
    pub direction: Direction,
    /// 额外重复次数
    pub repeat: u32,
    /// 重复间隔
    pub repeat_delay: f64,
    /// 往返
    pub yoyo: bool,
    /// 动作
    pub action: EntryAction,
}

impl TimelineEntry {
    /// 创建单次迭代、线性缓动的条目
    pub fn new(id: impl Into<String>, start: f64, duration: f64) -> Self {
        let duration = duration.max(0.0);
        Self {
            id: id.into(),
            parent: None,
            start,
            end: start + duration,
            iteration: duration,
            easing: Easing::LINEAR,
            direction: Direction::Normal,
            repeat: 0,
            repeat_delay: 0.0,
            yoyo: false,
            action: EntryAction::None,
        }
    }

    /// 单个动画的条目：起点为 `start + delay`，缓动取动画自身的缓动
    pub fn for_animation(
        id: impl Into<String>,
        target: TargetRef,
        animation: AnimationDescriptor,
        start: f64,
    ) -> Self {
        Self::new(id, start + animation.delay.max(0.0), animation.duration)
            .with_easing(resolve_or_default(animation.easing.as_ref()))
            .with_action(EntryAction::Style { target, animation })
    }

    /// 设置缓动
    pub fn with_easing(mut self, easing: Easing) -> Self {
        self.easing = easing;
        self
    }

    /// 设置动作
    pub fn with_action(mut self, action: EntryAction) -> Self {
        self.action = action;
        self
    }

    /// 设置父条目
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// 占用时长
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// 时间轴时间 `t` 处的缓动进度
    ///
    /// 处理重复、重复间隔、方向与往返；`t` 会被限制在条目区间内。
    pub fn progress_at(&self, t: f64) -> f64 {
        let span = self.duration();
        let rel = (t - self.start).clamp(0.0, span.max(0.0));

        let (iteration, raw) = if self.iteration <= 0.0 {
            (self.repeat, 1.0)
        } else {
            let period = self.iteration + self.repeat_delay.max(0.0);
            let k = ((rel / period).floor() as u32).min(self.repeat);
            let within = rel - f64::from(k) * period;
            (k, (within / self.iteration).clamp(0.0, 1.0))
        };

        let odd = iteration % 2 == 1;
        let flip = match self.direction {
            Direction::Normal => false,
            Direction::Reverse => true,
            Direction::Alternate => odd,
            Direction::AlternateReverse => !odd,
        } ^ (self.yoyo && odd);

        self.easing.apply(if flip { 1.0 - raw } else { raw })
    }

    fn shifted(mut self, offset: f64) -> Self {
        self.start += offset;
        self.end += offset;
        self
    }
}

/// 编译后的时间轴（不可变）
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledTimeline {
    entries: Vec<TimelineEntry>,
    duration: f64,
}

impl CompiledTimeline {
    /// 由条目构造；`duration` 为 `None` 时取最大结束时间
    pub fn from_entries(entries: Vec<TimelineEntry>, duration: Option<f64>) -> Self {
        let duration = duration.unwrap_or_else(|| entries.iter().map(|e| e.end).fold(0.0, f64::max));
        Self { entries, duration }
    }

    /// 全部条目（放置顺序）
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// 按 ID 查找条目
    pub fn entry(&self, id: &str) -> Option<&TimelineEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// 总时长
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// 是否没有任何条目
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 把指定条目收缩为起点处的瞬时条目
    ///
    /// 总时长原本由条目结束时间决定时，按收缩后的条目重新计算；显式时长保持不变。
    pub fn complete_immediately(mut self, ids: &[String]) -> Self {
        if ids.is_empty() {
            return self;
        }
        let derived = self.entries.iter().map(|e| e.end).fold(0.0, f64::max) == self.duration;
        for entry in self.entries.iter_mut().filter(|e| ids.contains(&e.id)) {
            entry.end = entry.start;
            entry.iteration = 0.0;
            entry.repeat = 0;
            entry.repeat_delay = 0.0;
        }
        if derived {
            self.duration = self.entries.iter().map(|e| e.end).fold(0.0, f64::max);
        }
        self
    }
}

impl std::fmt::Display for CompiledTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "duration {}", format_number(self.duration))?;
        for entry in &self.entries {
            let indent = if entry.parent.is_some() { "  " } else { "" };
            writeln!(
                f,
                "{indent}{} {}..{}",
                entry.id,
                format_number(entry.start),
                format_number(entry.end)
            )?;
        }
        Ok(())
    }
}

/// 单个阶段编译结果（相对阶段起点 0）
struct Built {
    entries: Vec<TimelineEntry>,
    span: f64,
}

enum Layout {
    Top(Placement),
    Group {
        relationship: GroupRelationship,
        group_end: f64,
    },
}

/// 时间轴编译器
pub struct TimelineCompiler<'a> {
    library: Option<&'a AnimationLibrary>,
    preference: &'a dyn MotionPreference,
    placement: Placement,
    duration_override: Option<f64>,
    default_easing: Option<EasingDescriptor>,
    reduced_duration: f64,
}

impl std::fmt::Debug for TimelineCompiler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineCompiler")
            .field("placement", &self.placement)
            .field("duration_override", &self.duration_override)
            .field("default_easing", &self.default_easing)
            .finish()
    }
}

impl Default for TimelineCompiler<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> TimelineCompiler<'a> {
    /// 创建编译器（顺序放置、无动效偏好）
    pub fn new() -> Self {
        Self {
            library: None,
            preference: &NoPreference,
            placement: Placement::Sequential,
            duration_override: None,
            default_easing: None,
            reduced_duration: 0.0,
        }
    }

    /// 设置动画库
    pub fn with_library(mut self, library: &'a AnimationLibrary) -> Self {
        self.library = Some(library);
        self
    }

    /// 设置动效偏好
    pub fn with_preference(mut self, preference: &'a dyn MotionPreference) -> Self {
        self.preference = preference;
        self
    }

    /// 设置顶层放置提示
    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// 覆盖总时长
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration_override = Some(duration);
        self
    }

    /// 设置未指定缓动时使用的缓动
    pub fn with_default_easing(mut self, easing: EasingDescriptor) -> Self {
        self.default_easing = Some(easing);
        self
    }

    /// 设置无替代参数时的减弱动效时长
    pub fn with_reduced_duration(mut self, duration: f64) -> Self {
        self.reduced_duration = duration.max(0.0);
        self
    }

    /// 编译
    ///
    /// # 错误
    ///
    /// - 依赖图错误（重复 ID、未知依赖、循环）
    /// - 引用了未注册的动画
    pub fn compile(&self, stages: &[Stage]) -> Result<CompiledTimeline, TimelineError> {
        let mut entries = Vec::new();
        self.place(stages, Layout::Top(self.placement), None, &mut entries)?;
        let timeline = CompiledTimeline::from_entries(entries, self.duration_override);
        debug!(
            entries = timeline.entries.len(),
            duration = timeline.duration,
            "时间轴编译完成"
        );
        Ok(timeline)
    }

    /// 放置一层兄弟阶段，返回相对 0 的条目与最大结束时间
    fn place(
        &self,
        stages: &[Stage],
        layout: Layout,
        parent: Option<&str>,
        out: &mut Vec<TimelineEntry>,
    ) -> Result<f64, TimelineError> {
        let plan = graph::resolve(stages)?;
        let by_id: HashMap<&str, &Stage> = stages.iter().map(|s| (s.id.as_str(), s)).collect();

        let mut ends: HashMap<&str, f64> = HashMap::with_capacity(stages.len());
        let mut prev_end = 0.0;
        let mut level_end: f64 = 0.0;

        for (index, id) in plan.iter().enumerate() {
            let Some(stage) = by_id.get(id).copied() else {
                continue;
            };
            let built = self.build(stage)?;

            let deps_end = stage
                .dependencies
                .iter()
                .filter_map(|d| ends.get(d.as_str()))
                .copied()
                .fold(0.0, f64::max);

            let computed = match &layout {
                Layout::Top(Placement::Sequential) => prev_end,
                Layout::Top(Placement::Parallel) => 0.0,
                Layout::Top(Placement::Stagger { delay }) => index as f64 * delay,
                Layout::Top(Placement::Cascade { overlap }) if index > 0 => (prev_end - overlap).max(0.0),
                Layout::Top(Placement::Cascade { .. }) => 0.0,
                Layout::Group { relationship, group_end } => match relationship {
                    GroupRelationship::StartTogether => 0.0,
                    GroupRelationship::EndTogether => (group_end - built.span).max(0.0),
                    GroupRelationship::Overlap { amount } if index > 0 => (prev_end - amount).max(0.0),
                    GroupRelationship::Gap { amount } if index > 0 => prev_end + amount,
                    GroupRelationship::Overlap { .. } | GroupRelationship::Gap { .. } => 0.0,
                    GroupRelationship::Chain => prev_end,
                },
            };
            let start = stage.start_time.unwrap_or_else(|| computed.max(deps_end));
            let end = start + built.span;

            for entry in built.entries {
                let mut entry = entry.shifted(start);
                if entry.parent.is_none()
                    && let Some(parent) = parent
                {
                    entry.parent = Some(parent.to_string());
                }
                out.push(entry);
            }

            ends.insert(stage.id.as_str(), end);
            prev_end = end;
            level_end = level_end.max(end);
        }

        Ok(level_end)
    }

    /// 编译单个阶段（相对起点 0）
    fn build(&self, stage: &Stage) -> Result<Built, TimelineError> {
        match &stage.kind {
            StageKind::Style { target, animation } => {
                let descriptor = self.resolve_animation(stage, animation)?;
                let base = if stage.duration > 0.0 {
                    stage.duration
                } else {
                    descriptor.duration.max(0.0)
                };
                let lead = descriptor.delay.max(0.0);
                let (iteration, easing) = self.effective(stage, base, descriptor.easing.as_ref());
                let entry = self
                    .timed_entry(stage, lead, iteration, easing)
                    .with_action(EntryAction::Style {
                        target: target.clone(),
                        animation: descriptor,
                    });
                let span = entry.end;
                Ok(Built {
                    entries: vec![entry],
                    span,
                })
            }
            StageKind::Callback { name } => {
                let (iteration, easing) = self.effective(stage, stage.duration.max(0.0), None);
                let entry = self
                    .timed_entry(stage, 0.0, iteration, easing)
                    .with_action(EntryAction::Callback { name: name.clone() });
                let span = entry.end;
                Ok(Built {
                    entries: vec![entry],
                    span,
                })
            }
            StageKind::Event { name, payload } => {
                let (iteration, easing) = self.effective(stage, stage.duration.max(0.0), None);
                let entry = self
                    .timed_entry(stage, 0.0, iteration, easing)
                    .with_action(EntryAction::Event {
                        name: name.clone(),
                        payload: payload.clone(),
                    });
                let span = entry.end;
                Ok(Built {
                    entries: vec![entry],
                    span,
                })
            }
            StageKind::Stagger {
                targets,
                config,
                animation,
            } => self.build_stagger(stage, targets, config, animation.as_ref()),
            StageKind::Group {
                relationship,
                children,
            } => {
                // 先按组起点 0 试放一次，得到子阶段跨度，再计算 end-together 的组结束时间
                let group_end = match relationship {
                    GroupRelationship::EndTogether => {
                        let mut spans: f64 = 0.0;
                        for child in children {
                            spans = spans.max(self.build(child)?.span);
                        }
                        if stage.duration > 0.0 { stage.duration } else { spans }
                    }
                    _ => stage.duration.max(0.0),
                };
                let mut entries = Vec::new();
                let extent = self.place(
                    children,
                    Layout::Group {
                        relationship: *relationship,
                        group_end,
                    },
                    Some(&stage.id),
                    &mut entries,
                )?;
                let span = extent.max(stage.duration.max(0.0));
                let mut group = TimelineEntry::new(stage.id.clone(), 0.0, span)
                    .with_easing(resolve_or_default(stage.easing.as_ref()));
                group.direction = stage.direction;
                entries.insert(0, group);
                Ok(Built { entries, span })
            }
        }
    }

    fn build_stagger(
        &self,
        stage: &Stage,
        targets: &[StaggerTarget],
        config: &StaggerConfig,
        animation: Option<&AnimationRef>,
    ) -> Result<Built, TimelineError> {
        let descriptor = match animation {
            Some(reference) => Some(self.resolve_animation(stage, reference)?),
            None => None,
        };
        let base = if stage.duration > 0.0 {
            stage.duration
        } else {
            descriptor.as_ref().map_or(0.0, |d| d.duration.max(0.0))
        };
        let animation_easing = descriptor.as_ref().and_then(|d| d.easing.as_ref());

        let mut config = config.clone();
        let (base, easing) = match self.reduction(stage, base) {
            Some((duration, alt_easing)) => {
                // 减弱动效时不再错开
                config.delay = 0.0;
                let easing = alt_easing.or_else(|| stage.easing.clone());
                (duration, self.easing_for(easing.as_ref(), animation_easing))
            }
            None => (base, self.easing_for(stage.easing.as_ref(), animation_easing)),
        };

        let plan = distribute(targets, base, &config);
        let mut entries = Vec::with_capacity(plan.slots.len() + 1);
        entries.push(TimelineEntry::new(stage.id.clone(), 0.0, plan.total));

        for (i, slot) in plan.slots.iter().enumerate() {
            let action = match &descriptor {
                Some(descriptor) => EntryAction::Style {
                    target: TargetRef::new(slot.id.clone()),
                    animation: descriptor.clone(),
                },
                None => EntryAction::None,
            };
            let mut child = TimelineEntry::new(format!("{}[{i}]", stage.id), slot.delay, slot.duration)
                .with_easing(easing.clone())
                .with_action(action)
                .with_parent(stage.id.clone());
            child.direction = stage.direction;
            entries.push(child);
        }

        Ok(Built {
            entries,
            span: plan.total,
        })
    }

    fn resolve_animation(
        &self,
        stage: &Stage,
        reference: &AnimationRef,
    ) -> Result<AnimationDescriptor, TimelineError> {
        match (reference, self.library) {
            (AnimationRef::Inline(descriptor), _) => Ok(descriptor.clone()),
            (AnimationRef::Named(name), Some(library)) => {
                library
                    .resolve(reference)
                    .map_err(|_| TimelineError::UnknownAnimation {
                        stage: stage.id.clone(),
                        name: name.clone(),
                    })
            }
            (AnimationRef::Named(name), None) => Err(TimelineError::UnknownAnimation {
                stage: stage.id.clone(),
                name: name.clone(),
            }),
        }
    }

    /// 带重复参数的条目
    fn timed_entry(&self, stage: &Stage, lead: f64, iteration: f64, easing: Easing) -> TimelineEntry {
        let span = stage.span_of(iteration);
        TimelineEntry {
            id: stage.id.clone(),
            parent: None,
            start: lead,
            end: lead + span,
            iteration,
            easing,
            direction: stage.direction,
            repeat: stage.repeat,
            repeat_delay: stage.repeat_delay.max(0.0),
            yoyo: stage.yoyo,
            action: EntryAction::None,
        }
    }

    /// 应用减弱动效后的 (时长, 缓动)
    fn effective(
        &self,
        stage: &Stage,
        duration: f64,
        animation_easing: Option<&EasingDescriptor>,
    ) -> (f64, Easing) {
        match self.reduction(stage, duration) {
            Some((duration, alt_easing)) => {
                let easing = alt_easing.or_else(|| stage.easing.clone());
                (duration, self.easing_for(easing.as_ref(), animation_easing))
            }
            None => (duration, self.easing_for(stage.easing.as_ref(), animation_easing)),
        }
    }

    fn reduction(&self, stage: &Stage, duration: f64) -> Option<(f64, Option<EasingDescriptor>)> {
        let reduce = self.preference.prefers_reduced_motion()
            || !self.preference.is_allowed(stage.category.as_deref(), duration);
        if !reduce {
            return None;
        }
        debug!(stage = %stage.id, "应用减弱动效替代");
        Some(match &stage.reduced_motion {
            Some(alt) => (alt.duration.max(0.0), alt.easing.clone()),
            None => (self.reduced_duration, None),
        })
    }

    fn easing_for(
        &self,
        stage_easing: Option<&EasingDescriptor>,
        animation_easing: Option<&EasingDescriptor>,
    ) -> Easing {
        resolve_or_default(
            stage_easing
                .or(animation_easing)
                .or(self.default_easing.as_ref()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::easing::EasingFunction;
    use crate::error::GraphError;
    use crate::surface::StaticPreference;

    fn fade(duration: f64) -> AnimationDescriptor {
        AnimationDescriptor::new(duration).style("opacity", 0.0, 1.0)
    }

    fn span(timeline: &CompiledTimeline, id: &str) -> (f64, f64) {
        let entry = timeline.entry(id).unwrap();
        (entry.start, entry.end)
    }

    #[test]
    fn test_complete_immediately_collapses_entries() {
        let stages = vec![
            Stage::style("a", "#x", fade(100.0)),
            Stage::style("b", "#x", fade(200.0)),
        ];
        let timeline = TimelineCompiler::new().compile(&stages).unwrap();
        let timeline = timeline.complete_immediately(&["b".to_string()]);
        assert_eq!(span(&timeline, "b"), (100.0, 100.0));
        assert_eq!(timeline.duration(), 100.0);

        let explicit = TimelineCompiler::new()
            .with_duration(500.0)
            .compile(&stages)
            .unwrap()
            .complete_immediately(&["b".to_string()]);
        assert_eq!(explicit.duration(), 500.0);
    }

    #[test]
    fn test_sequential_placement() {
        let stages = vec![
            Stage::style("a", "#x", fade(100.0)),
            Stage::style("b", "#x", fade(200.0)),
            Stage::callback("c", "done"),
        ];
        let timeline = TimelineCompiler::new().compile(&stages).unwrap();
        insta::assert_snapshot!(timeline.to_string(), @r"
        duration 300
        a 0..100
        b 100..300
        c 300..300
        ");
    }

    #[test]
    fn test_empty_is_zero() {
        let timeline = TimelineCompiler::new().compile(&[]).unwrap();
        assert_eq!(timeline.duration(), 0.0);
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_parallel_stagger_cascade() {
        let stages = vec![
            Stage::style("a", "#x", fade(100.0)),
            Stage::style("b", "#x", fade(100.0)),
            Stage::style("c", "#x", fade(100.0)),
        ];

        let parallel = TimelineCompiler::new()
            .with_placement(Placement::Parallel)
            .compile(&stages)
            .unwrap();
        assert_eq!(parallel.duration(), 100.0);

        let staggered = TimelineCompiler::new()
            .with_placement(Placement::Stagger { delay: 30.0 })
            .compile(&stages)
            .unwrap();
        assert_eq!(span(&staggered, "c"), (60.0, 160.0));

        let cascade = TimelineCompiler::new()
            .with_placement(Placement::Cascade { overlap: 40.0 })
            .compile(&stages)
            .unwrap();
        assert_eq!(span(&cascade, "b"), (60.0, 160.0));
        assert_eq!(span(&cascade, "c"), (120.0, 220.0));
    }

    #[test]
    fn test_dependencies_push_start() {
        let stages = vec![
            Stage::style("late", "#x", fade(50.0)).after("slow"),
            Stage::style("slow", "#x", fade(300.0)),
            Stage::style("quick", "#x", fade(10.0)),
        ];
        let timeline = TimelineCompiler::new()
            .with_placement(Placement::Parallel)
            .compile(&stages)
            .unwrap();
        assert_eq!(span(&timeline, "late"), (300.0, 350.0));
        assert_eq!(span(&timeline, "quick"), (0.0, 10.0));
    }

    #[test]
    fn test_explicit_start_overrides() {
        let stages = vec![
            Stage::style("a", "#x", fade(100.0)),
            Stage::style("b", "#x", fade(100.0)).at(10.0),
        ];
        let timeline = TimelineCompiler::new().compile(&stages).unwrap();
        assert_eq!(span(&timeline, "b"), (10.0, 110.0));
        assert_eq!(timeline.duration(), 110.0);

        let overridden = TimelineCompiler::new()
            .with_duration(500.0)
            .compile(&stages)
            .unwrap();
        assert_eq!(overridden.duration(), 500.0);
    }

    #[test]
    fn test_repeat_span() {
        let stages = vec![Stage::style("a", "#x", fade(100.0)).with_repeat(2, 50.0)];
        let timeline = TimelineCompiler::new().compile(&stages).unwrap();
        assert_eq!(timeline.duration(), 400.0);
    }

    #[test]
    fn test_group_relationships() {
        let children = || {
            vec![
                Stage::style("g.a", "#x", fade(100.0)),
                Stage::style("g.b", "#x", fade(300.0)),
            ]
        };
        let compile = |relationship| {
            TimelineCompiler::new()
                .compile(&[
                    Stage::style("intro", "#x", fade(50.0)),
                    Stage::group("g", relationship, children()),
                ])
                .unwrap()
        };

        let together = compile(GroupRelationship::StartTogether);
        assert_eq!(span(&together, "g.a"), (50.0, 150.0));
        assert_eq!(span(&together, "g"), (50.0, 350.0));
        assert_eq!(together.entry("g.a").unwrap().parent.as_deref(), Some("g"));

        let end = compile(GroupRelationship::EndTogether);
        assert_eq!(span(&end, "g.a"), (250.0, 350.0));
        assert_eq!(span(&end, "g.b"), (50.0, 350.0));

        let overlap = compile(GroupRelationship::Overlap { amount: 20.0 });
        assert_eq!(span(&overlap, "g.b"), (130.0, 430.0));

        let gap = compile(GroupRelationship::Gap { amount: 20.0 });
        assert_eq!(span(&gap, "g.b"), (170.0, 470.0));

        let chain = compile(GroupRelationship::Chain);
        assert_eq!(span(&chain, "g.b"), (150.0, 450.0));
    }

    #[test]
    fn test_group_child_start_is_relative() {
        let stages = vec![
            Stage::style("intro", "#x", fade(100.0)),
            Stage::group(
                "g",
                GroupRelationship::StartTogether,
                vec![Stage::style("g.a", "#x", fade(10.0)).at(25.0)],
            ),
        ];
        let timeline = TimelineCompiler::new().compile(&stages).unwrap();
        assert_eq!(span(&timeline, "g.a"), (125.0, 135.0));
    }

    #[test]
    fn test_stagger_children() {
        let targets = (0..3).map(|i| StaggerTarget::new(format!("item-{i}"))).collect();
        let stages = vec![Stage::stagger(
            "list",
            targets,
            StaggerConfig::linear(50.0),
            Some(fade(100.0).into()),
        )];
        let timeline = TimelineCompiler::new().compile(&stages).unwrap();
        insta::assert_snapshot!(timeline.to_string(), @r"
        duration 200
        list 0..200
          list[0] 0..100
          list[1] 50..150
          list[2] 100..200
        ");
        match &timeline.entry("list[2]").unwrap().action {
            EntryAction::Style { target, .. } => assert_eq!(target.as_str(), "item-2"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_named_animation_resolution() {
        let library = AnimationLibrary::new().with("fade", fade(120.0).with_delay(30.0));
        let stages = vec![Stage::style("a", "#x", "fade")];
        let timeline = TimelineCompiler::new()
            .with_library(&library)
            .compile(&stages)
            .unwrap();
        assert_eq!(span(&timeline, "a"), (30.0, 150.0));

        let err = TimelineCompiler::new().compile(&stages).unwrap_err();
        assert_eq!(
            err,
            TimelineError::UnknownAnimation {
                stage: "a".to_string(),
                name: "fade".to_string()
            }
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let stages = vec![
            Stage::callback("a", "x").after("b"),
            Stage::callback("b", "y").after("a"),
        ];
        let err = TimelineCompiler::new().compile(&stages).unwrap_err();
        assert!(matches!(
            err,
            TimelineError::Graph(GraphError::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_reduced_motion() {
        let stages = vec![
            Stage::style("a", "#x", fade(300.0)).with_reduced_motion(ReducedMotionAlternative {
                duration: 50.0,
                easing: Some(EasingFunction::Linear.into()),
            }),
            Stage::style("b", "#x", fade(300.0)),
        ];
        let pref = StaticPreference::reduced();
        let timeline = TimelineCompiler::new()
            .with_preference(&pref)
            .compile(&stages)
            .unwrap();
        assert_eq!(span(&timeline, "a"), (0.0, 50.0));
        assert_eq!(timeline.entry("a").unwrap().easing, Easing::LINEAR);
        assert_eq!(span(&timeline, "b"), (50.0, 50.0));
    }

    #[test]
    fn test_policy_disallows_category() {
        let stages = vec![Stage::style("a", "#x", fade(300.0)).with_category("decorative")];
        let pref = StaticPreference::default().block("decorative");
        let timeline = TimelineCompiler::new()
            .with_preference(&pref)
            .compile(&stages)
            .unwrap();
        assert_eq!(timeline.duration(), 0.0);
    }

    #[test]
    fn test_progress_with_direction_and_repeat() {
        let entry = TimelineEntry::new("e", 100.0, 100.0);
        assert_eq!(entry.progress_at(50.0), 0.0);
        assert_eq!(entry.progress_at(150.0), 0.5);
        assert_eq!(entry.progress_at(400.0), 1.0);

        let mut reverse = TimelineEntry::new("r", 0.0, 100.0);
        reverse.direction = Direction::Reverse;
        assert_eq!(reverse.progress_at(25.0), 0.75);

        let mut alternate = TimelineEntry::new("alt", 0.0, 100.0);
        alternate.direction = Direction::Alternate;
        alternate.repeat = 1;
        alternate.end = 200.0;
        assert_eq!(alternate.progress_at(25.0), 0.25);
        assert_eq!(alternate.progress_at(125.0), 0.75);
        assert_eq!(alternate.progress_at(200.0), 0.0);
    }

    #[test]
    fn test_stage_deserializes() {
        let json = r##"[
            {"id": "a", "type": "style", "target": "#card", "animation": "fade", "duration": 200},
            {"id": "b", "type": "event", "name": "shown", "dependencies": ["a"]},
            {"id": "g", "type": "group", "relationship": {"kind": "gap", "amount": 10},
             "children": [{"id": "c", "type": "callback", "name": "tick", "duration": 5}]}
        ]"##;
        let stages: Vec<Stage> = serde_json::from_str(json).unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].duration, 200.0);
        assert!(matches!(stages[2].kind, StageKind::Group { .. }));

        let library = AnimationLibrary::new().with("fade", fade(0.0));
        let timeline = TimelineCompiler::new()
            .with_library(&library)
            .compile(&stages)
            .unwrap();
        assert_eq!(span(&timeline, "c"), (200.0, 205.0));
    }
}
