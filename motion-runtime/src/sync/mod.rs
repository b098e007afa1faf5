//! # Sync 模块
//!
//! 同步组：把多个独立计时的动画组合为一个整体。
//!
//! ## 生命周期
//!
//! ```text
//! Initializing --initialize()--> Ready --play()--> Playing <--> Paused
//!                                                  Playing --> Completed
//!                       Ready / Playing / Paused --cancel()--> Canceled
//! ```
//!
//! 结构（动画、策略、时长、组级同步点）只能在 `Initializing` 阶段修改。
//!
//! ## 单一时钟
//!
//! `initialize()` 按策略算出每个动画的起点与时长，`play()` 把它们编译为一条
//! 带显式起点的时间轴，由唯一的 [`PlaybackClock`](crate::clock::PlaybackClock)
//! 驱动。同步点注册为时钟续体，暂停/恢复不会让各动画之间产生漂移。

mod strategy;

pub use strategy::{
    CustomTiming, GroupTiming, ItemTiming, POINT_END, POINT_MIDDLE, POINT_START, SyncStrategy,
    SyncedAnimation, compute,
};

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::clock::{ClockEvent, CompletionToken};
use crate::error::GroupError;
use crate::event::{EventBus, HandlerResult, MotionEvent, invoke_guarded};
use crate::interpolation::Interpolator;
use crate::machine::StateMachine;
use crate::player::AnimationPlayer;
use crate::surface::{SurfaceRegistry, TargetResolver};
use crate::timeline::{CompiledTimeline, TimelineEntry};

/// 到达同步点时派发到事件总线的事件名
pub const SYNC_POINT_EVENT: &str = "sync-point";

/// 同步组状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// 可修改结构
    Initializing,
    /// 已计算，等待播放
    Ready,
    /// 播放中
    Playing,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 已取消
    Canceled,
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GroupState::Initializing => "initializing",
            GroupState::Ready => "ready",
            GroupState::Playing => "playing",
            GroupState::Paused => "paused",
            GroupState::Completed => "completed",
            GroupState::Canceled => "canceled",
        };
        write!(f, "{name}")
    }
}

/// 单个动画的播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// 尚未开始
    Pending,
    /// 播放中
    Playing,
    /// 已完成（包括目标未解析的动画）
    Completed,
}

/// 到达同步点
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPointEvent {
    /// 组 ID
    pub group: String,
    /// 同步点名称
    pub point: String,
    /// 组时间
    pub time: f64,
}

/// 同步组事件
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// 动画开始
    ItemStarted { id: String },
    /// 动画完成
    ItemCompleted { id: String },
    /// 到达同步点
    SyncPoint(SyncPointEvent),
    /// 整组完成
    Completed,
}

/// 同步点监听器
pub type SyncListener = Rc<dyn Fn(&SyncPointEvent) -> HandlerResult>;

struct MachineBinding {
    machine: Rc<RefCell<StateMachine>>,
    /// 同步点 -> 目标状态
    mapping: BTreeMap<String, String>,
}

/// 同步组
pub struct SyncGroup {
    id: String,
    strategy: SyncStrategy,
    items: Vec<SyncedAnimation>,
    duration_override: Option<f64>,
    group_points: BTreeMap<String, f64>,
    state: GroupState,
    timing: GroupTiming,
    surfaces: SurfaceRegistry,
    unresolved: Vec<String>,
    item_states: HashMap<String, ItemState>,
    player: Option<AnimationPlayer>,
    tokens: HashMap<CompletionToken, String>,
    listeners: Vec<(Option<String>, SyncListener)>,
    binding: Option<MachineBinding>,
    interpolator: Rc<Interpolator>,
    events: Option<EventBus>,
}

impl std::fmt::Debug for SyncGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncGroup")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("items", &self.items.len())
            .field("state", &self.state)
            .field("duration", &self.timing.duration)
            .finish()
    }
}

impl SyncGroup {
    /// 创建同步组
    pub fn new(id: impl Into<String>, strategy: SyncStrategy) -> Self {
        Self {
            id: id.into(),
            strategy,
            items: Vec::new(),
            duration_override: None,
            group_points: BTreeMap::new(),
            state: GroupState::Initializing,
            timing: GroupTiming::default(),
            surfaces: SurfaceRegistry::new(),
            unresolved: Vec::new(),
            item_states: HashMap::new(),
            player: None,
            tokens: HashMap::new(),
            listeners: Vec::new(),
            binding: None,
            interpolator: Rc::new(Interpolator::new()),
            events: None,
        }
    }

    /// 使用共享的插值引擎
    pub fn with_interpolator(mut self, interpolator: Rc<Interpolator>) -> Self {
        self.interpolator = interpolator;
        self
    }

    /// 使用共享的事件总线
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    // ========== 结构（仅 Initializing） ==========

    /// 添加动画
    pub fn add(&mut self, item: SyncedAnimation) -> Result<(), GroupError> {
        self.ensure_initializing()?;
        if self.items.iter().any(|i| i.id == item.id) {
            return Err(GroupError::DuplicateAnimation {
                group: self.id.clone(),
                id: item.id,
            });
        }
        self.items.push(item);
        Ok(())
    }

    /// 移除动画
    pub fn remove(&mut self, id: &str) -> Result<bool, GroupError> {
        self.ensure_initializing()?;
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        Ok(self.items.len() != before)
    }

    /// 更换策略
    pub fn set_strategy(&mut self, strategy: SyncStrategy) -> Result<(), GroupError> {
        self.ensure_initializing()?;
        self.strategy = strategy;
        Ok(())
    }

    /// 显式组时长
    pub fn set_duration(&mut self, duration: f64) -> Result<(), GroupError> {
        self.ensure_initializing()?;
        self.duration_override = Some(duration.max(0.0));
        Ok(())
    }

    /// 组级同步点（相对位置）
    pub fn add_sync_point(&mut self, name: impl Into<String>, position: f64) -> Result<(), GroupError> {
        self.ensure_initializing()?;
        self.group_points.insert(name.into(), position.clamp(0.0, 1.0));
        Ok(())
    }

    fn ensure_initializing(&self) -> Result<(), GroupError> {
        if self.state == GroupState::Initializing {
            Ok(())
        } else {
            Err(GroupError::Locked {
                id: self.id.clone(),
                state: self.state.to_string(),
            })
        }
    }

    /// 初始化：锁定结构、计算计时、解析目标
    ///
    /// # 错误
    ///
    /// - 已初始化过
    /// - 没有任何动画
    pub fn initialize(&mut self, resolver: &dyn TargetResolver) -> Result<(), GroupError> {
        self.ensure_initializing()?;
        if self.items.is_empty() {
            return Err(GroupError::EmptyGroup {
                id: self.id.clone(),
            });
        }

        for item in &mut self.items {
            item.inject_standard_points();
        }
        self.timing = compute(
            &self.strategy,
            &self.items,
            self.duration_override,
            &self.group_points,
        );

        for item in &self.items {
            if !self.surfaces.resolve(&item.target).is_empty() {
                continue;
            }
            let surfaces = resolver.resolve(&item.target);
            if surfaces.is_empty() {
                warn!(group = %self.id, item = %item.id, reference = %item.target, "目标未解析，该动画视为立即完成");
                self.unresolved.push(item.id.clone());
            }
            for surface in surfaces {
                self.surfaces.register(item.target.clone(), surface);
            }
        }

        self.state = GroupState::Ready;
        info!(
            group = %self.id,
            strategy = ?self.strategy,
            items = self.items.len(),
            duration = self.timing.duration,
            "同步组已初始化"
        );
        Ok(())
    }

    // ========== 监听 ==========

    /// 监听指定同步点
    pub fn on_sync_point(
        &mut self,
        point: impl Into<String>,
        listener: impl Fn(&SyncPointEvent) -> HandlerResult + 'static,
    ) {
        self.listeners.push((Some(point.into()), Rc::new(listener)));
    }

    /// 监听全部同步点
    pub fn on_any_sync_point(&mut self, listener: impl Fn(&SyncPointEvent) -> HandlerResult + 'static) {
        self.listeners.push((None, Rc::new(listener)));
    }

    /// 绑定状态机：到达同步点时转换到映射的状态
    pub fn bind_machine(&mut self, machine: Rc<RefCell<StateMachine>>, mapping: BTreeMap<String, String>) {
        self.binding = Some(MachineBinding { machine, mapping });
    }

    // ========== 播放 ==========

    /// 播放
    ///
    /// `Ready` / `Completed` / `Canceled` 从头开始；`Paused` 等同于恢复。
    pub fn play(&mut self, now: f64) -> Result<(), GroupError> {
        match self.state {
            GroupState::Initializing => Err(GroupError::NotReady {
                id: self.id.clone(),
                state: self.state.to_string(),
            }),
            GroupState::Playing => Ok(()),
            GroupState::Paused => {
                self.resume(now);
                Ok(())
            }
            GroupState::Ready | GroupState::Completed | GroupState::Canceled => {
                self.start(now);
                Ok(())
            }
        }
    }

    fn start(&mut self, now: f64) {
        let mut entries = Vec::new();
        for (item, timing) in self.items.iter().zip(&self.timing.items) {
            let resolved = !self.unresolved.contains(&item.id);
            self.item_states.insert(
                item.id.clone(),
                if resolved { ItemState::Pending } else { ItemState::Completed },
            );
            if resolved {
                let mut animation = item.animation.clone();
                animation.duration = timing.duration;
                animation.delay = 0.0;
                entries.push(TimelineEntry::for_animation(
                    item.id.clone(),
                    item.target.clone(),
                    animation,
                    timing.start,
                ));
            }
        }

        let timeline = CompiledTimeline::from_entries(entries, Some(self.timing.duration));
        let mut player = AnimationPlayer::new(timeline, &self.surfaces, self.interpolator.clone());
        if let Some(events) = &self.events {
            player = player.with_events(events.clone());
        }

        // 按时间注册，同一次 tick 越过多个同步点时按时间先后派发
        let mut points: Vec<(&String, f64)> =
            self.timing.sync_points.iter().map(|(n, &t)| (n, t)).collect();
        points.sort_by(|a, b| a.1.total_cmp(&b.1));
        self.tokens.clear();
        for (name, time) in points {
            let token = player.clock_mut().continuation_at(time);
            self.tokens.insert(token, name.clone());
        }

        player.play(now);
        self.player = Some(player);
        self.state = GroupState::Playing;
        debug!(group = %self.id, "同步组开始播放");
    }

    /// 暂停
    pub fn pause(&mut self, now: f64) {
        if self.state == GroupState::Playing
            && let Some(player) = self.player.as_mut()
        {
            player.pause(now);
            self.state = GroupState::Paused;
        }
    }

    /// 恢复
    pub fn resume(&mut self, now: f64) {
        if self.state == GroupState::Paused
            && let Some(player) = self.player.as_mut()
        {
            player.resume(now);
            self.state = GroupState::Playing;
        }
    }

    /// 取消：停止全部计划的工作，进度回到 0
    pub fn cancel(&mut self) {
        if !matches!(
            self.state,
            GroupState::Ready | GroupState::Playing | GroupState::Paused
        ) {
            return;
        }
        if let Some(mut player) = self.player.take() {
            player.cancel();
        }
        self.tokens.clear();
        for state in self.item_states.values_mut() {
            *state = ItemState::Pending;
        }
        self.state = GroupState::Canceled;
        debug!(group = %self.id, "同步组已取消");
    }

    /// 推进，返回本次产生的事件
    pub fn tick(&mut self, now: f64) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        if self.state != GroupState::Playing {
            return out;
        }
        let Some(player) = self.player.as_mut() else {
            return out;
        };

        for event in player.tick(now) {
            match event {
                ClockEvent::StageStarted { id } => {
                    self.item_states.insert(id.clone(), ItemState::Playing);
                    out.push(SyncEvent::ItemStarted { id });
                }
                ClockEvent::StageFinished { id } => {
                    self.item_states.insert(id.clone(), ItemState::Completed);
                    out.push(SyncEvent::ItemCompleted { id });
                }
                ClockEvent::Continuation(token) => {
                    if let Some(point) = self.tokens.get(&token).cloned() {
                        let event = self.reach(point, now);
                        out.push(SyncEvent::SyncPoint(event));
                    }
                }
                ClockEvent::Finished => {
                    for state in self.item_states.values_mut() {
                        *state = ItemState::Completed;
                    }
                    self.state = GroupState::Completed;
                    info!(group = %self.id, "同步组播放完成");
                    out.push(SyncEvent::Completed);
                }
                ClockEvent::StageProgress { .. }
                | ClockEvent::CycleCompleted { .. }
                | ClockEvent::Cancelled => {}
            }
        }
        out
    }

    fn reach(&self, point: String, now: f64) -> SyncPointEvent {
        let event = SyncPointEvent {
            group: self.id.clone(),
            time: self.timing.sync_points.get(&point).copied().unwrap_or_default(),
            point,
        };
        debug!(group = %self.id, point = %event.point, time = event.time, "到达同步点");

        for (filter, listener) in &self.listeners {
            if filter.as_deref().is_none_or(|f| f == event.point) {
                invoke_guarded("sync-listener", &event.point, || listener(&event));
            }
        }

        if let Some(events) = &self.events {
            events.emit(MotionEvent::new(SYNC_POINT_EVENT).with_payload(serde_json::json!({
                "group": event.group,
                "point": event.point,
                "time": event.time,
            })));
        }

        if let Some(binding) = &self.binding
            && let Some(state) = binding.mapping.get(&event.point)
        {
            match binding.machine.try_borrow_mut() {
                Ok(mut machine) => {
                    if let Err(err) = machine.transition_to(state, now) {
                        warn!(group = %self.id, point = %event.point, error = %err, "同步点驱动状态机失败");
                    }
                }
                Err(_) => warn!(group = %self.id, point = %event.point, "状态机正被占用，跳过同步点驱动"),
            }
        }

        event
    }

    // ========== 查询 ==========

    /// 组 ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 当前状态
    pub fn state(&self) -> GroupState {
        self.state
    }

    /// 进度
    ///
    /// `Initializing` / `Ready` / `Canceled` 为 0，`Completed` 为 1，
    /// 其余为 `clamp(elapsed / duration, 0, 1)`。
    pub fn progress(&self, now: f64) -> f64 {
        match self.state {
            GroupState::Initializing | GroupState::Ready | GroupState::Canceled => 0.0,
            GroupState::Completed => 1.0,
            GroupState::Playing | GroupState::Paused => {
                let Some(player) = &self.player else {
                    return 0.0;
                };
                if self.timing.duration <= 0.0 {
                    return 0.0;
                }
                (player.clock().elapsed(now) / self.timing.duration).clamp(0.0, 1.0)
            }
        }
    }

    /// 组时长（初始化后有效）
    pub fn duration(&self) -> f64 {
        self.timing.duration
    }

    /// 动画计时（初始化后有效）
    pub fn timing(&self, id: &str) -> Option<&ItemTiming> {
        let index = self.items.iter().position(|i| i.id == id)?;
        self.timing.items.get(index)
    }

    /// 组同步点时间
    pub fn sync_points(&self) -> &BTreeMap<String, f64> {
        &self.timing.sync_points
    }

    /// 动画
    pub fn items(&self) -> &[SyncedAnimation] {
        &self.items
    }

    /// 动画播放状态
    pub fn item_state(&self, id: &str) -> Option<ItemState> {
        self.item_states.get(id).copied()
    }

    /// 目标未解析的动画
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::animation::{AnimationDescriptor, AnimationLibrary};
    use crate::easing::EasingFunction;
    use crate::interpolation::Value;
    use crate::machine::{StateDefinition, Transition};
    use crate::surface::MemorySurface;

    fn fade(duration: f64) -> AnimationDescriptor {
        AnimationDescriptor::new(duration)
            .style("opacity", 0.0, 1.0)
            .with_easing(EasingFunction::Linear)
    }

    fn registry(targets: &[&str]) -> (SurfaceRegistry, Vec<Rc<MemorySurface>>) {
        let mut registry = SurfaceRegistry::new();
        let surfaces: Vec<_> = targets
            .iter()
            .map(|t| {
                let surface = MemorySurface::new();
                registry.register(*t, surface.clone());
                surface
            })
            .collect();
        (registry, surfaces)
    }

    #[test]
    fn test_empty_group_is_fatal() {
        let mut group = SyncGroup::new("g", SyncStrategy::CommonDuration);
        let err = group.initialize(&SurfaceRegistry::new()).unwrap_err();
        assert_eq!(err, GroupError::EmptyGroup { id: "g".to_string() });
        assert_eq!(group.state(), GroupState::Initializing);
    }

    #[test]
    fn test_structure_locked_after_initialize() {
        let (registry, _) = registry(&["#a"]);
        let mut group = SyncGroup::new("g", SyncStrategy::CommonDuration);
        group.add(SyncedAnimation::new("a", "#a", fade(100.0))).unwrap();
        assert!(matches!(
            group.add(SyncedAnimation::new("a", "#a", fade(100.0))),
            Err(GroupError::DuplicateAnimation { .. })
        ));
        group.initialize(&registry).unwrap();

        assert!(matches!(
            group.add(SyncedAnimation::new("b", "#a", fade(100.0))),
            Err(GroupError::Locked { .. })
        ));
        assert!(matches!(group.set_duration(10.0), Err(GroupError::Locked { .. })));
        assert!(matches!(group.remove("a"), Err(GroupError::Locked { .. })));
        assert!(matches!(group.initialize(&registry), Err(GroupError::Locked { .. })));
    }

    #[test]
    fn test_common_duration_plays_on_one_clock() {
        let (registry, surfaces) = registry(&["#a", "#b"]);
        let mut group = SyncGroup::new("g", SyncStrategy::CommonDuration);
        group.add(SyncedAnimation::new("a", "#a", fade(100.0)).adaptive()).unwrap();
        group.add(SyncedAnimation::new("b", "#b", fade(200.0))).unwrap();
        group.initialize(&registry).unwrap();
        assert_eq!(group.duration(), 200.0);
        assert_eq!(group.timing("a").unwrap().duration, 200.0);

        assert_eq!(group.progress(0.0), 0.0);
        group.play(0.0).unwrap();
        group.tick(0.0);
        group.tick(100.0);
        assert_eq!(group.progress(100.0), 0.5);
        assert_eq!(surfaces[0].style("opacity"), Some(Value::Number(0.5)));
        assert_eq!(surfaces[1].style("opacity"), Some(Value::Number(0.5)));

        let events = group.tick(200.0);
        assert!(events.contains(&SyncEvent::Completed));
        assert_eq!(group.state(), GroupState::Completed);
        assert_eq!(group.progress(200.0), 1.0);
    }

    #[test]
    fn test_pause_resume_keeps_items_aligned() {
        let (registry, surfaces) = registry(&["#a", "#b"]);
        let mut group = SyncGroup::new("g", SyncStrategy::SimultaneousStart);
        group.add(SyncedAnimation::new("a", "#a", fade(100.0))).unwrap();
        group.add(SyncedAnimation::new("b", "#b", fade(100.0))).unwrap();
        group.initialize(&registry).unwrap();

        group.play(0.0).unwrap();
        group.tick(25.0);
        group.pause(25.0);
        assert_eq!(group.state(), GroupState::Paused);
        assert!(group.tick(500.0).is_empty());
        assert_eq!(group.progress(500.0), 0.25);

        group.resume(1000.0);
        group.tick(1050.0);
        assert_eq!(surfaces[0].style("opacity"), Some(Value::Number(0.75)));
        assert_eq!(surfaces[1].style("opacity"), Some(Value::Number(0.75)));
    }

    #[test]
    fn test_cancel_resets_progress() {
        let (registry, _) = registry(&["#a"]);
        let mut group = SyncGroup::new("g", SyncStrategy::CommonDuration);
        group.add(SyncedAnimation::new("a", "#a", fade(100.0))).unwrap();
        group.initialize(&registry).unwrap();
        group.play(0.0).unwrap();
        group.tick(50.0);

        group.cancel();
        assert_eq!(group.state(), GroupState::Canceled);
        assert_eq!(group.progress(60.0), 0.0);
        assert!(group.tick(200.0).is_empty());

        group.play(300.0).unwrap();
        assert_eq!(group.state(), GroupState::Playing);
    }

    #[test]
    fn test_sync_points_notify_listeners() {
        let (registry, _) = registry(&["#a"]);
        let mut group = SyncGroup::new("g", SyncStrategy::CommonDuration);
        group
            .add(SyncedAnimation::new("a", "#a", fade(100.0)).with_sync_point("hit", 0.3))
            .unwrap();
        group.initialize(&registry).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        group.on_any_sync_point(move |e| {
            s.borrow_mut().push(e.point.clone());
            Ok(())
        });
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        group.on_sync_point("hit", move |_| {
            h.set(h.get() + 1);
            Err("listener failure".to_string())
        });

        group.play(0.0).unwrap();
        group.tick(0.0);
        group.tick(40.0);
        group.tick(60.0);
        group.tick(100.0);
        assert_eq!(*seen.borrow(), vec!["start", "hit", "middle", "end"]);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_sync_point_drives_bound_machine() {
        let (registry, _) = registry(&["#a"]);
        let machine = StateMachine::builder("m", "idle")
            .state(StateDefinition::new("idle"))
            .state(StateDefinition::new("halfway"))
            .state(StateDefinition::new("done"))
            .transition(Transition::new("*", "reset", "idle"))
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();
        let machine = Rc::new(RefCell::new(machine));

        let mut group = SyncGroup::new("g", SyncStrategy::CommonDuration);
        group.add(SyncedAnimation::new("a", "#a", fade(100.0))).unwrap();
        group.initialize(&registry).unwrap();
        let mut mapping = BTreeMap::new();
        mapping.insert("middle".to_string(), "halfway".to_string());
        mapping.insert("end".to_string(), "done".to_string());
        group.bind_machine(machine.clone(), mapping);

        group.play(0.0).unwrap();
        group.tick(60.0);
        assert_eq!(machine.borrow().current(), "halfway");
        group.tick(100.0);
        assert_eq!(machine.borrow().current(), "done");
    }

    #[test]
    fn test_unresolved_item_completes_immediately() {
        let (registry, surfaces) = registry(&["#a"]);
        let mut group = SyncGroup::new("g", SyncStrategy::SimultaneousStart);
        group.add(SyncedAnimation::new("a", "#a", fade(100.0))).unwrap();
        group.add(SyncedAnimation::new("ghost", "#missing", fade(300.0))).unwrap();
        group.initialize(&registry).unwrap();
        assert_eq!(group.unresolved(), ["ghost".to_string()]);

        group.play(0.0).unwrap();
        assert_eq!(group.item_state("ghost"), Some(ItemState::Completed));
        group.tick(50.0);
        assert_eq!(group.item_state("a"), Some(ItemState::Playing));
        assert_eq!(surfaces[0].style("opacity"), Some(Value::Number(0.5)));

        group.tick(100.0);
        assert_eq!(group.item_state("a"), Some(ItemState::Completed));
        assert_eq!(group.duration(), 300.0);
    }

    #[test]
    fn test_play_before_initialize() {
        let mut group = SyncGroup::new("g", SyncStrategy::CommonDuration);
        assert!(matches!(group.play(0.0), Err(GroupError::NotReady { .. })));
    }
}
