//! # Orchestrator 模块
//!
//! 编排上下文：显式构造一次、按引用传递的共享注册表。
//!
//! ## 职责
//!
//! - 持有动画库、目标解析、动效偏好、事件总线、函数注册表与插值引擎
//! - 管理按名称登记的序列（命令执行器）、时间轴播放器、同步组与状态机
//! - 由宿主的 `tick(now)` 统一驱动
//!
//! 创建、停止与清除都是同步的；同名登记以后写者为准，旧实例先被停止。

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::animation::AnimationLibrary;
use crate::clock::ClockEvent;
use crate::command::Command;
use crate::config::MotionConfig;
use crate::error::{CommandError, GroupError, MachineError, TimelineError};
use crate::event::{EventBus, FunctionRegistry};
use crate::executor::{ExecutionContext, ExecutionEvent, PlanExecutor};
use crate::interpolation::Interpolator;
use crate::machine::{FileStore, KeyValueStore, MachineBuilder, StateMachine, TransitionRecord};
use crate::player::AnimationPlayer;
use crate::surface::{MotionPreference, TargetResolver};
use crate::sync::{SyncEvent, SyncGroup, SyncStrategy};
use crate::timeline::{CompiledTimeline, Placement, Stage, TimelineCompiler};

/// 单次 tick 的汇总
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// 序列事件
    pub sequences: Vec<(String, ExecutionEvent)>,
    /// 同步组事件
    pub groups: Vec<(String, SyncEvent)>,
    /// 本次完成的时间轴
    pub timelines: Vec<String>,
    /// 本次完成的状态转换
    pub transitions: Vec<(String, TransitionRecord)>,
}

impl TickReport {
    /// 是否没有任何事件
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
            && self.groups.is_empty()
            && self.timelines.is_empty()
            && self.transitions.is_empty()
    }
}

/// 编排器
///
/// # 使用示例
///
/// ```ignore
/// let mut motion = Orchestrator::new(resolver).with_config(MotionConfig::load("motion.json"));
/// motion.create_sequence("intro", commands)?;
/// motion.play_sequence("intro", now);
///
/// loop {
///     let report = motion.tick(now);
///     // 宿主根据 report 处理完成通知...
/// }
/// ```
pub struct Orchestrator {
    config: MotionConfig,
    library: AnimationLibrary,
    ctx: ExecutionContext,
    store: Option<Rc<dyn KeyValueStore>>,
    sequences: BTreeMap<String, PlanExecutor>,
    timelines: BTreeMap<String, AnimationPlayer>,
    groups: BTreeMap<String, SyncGroup>,
    machines: BTreeMap<String, Rc<RefCell<StateMachine>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("sequences", &self.sequences.keys().collect::<Vec<_>>())
            .field("timelines", &self.timelines.keys().collect::<Vec<_>>())
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .field("machines", &self.machines.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Orchestrator {
    /// 使用默认配置创建编排器
    pub fn new(resolver: Rc<dyn TargetResolver>) -> Self {
        let config = MotionConfig::default();
        let ctx = ExecutionContext::new(resolver)
            .with_interpolator(Rc::new(config.interpolator()))
            .with_reduced_duration(config.reduced_motion_duration_ms);
        Self {
            config,
            library: AnimationLibrary::new(),
            ctx,
            store: None,
            sequences: BTreeMap::new(),
            timelines: BTreeMap::new(),
            groups: BTreeMap::new(),
            machines: BTreeMap::new(),
        }
    }

    /// 应用配置
    ///
    /// 配置了持久化目录时使用文件存储。
    pub fn with_config(mut self, config: MotionConfig) -> Self {
        self.ctx = self
            .ctx
            .with_interpolator(Rc::new(config.interpolator()))
            .with_reduced_duration(config.reduced_motion_duration_ms);
        if let Some(dir) = &config.persistence_dir {
            self.store = Some(Rc::new(FileStore::new(dir)));
        }
        self.config = config;
        self
    }

    /// 设置动画库
    pub fn with_library(mut self, library: AnimationLibrary) -> Self {
        self.library = library;
        self
    }

    /// 设置动效偏好
    pub fn with_preference(mut self, preference: Rc<dyn MotionPreference>) -> Self {
        self.ctx = self.ctx.with_preference(preference);
        self
    }

    /// 设置持久化存储
    pub fn with_store(mut self, store: Rc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 使用自定义插值引擎（自定义插值器、混合函数、分解器）
    pub fn with_interpolator(mut self, interpolator: Interpolator) -> Self {
        self.ctx = self.ctx.with_interpolator(Rc::new(interpolator));
        self
    }

    // ========== 共享注册表 ==========

    /// 配置
    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// 动画库
    pub fn library(&self) -> &AnimationLibrary {
        &self.library
    }

    /// 可变动画库（修改后需要显式重建计划）
    pub fn library_mut(&mut self) -> &mut AnimationLibrary {
        &mut self.library
    }

    /// 事件总线
    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    /// 函数注册表
    pub fn functions(&self) -> &FunctionRegistry {
        &self.ctx.functions
    }

    /// 执行上下文
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    // ========== 序列 ==========

    /// 登记序列
    ///
    /// 计划构建失败时返回错误，已有的同名序列保持不变。
    pub fn create_sequence(
        &mut self,
        id: impl Into<String>,
        commands: Vec<Command>,
    ) -> Result<&mut PlanExecutor, CommandError> {
        let id = id.into();
        let executor = PlanExecutor::new(id.clone(), commands, &self.library, self.ctx.clone())?;
        if let Some(mut old) = self.sequences.remove(&id) {
            debug!(sequence = %id, "替换同名序列");
            old.stop();
        }
        Ok(self.sequences.entry(id).or_insert(executor))
    }

    /// 开始序列；序列不存在时返回 `None`
    pub fn play_sequence(&mut self, id: &str, now: f64) -> Option<Vec<ExecutionEvent>> {
        self.sequences.get_mut(id).map(|s| s.play(now))
    }

    /// 获取序列
    pub fn sequence(&self, id: &str) -> Option<&PlanExecutor> {
        self.sequences.get(id)
    }

    /// 获取可变序列
    pub fn sequence_mut(&mut self, id: &str) -> Option<&mut PlanExecutor> {
        self.sequences.get_mut(id)
    }

    /// 按当前动画库重建全部序列的计划
    ///
    /// 返回失败的序列及错误；失败的序列保留原计划。
    pub fn rebuild_plans(&mut self) -> Vec<(String, CommandError)> {
        let mut failures = Vec::new();
        for (id, sequence) in &mut self.sequences {
            if let Err(e) = sequence.rebuild_plan(&self.library) {
                warn!(sequence = %id, error = %e, "重建计划失败，保留原计划");
                failures.push((id.clone(), e));
            }
        }
        failures
    }

    // ========== 时间轴 ==========

    /// 按配置编译时间轴
    pub fn compile_timeline(&self, stages: &[Stage], placement: Placement) -> Result<CompiledTimeline, TimelineError> {
        TimelineCompiler::new()
            .with_library(&self.library)
            .with_preference(self.ctx.preference.as_ref())
            .with_placement(placement)
            .with_default_easing(self.config.default_easing.clone())
            .with_reduced_duration(self.config.reduced_motion_duration_ms)
            .compile(stages)
    }

    /// 编译并播放时间轴
    pub fn play_timeline(
        &mut self,
        id: impl Into<String>,
        stages: &[Stage],
        placement: Placement,
        now: f64,
    ) -> Result<&mut AnimationPlayer, TimelineError> {
        let id = id.into();
        let timeline = self.compile_timeline(stages, placement)?;
        let mut player = AnimationPlayer::new(timeline, self.ctx.resolver.as_ref(), self.ctx.interpolator.clone())
            .with_events(self.ctx.events.clone())
            .with_functions(self.ctx.functions.clone());
        player.play(now);
        if let Some(mut old) = self.timelines.remove(&id) {
            debug!(timeline = %id, "替换同名时间轴");
            old.cancel();
        }
        Ok(self.timelines.entry(id).or_insert(player))
    }

    /// 获取时间轴播放器
    pub fn timeline_mut(&mut self, id: &str) -> Option<&mut AnimationPlayer> {
        self.timelines.get_mut(id)
    }

    // ========== 同步组 ==========

    /// 登记同步组（结构尚未锁定）
    pub fn create_group(&mut self, id: impl Into<String>, strategy: SyncStrategy) -> &mut SyncGroup {
        let id = id.into();
        let group = SyncGroup::new(id.clone(), strategy)
            .with_interpolator(self.ctx.interpolator.clone())
            .with_events(self.ctx.events.clone());
        if let Some(mut old) = self.groups.remove(&id) {
            debug!(group = %id, "替换同名同步组");
            old.cancel();
        }
        self.groups.entry(id).or_insert(group)
    }

    /// 配置中的默认级联策略
    pub fn cascade_strategy(&self) -> SyncStrategy {
        SyncStrategy::Cascade {
            offset: self.config.cascade_offset_ms,
        }
    }

    /// 初始化同步组（锁定结构并解析目标）
    ///
    /// 未登记的组按空组处理，返回 [`GroupError::EmptyGroup`]。
    pub fn initialize_group(&mut self, id: &str) -> Result<(), GroupError> {
        let Some(group) = self.groups.get_mut(id) else {
            return Err(GroupError::EmptyGroup { id: id.to_string() });
        };
        group.initialize(self.ctx.resolver.as_ref())
    }

    /// 获取同步组
    pub fn group(&self, id: &str) -> Option<&SyncGroup> {
        self.groups.get(id)
    }

    /// 获取可变同步组
    pub fn group_mut(&mut self, id: &str) -> Option<&mut SyncGroup> {
        self.groups.get_mut(id)
    }

    // ========== 状态机 ==========

    /// 创建预配置的状态机构建器（共享总线、插值引擎、历史容量与存储）
    pub fn machine(&self, id: impl Into<String>, initial: impl Into<String>) -> MachineBuilder {
        let id = id.into();
        let mut builder = StateMachine::builder(id.clone(), initial)
            .with_events(self.ctx.events.clone())
            .with_interpolator(self.ctx.interpolator.clone())
            .with_history_capacity(self.config.history_capacity);
        if let Some(store) = &self.store {
            builder = builder.with_store(store.clone(), self.config.persistence_key(&id));
        }
        builder
    }

    /// 构建并登记状态机
    ///
    /// 配置了存储时尝试恢复上次保存的状态。
    pub fn register_machine(&mut self, builder: MachineBuilder) -> Result<Rc<RefCell<StateMachine>>, MachineError> {
        let mut machine = builder.build(&self.library, self.ctx.resolver.as_ref())?;
        if self.store.is_some() && machine.restore() {
            info!(machine = %machine.id(), state = %machine.current(), "已恢复状态机");
        }
        let id = machine.id().to_string();
        let machine = Rc::new(RefCell::new(machine));
        if self.machines.insert(id.clone(), machine.clone()).is_some() {
            debug!(machine = %id, "替换同名状态机");
        }
        Ok(machine)
    }

    /// 获取状态机
    pub fn state_machine(&self, id: &str) -> Option<Rc<RefCell<StateMachine>>> {
        self.machines.get(id).cloned()
    }

    // ========== 生命周期 ==========

    /// 停止同名的序列、时间轴与同步组
    pub fn stop(&mut self, id: &str) -> bool {
        let mut stopped = false;
        if let Some(sequence) = self.sequences.get_mut(id) {
            sequence.stop();
            stopped = true;
        }
        if let Some(player) = self.timelines.get_mut(id) {
            player.cancel();
            stopped = true;
        }
        if let Some(group) = self.groups.get_mut(id) {
            group.cancel();
            stopped = true;
        }
        stopped
    }

    /// 停止并移除全部登记项
    pub fn clear(&mut self) {
        for sequence in self.sequences.values_mut() {
            sequence.stop();
        }
        for player in self.timelines.values_mut() {
            player.cancel();
        }
        for group in self.groups.values_mut() {
            group.cancel();
        }
        self.sequences.clear();
        self.timelines.clear();
        self.groups.clear();
        self.machines.clear();
        info!("编排器已清空");
    }

    /// 推进全部登记项
    ///
    /// 顺序：序列、时间轴、同步组、状态机。
    pub fn tick(&mut self, now: f64) -> TickReport {
        let mut report = TickReport::default();

        for (id, sequence) in &mut self.sequences {
            report
                .sequences
                .extend(sequence.tick(now).into_iter().map(|e| (id.clone(), e)));
        }

        for (id, player) in &mut self.timelines {
            if player.tick(now).contains(&ClockEvent::Finished) {
                report.timelines.push(id.clone());
            }
        }

        for (id, group) in &mut self.groups {
            report
                .groups
                .extend(group.tick(now).into_iter().map(|e| (id.clone(), e)));
        }

        for (id, machine) in &self.machines {
            match machine.try_borrow_mut() {
                Ok(mut machine) => report
                    .transitions
                    .extend(machine.tick(now).into_iter().map(|r| (id.clone(), r))),
                Err(_) => warn!(machine = %id, "状态机正被占用，跳过本次 tick"),
            }
        }

        report
    }
}
