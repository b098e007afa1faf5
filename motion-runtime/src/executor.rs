//! # Executor 模块
//!
//! 按 tick 推进 [`CommandPlan`]。
//!
//! ## 执行模型
//!
//! ```text
//! tick(now) -> Vec<ExecutionEvent>
//! ```
//!
//! 1. 推进当前正在运行的命令（动画播放器、等待、子命令树）
//! 2. 若已结束，沿顶层序列继续，控制块与即时命令（`CALL`/`SET`/`ON`/`EMIT`）在同一 tick 内完成
//! 3. 遇到需要跨 tick 的命令时停下，返回本次产生的事件
//!
//! 顶层命令依次执行；并发只通过 `PARALLEL` 表达，且只是同一 tick 内的交错推进。
//! 等待、延迟与即时命令的结束时间作为下一条命令的起点，所以单次 tick 跨过多条这类命令时不会累积误差；
//! 动画命令以结束所在的 tick 为终点。
//!
//! 没有超时机制：一个永远不结束的命令会让整个序列停在那里。

use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::{Map, Value as JsonValue, json};
use tracing::{debug, info, warn};

use crate::animation::{AnimationDescriptor, AnimationLibrary};
use crate::clock::Repeat;
use crate::command::{Command, CommandPlan, Instruction, ItemSource, substitute};
use crate::error::CommandError;
use crate::event::{EventBus, FunctionRegistry, ListenerId, MotionEvent};
use crate::interpolation::Interpolator;
use crate::player::AnimationPlayer;
use crate::stagger::{StaggerConfig, StaggerTarget, distribute};
use crate::surface::{MotionPreference, NoPreference, TargetRef, TargetResolver};
use crate::timeline::{CompiledTimeline, TimelineEntry};

/// 序列完成时派发的事件名（载荷 `{"sequence": id}`）
pub const SEQUENCE_COMPLETE_EVENT: &str = "sequence-complete";

/// 执行上下文
///
/// 同一个编排器下的所有执行器共享同一份能力与注册表。
#[derive(Clone)]
pub struct ExecutionContext {
    /// 目标解析
    pub resolver: Rc<dyn TargetResolver>,
    /// 动效偏好
    pub preference: Rc<dyn MotionPreference>,
    /// 事件总线
    pub events: EventBus,
    /// 函数注册表
    pub functions: FunctionRegistry,
    /// 插值引擎
    pub interpolator: Rc<Interpolator>,
    /// 减弱动效时使用的时长
    pub reduced_duration: f64,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("events", &self.events)
            .field("functions", &self.functions)
            .field("reduced_duration", &self.reduced_duration)
            .finish()
    }
}

impl ExecutionContext {
    /// 使用默认偏好与新的注册表创建上下文
    pub fn new(resolver: Rc<dyn TargetResolver>) -> Self {
        Self {
            resolver,
            preference: Rc::new(NoPreference),
            events: EventBus::new(),
            functions: FunctionRegistry::new(),
            interpolator: Rc::new(Interpolator::new()),
            reduced_duration: 0.0,
        }
    }

    /// 设置动效偏好
    pub fn with_preference(mut self, preference: Rc<dyn MotionPreference>) -> Self {
        self.preference = preference;
        self
    }

    /// 设置事件总线
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// 设置函数注册表
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// 设置插值引擎
    pub fn with_interpolator(mut self, interpolator: Rc<Interpolator>) -> Self {
        self.interpolator = interpolator;
        self
    }

    /// 设置减弱动效时长
    pub fn with_reduced_duration(mut self, duration: f64) -> Self {
        self.reduced_duration = duration.max(0.0);
        self
    }

    fn is_reduced(&self, duration: f64) -> bool {
        self.preference.prefers_reduced_motion() || !self.preference.is_allowed(None, duration)
    }
}

/// 执行器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorState {
    /// 未开始
    #[default]
    Idle,
    /// 运行中
    Running,
    /// 已暂停
    Paused,
    /// 全部完成
    Completed,
    /// 已停止
    Stopped,
}

/// 执行事件
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// 命令开始（延迟结束之后）
    CommandStarted { id: String },
    /// 命令结束
    CommandFinished { id: String },
    /// 未知类型的命令被跳过
    CommandSkipped { id: String },
    /// 序列完成
    Completed,
}

/// 正在运行的命令
#[derive(Debug)]
struct Node {
    index: usize,
    task: Task,
}

#[derive(Debug)]
enum Task {
    /// 等待命令自身的延迟
    Delayed { until: f64 },
    /// `WAIT`
    Wait { until: f64 },
    /// `ANIMATE` / `STAGGER`
    Player(Box<AnimationPlayer>),
    /// `SEQUENCE`：`cursor` 为当前子命令的起点
    Sequence {
        remaining: VecDeque<usize>,
        current: Option<Box<Node>>,
        cursor: f64,
    },
    /// `PARALLEL`：`latest` 为已结束子命令中最晚的结束时间
    Parallel { running: Vec<Node>, latest: f64 },
    /// 即时完成
    Done { at: f64 },
}

impl Task {
    fn pause(&mut self, now: f64) {
        match self {
            Task::Player(player) => player.pause(now),
            Task::Sequence {
                current: Some(node), ..
            } => node.task.pause(now),
            Task::Parallel { running, .. } => running.iter_mut().for_each(|n| n.task.pause(now)),
            _ => {}
        }
    }

    fn resume(&mut self, now: f64, paused_for: f64) {
        match self {
            Task::Delayed { until } | Task::Wait { until } => *until += paused_for,
            Task::Player(player) => player.resume(now),
            Task::Sequence { current, cursor, .. } => {
                *cursor += paused_for;
                if let Some(node) = current {
                    node.task.resume(now, paused_for);
                }
            }
            Task::Parallel { running, .. } => running
                .iter_mut()
                .for_each(|n| n.task.resume(now, paused_for)),
            Task::Done { .. } => {}
        }
    }

    fn cancel(&mut self) {
        match self {
            Task::Player(player) => player.cancel(),
            Task::Sequence {
                current: Some(node), ..
            } => node.task.cancel(),
            Task::Parallel { running, .. } => running.iter_mut().for_each(|n| n.task.cancel()),
            _ => {}
        }
    }
}

/// 循环帧
#[derive(Debug)]
struct LoopFrame {
    /// `FOR_EACH` 的位置
    start: usize,
    items: Vec<JsonValue>,
    next: usize,
    binding: String,
    index: Option<String>,
}

/// 执行期环境：计划、上下文与变量
struct Env {
    sequence: String,
    plan: CommandPlan,
    ctx: ExecutionContext,
    vars: Map<String, JsonValue>,
    bindings: Vec<ListenerId>,
}

impl Env {
    fn id_of(&self, index: usize) -> String {
        self.plan
            .step(index)
            .map(|s| s.id.clone())
            .unwrap_or_default()
    }

    /// 启动命令：先等待命令延迟，再开始执行
    fn start(&mut self, index: usize, at: f64, out: &mut Vec<ExecutionEvent>) -> Node {
        let delay = self.plan.step(index).map_or(0.0, |s| s.delay);
        if delay > 0.0 {
            return Node {
                index,
                task: Task::Delayed { until: at + delay },
            };
        }
        self.begin(index, at, out)
    }

    fn begin(&mut self, index: usize, at: f64, out: &mut Vec<ExecutionEvent>) -> Node {
        let Some(step) = self.plan.step(index) else {
            return Node {
                index,
                task: Task::Done { at },
            };
        };
        let id = step.id.clone();
        let instruction = step.instruction.clone();

        if let Instruction::Skip { tag } = &instruction {
            debug!(sequence = %self.sequence, id = %id, tag = %tag, "跳过未知命令");
            out.push(ExecutionEvent::CommandSkipped { id });
            return Node {
                index,
                task: Task::Done { at },
            };
        }

        debug!(sequence = %self.sequence, id = %id, "命令开始");
        out.push(ExecutionEvent::CommandStarted { id: id.clone() });

        let task = match instruction {
            Instruction::Animate {
                target,
                animation,
                repeat,
                alternate,
            } => self.animate(&id, &target, animation, repeat, alternate, at),
            Instruction::Stagger {
                targets,
                animation,
                config,
            } => self.stagger(&id, &targets, animation, config, at),
            Instruction::Wait { duration } => Task::Wait {
                until: at + duration,
            },
            Instruction::Sequence { steps } => Task::Sequence {
                remaining: steps.into_iter().collect(),
                current: None,
                cursor: at,
            },
            Instruction::Parallel { steps } => Task::Parallel {
                running: steps.into_iter().map(|i| self.start(i, at, out)).collect(),
                latest: at,
            },
            Instruction::Call { function, args } => {
                let args = substitute(&args, &self.vars);
                self.ctx.functions.call(&function, &args);
                Task::Done { at }
            }
            Instruction::Set { variable, value } => {
                let value = substitute(&value, &self.vars);
                self.vars.insert(variable, value);
                Task::Done { at }
            }
            Instruction::On { event, function } => {
                let functions = self.ctx.functions.clone();
                let binding = self.ctx.events.on(event, move |e| {
                    functions.call(&function, &e.payload);
                    Ok(())
                });
                self.bindings.push(binding);
                Task::Done { at }
            }
            Instruction::Emit { event, payload } => {
                let payload = substitute(&payload, &self.vars);
                self.ctx.events.emit(MotionEvent::new(event).with_payload(payload));
                Task::Done { at }
            }
            // 控制块只出现在顶层，由执行器处理
            _ => Task::Done { at },
        };
        Node { index, task }
    }

    fn animate(
        &self,
        id: &str,
        target: &str,
        mut animation: AnimationDescriptor,
        repeat: u32,
        alternate: bool,
        at: f64,
    ) -> Task {
        let target = substitute(&JsonValue::String(target.to_string()), &self.vars);
        let Some(target) = target.as_str() else {
            warn!(id, value = %target, "动画目标不是字符串，视为立即完成");
            return Task::Done { at };
        };
        if self.ctx.is_reduced(animation.duration) {
            animation.duration = self.ctx.reduced_duration;
            animation.delay = 0.0;
        }

        let entry = TimelineEntry::for_animation(id, TargetRef::new(target), animation, 0.0);
        let timeline = CompiledTimeline::from_entries(vec![entry], None);
        let player = self.player(timeline).with_repeat(Repeat::Times(repeat), alternate);
        if !player.unresolved().is_empty() {
            return Task::Done { at };
        }
        self.play(player, at)
    }

    fn stagger(
        &self,
        id: &str,
        targets: &ItemSource,
        mut animation: AnimationDescriptor,
        mut config: StaggerConfig,
        at: f64,
    ) -> Task {
        let targets: Vec<StaggerTarget> = targets
            .items(&self.vars)
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::String(s) => Some(StaggerTarget::new(s)),
                other => serde_json::from_value::<StaggerTarget>(other.clone())
                    .map_err(|e| warn!(id, value = %other, error = %e, "无效的错开目标，已忽略"))
                    .ok(),
            })
            .collect();
        if targets.is_empty() {
            return Task::Done { at };
        }

        if self.ctx.is_reduced(animation.duration) {
            animation.duration = self.ctx.reduced_duration;
            animation.delay = 0.0;
            config = StaggerConfig::default();
        }

        let plan = distribute(&targets, animation.duration, &config);
        let entries = plan
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let mut item = animation.clone();
                item.duration = slot.duration;
                TimelineEntry::for_animation(format!("{id}[{i}]"), TargetRef::new(slot.id.as_str()), item, slot.delay)
                    .with_parent(id)
            })
            .collect();
        let player = self.player(CompiledTimeline::from_entries(entries, None));
        if player.unresolved().len() == targets.len() {
            return Task::Done { at };
        }
        self.play(player, at)
    }

    fn player(&self, timeline: CompiledTimeline) -> AnimationPlayer {
        AnimationPlayer::new(timeline, self.ctx.resolver.as_ref(), self.ctx.interpolator.clone())
            .with_events(self.ctx.events.clone())
            .with_functions(self.ctx.functions.clone())
    }

    fn play(&self, mut player: AnimationPlayer, at: f64) -> Task {
        player.play(at);
        Task::Player(Box::new(player))
    }

    /// 推进节点；结束时返回结束时间
    fn poll(&mut self, node: &mut Node, now: f64, out: &mut Vec<ExecutionEvent>) -> Option<f64> {
        if let Task::Delayed { until } = node.task {
            if now < until {
                return None;
            }
            *node = self.begin(node.index, until, out);
        }

        match &mut node.task {
            Task::Delayed { .. } => None,
            Task::Wait { until } => (now >= *until).then_some(*until),
            Task::Done { at } => Some(*at),
            Task::Player(player) => {
                player.tick(now);
                player.is_finished().then_some(now)
            }
            Task::Sequence {
                remaining,
                current,
                cursor,
            } => loop {
                if current.is_none() {
                    match remaining.pop_front() {
                        Some(next) => *current = Some(Box::new(self.start(next, *cursor, out))),
                        None => return Some(*cursor),
                    }
                }
                let child = current.as_mut()?;
                match self.poll(child, now, out) {
                    Some(end) => {
                        out.push(ExecutionEvent::CommandFinished {
                            id: self.id_of(child.index),
                        });
                        *cursor = end;
                        *current = None;
                    }
                    None => return None,
                }
            },
            Task::Parallel { running, latest } => {
                let mut i = 0;
                while i < running.len() {
                    match self.poll(&mut running[i], now, out) {
                        Some(end) => {
                            let done = running.remove(i);
                            out.push(ExecutionEvent::CommandFinished {
                                id: self.id_of(done.index),
                            });
                            *latest = latest.max(end);
                        }
                        None => i += 1,
                    }
                }
                running.is_empty().then_some(*latest)
            }
        }
    }
}

/// 命令计划执行器
///
/// # 使用示例
///
/// ```ignore
/// let mut executor = PlanExecutor::new("intro", commands, &library, ctx)?;
/// executor.play(now);
/// loop {
///     let events = executor.tick(now);
///     if executor.is_finished() { break; }
/// }
/// ```
pub struct PlanExecutor {
    commands: Vec<Command>,
    env: Env,
    initial_vars: Map<String, JsonValue>,
    /// 顶层序列中的位置
    pc: usize,
    loops: Vec<LoopFrame>,
    active: Option<Node>,
    state: ExecutorState,
    paused_at: Option<f64>,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("id", &self.env.sequence)
            .field("state", &self.state)
            .field("pc", &self.pc)
            .field("active", &self.active)
            .finish()
    }
}

impl PlanExecutor {
    /// 构建计划并创建执行器
    ///
    /// # 错误
    ///
    /// 计划构建失败时返回 [`CommandError`]，不会创建执行器。
    pub fn new(
        id: impl Into<String>,
        commands: Vec<Command>,
        library: &AnimationLibrary,
        ctx: ExecutionContext,
    ) -> Result<Self, CommandError> {
        let plan = CommandPlan::build(&commands, library)?;
        Ok(Self {
            commands,
            env: Env {
                sequence: id.into(),
                plan,
                ctx,
                vars: Map::new(),
                bindings: Vec::new(),
            },
            initial_vars: Map::new(),
            pc: 0,
            loops: Vec::new(),
            active: None,
            state: ExecutorState::Idle,
            paused_at: None,
        })
    }

    /// 设置初始变量
    pub fn with_variables(mut self, vars: Map<String, JsonValue>) -> Self {
        self.env.vars = vars.clone();
        self.initial_vars = vars;
        self
    }

    /// 按当前命令重新构建计划
    ///
    /// 失败时保留原计划。成功后执行器回到 `Idle`。
    pub fn rebuild_plan(&mut self, library: &AnimationLibrary) -> Result<(), CommandError> {
        let plan = CommandPlan::build(&self.commands, library)?;
        self.stop();
        self.env.plan = plan;
        self.state = ExecutorState::Idle;
        Ok(())
    }

    /// 替换命令并重新构建计划；失败时保持不变
    pub fn replace_commands(&mut self, commands: Vec<Command>, library: &AnimationLibrary) -> Result<(), CommandError> {
        let plan = CommandPlan::build(&commands, library)?;
        self.stop();
        self.commands = commands;
        self.env.plan = plan;
        self.state = ExecutorState::Idle;
        Ok(())
    }

    /// 开始执行，并推进到第一个阻塞点
    ///
    /// `Paused` 时等同于 [`resume`](Self::resume)；已完成或已停止时从头开始。
    pub fn play(&mut self, now: f64) -> Vec<ExecutionEvent> {
        match self.state {
            ExecutorState::Running => Vec::new(),
            ExecutorState::Paused => {
                self.resume(now);
                self.tick(now)
            }
            ExecutorState::Idle | ExecutorState::Completed | ExecutorState::Stopped => {
                self.reset();
                self.state = ExecutorState::Running;
                info!(sequence = %self.env.sequence, commands = self.env.plan.len(), "序列开始");
                self.tick(now)
            }
        }
    }

    /// 暂停
    pub fn pause(&mut self, now: f64) {
        if self.state == ExecutorState::Running {
            if let Some(node) = &mut self.active {
                node.task.pause(now);
            }
            self.paused_at = Some(now);
            self.state = ExecutorState::Paused;
        }
    }

    /// 恢复
    pub fn resume(&mut self, now: f64) {
        if self.state == ExecutorState::Paused {
            let paused_for = self.paused_at.take().map_or(0.0, |t| (now - t).max(0.0));
            if let Some(node) = &mut self.active {
                node.task.resume(now, paused_for);
            }
            self.state = ExecutorState::Running;
        }
    }

    /// 停止：取消正在运行的命令并解除 `ON` 绑定
    pub fn stop(&mut self) {
        if let Some(mut node) = self.active.take() {
            node.task.cancel();
        }
        self.loops.clear();
        self.unbind();
        if matches!(self.state, ExecutorState::Running | ExecutorState::Paused) {
            info!(sequence = %self.env.sequence, "序列停止");
            self.state = ExecutorState::Stopped;
        }
    }

    /// 推进到 `now`
    pub fn tick(&mut self, now: f64) -> Vec<ExecutionEvent> {
        let mut out = Vec::new();
        if self.state == ExecutorState::Running {
            self.advance(now, &mut out);
        }
        out
    }

    fn reset(&mut self) {
        self.stop();
        self.pc = 0;
        self.env.vars = self.initial_vars.clone();
        self.paused_at = None;
    }

    fn unbind(&mut self) {
        for id in self.env.bindings.drain(..) {
            self.env.ctx.events.off(id);
        }
    }

    fn advance(&mut self, now: f64, out: &mut Vec<ExecutionEvent>) {
        let mut at = now;
        loop {
            if let Some(mut node) = self.active.take() {
                match self.env.poll(&mut node, now, out) {
                    Some(end) => {
                        out.push(ExecutionEvent::CommandFinished {
                            id: self.env.id_of(node.index),
                        });
                        at = end;
                        self.pc += 1;
                    }
                    None => {
                        self.active = Some(node);
                        return;
                    }
                }
            }

            let Some(index) = self.env.plan.top_level().get(self.pc).copied() else {
                self.complete(out);
                return;
            };
            let instruction = match self.env.plan.step(index) {
                Some(step) => step.instruction.clone(),
                None => {
                    self.complete(out);
                    return;
                }
            };

            match instruction {
                Instruction::If { condition, next } => {
                    if condition.evaluate(&self.env.vars) {
                        self.pc += 1;
                    } else {
                        self.enter_branch(next);
                    }
                }
                // 顺序执行到下一个分支，说明前一个分支已经执行完
                Instruction::ElseIf { .. } | Instruction::Else { .. } => {
                    self.pc = self.end_of_if(self.pc) + 1;
                }
                Instruction::EndIf => self.pc += 1,
                Instruction::ForEach {
                    items,
                    binding,
                    index,
                    end,
                } => {
                    let items = items.items(&self.env.vars);
                    if items.is_empty() {
                        self.pc = end + 1;
                    } else {
                        let mut frame = LoopFrame {
                            start: self.pc,
                            items,
                            next: 0,
                            binding,
                            index,
                        };
                        self.bind(&mut frame);
                        self.loops.push(frame);
                        self.pc += 1;
                    }
                }
                Instruction::EndForEach { start } => {
                    match self.loops.pop() {
                        Some(mut frame) if frame.start == start && frame.next < frame.items.len() => {
                            self.bind(&mut frame);
                            self.loops.push(frame);
                            self.pc = start + 1;
                        }
                        _ => self.pc += 1,
                    }
                }
                _ => self.active = Some(self.env.start(index, at, out)),
            }
        }
    }

    fn bind(&mut self, frame: &mut LoopFrame) {
        let item = frame.items[frame.next].clone();
        self.env.vars.insert(frame.binding.clone(), item);
        if let Some(index) = &frame.index {
            self.env.vars.insert(index.clone(), json!(frame.next));
        }
        frame.next += 1;
    }

    /// 从分支位置开始寻找第一个成立的分支
    fn enter_branch(&mut self, mut pos: usize) {
        loop {
            let instruction = self
                .env
                .plan
                .top_level()
                .get(pos)
                .and_then(|&i| self.env.plan.step(i))
                .map(|s| s.instruction.clone());
            match instruction {
                Some(Instruction::ElseIf { condition, next }) => {
                    if condition.evaluate(&self.env.vars) {
                        self.pc = pos + 1;
                        return;
                    }
                    pos = next;
                }
                // ELSE 或 END_IF
                _ => {
                    self.pc = pos + 1;
                    return;
                }
            }
        }
    }

    fn end_of_if(&self, mut pos: usize) -> usize {
        loop {
            let instruction = self
                .env
                .plan
                .top_level()
                .get(pos)
                .and_then(|&i| self.env.plan.step(i))
                .map(|s| &s.instruction);
            match instruction {
                Some(Instruction::ElseIf { next, .. }) => pos = *next,
                Some(Instruction::Else { end }) => return *end,
                _ => return pos,
            }
        }
    }

    fn complete(&mut self, out: &mut Vec<ExecutionEvent>) {
        self.state = ExecutorState::Completed;
        self.loops.clear();
        info!(sequence = %self.env.sequence, "序列完成");
        out.push(ExecutionEvent::Completed);
        self.env.ctx.events.emit(
            MotionEvent::new(SEQUENCE_COMPLETE_EVENT).with_payload(json!({ "sequence": self.env.sequence })),
        );
    }

    // ========== 查询 ==========

    /// 序列 ID
    pub fn id(&self) -> &str {
        &self.env.sequence
    }

    /// 当前状态
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// 是否已完成
    pub fn is_finished(&self) -> bool {
        self.state == ExecutorState::Completed
    }

    /// 计划
    pub fn plan(&self) -> &CommandPlan {
        &self.env.plan
    }

    /// 当前顶层命令 ID
    pub fn current(&self) -> Option<&str> {
        let index = *self.env.plan.top_level().get(self.pc)?;
        self.env.plan.step(index).map(|s| s.id.as_str())
    }

    /// 变量
    pub fn variables(&self) -> &Map<String, JsonValue> {
        &self.env.vars
    }

    /// 读取变量
    pub fn variable(&self, name: &str) -> Option<&JsonValue> {
        self.env.vars.get(name)
    }

    /// 设置变量
    pub fn set_variable(&mut self, name: impl Into<String>, value: JsonValue) {
        self.env.vars.insert(name.into(), value);
    }
}

impl Drop for PlanExecutor {
    fn drop(&mut self) {
        if let Some(mut node) = self.active.take() {
            node.task.cancel();
        }
        self.unbind();
    }
}
