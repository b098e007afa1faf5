//! # Machine 模块
//!
//! 有限状态机：状态、转换、动画阶段、历史与持久化。
//!
//! ## 转换流程
//!
//! ```text
//! send(event)
//!   -> Exit      源状态的退出动画
//!   -> Animate   转换自身的动画
//!   -> Enter     动作列表 -> 提交状态 -> 应用目标状态的静态样式/属性 -> 进入动画
//!   -> 收尾      历史 -> 持久化 -> 变更回调 -> 通知 -> 安排超时
//! ```
//!
//! 动画跨越多次 [`StateMachine::tick`]；整个过程中转换锁一直持有，
//! 期间的 `send` 返回 [`SendError::Busy`]，除非当前转换声明为可中断。
//! 没有可写表面或动画时长为 0 时，`send` 同步完成。
//!
//! 用户提供的 condition、guard、动作与回调中的错误和 panic 都会被捕获并记录，
//! 不会破坏状态机。

mod history;
mod persist;

pub use history::{DEFAULT_HISTORY_CAPACITY, TransitionHistory, TransitionRecord};
pub use persist::{
    FileStore, KeyValueStore, MachineSnapshot, MemoryStore, SNAPSHOT_VERSION_MAJOR,
    SNAPSHOT_VERSION_MINOR, SnapshotVersion,
};

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::animation::{AnimationDescriptor, AnimationLibrary, AnimationRef};
use crate::clock::{ClockEvent, PlaybackClock};
use crate::error::{MachineError, RejectReason, SendError};
use crate::event::{EventBus, HandlerResult, MotionEvent, call_guarded, invoke_guarded};
use crate::interpolation::{Interpolator, Value};
use crate::player::AnimationPlayer;
use crate::surface::{
    FixedResolver, SurfaceHandle, TargetRef, TargetResolver, TrackKind, apply_value,
};
use crate::timeline::{CompiledTimeline, TimelineEntry};

/// 匹配任意状态的 `from`
pub const ANY_STATE: &str = "*";

/// 自动超时事件
pub const TIMEOUT_EVENT: &str = "timeout";

/// 通用状态变更通知
pub const STATE_CHANGED_EVENT: &str = "state-changed";

/// [`StateMachine::transition_to`] 记录在历史中的事件名
pub const DIRECT_EVENT: &str = "transition_to";

/// 附加数据
pub type MachineData = serde_json::Map<String, serde_json::Value>;

/// condition / guard 谓词
pub type Predicate = Rc<dyn Fn(&GuardContext<'_>) -> bool>;

/// 转换动作
pub type Action = Rc<dyn Fn(&mut ActionContext<'_>) -> HandlerResult>;

/// 状态变更回调
pub type ChangeCallback = Rc<dyn Fn(&TransitionRecord) -> HandlerResult>;

/// 状态定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    /// 状态 ID
    pub id: String,
    /// 显示名称
    #[serde(default)]
    pub name: String,
    /// 进入动画
    #[serde(default)]
    pub enter_animation: Option<AnimationRef>,
    /// 退出动画
    #[serde(default)]
    pub exit_animation: Option<AnimationRef>,
    /// 进入时同步应用的样式
    #[serde(default)]
    pub styles: BTreeMap<String, Value>,
    /// 进入时同步应用的属性
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// 自动超时（毫秒）
    #[serde(default)]
    pub timeout: Option<f64>,
    /// 终止状态不接受任何事件
    #[serde(default)]
    pub terminal: bool,
}

impl StateDefinition {
    /// 创建状态（名称默认与 ID 相同）
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enter_animation: None,
            exit_animation: None,
            styles: BTreeMap::new(),
            properties: BTreeMap::new(),
            timeout: None,
            terminal: false,
        }
    }

    /// 设置名称
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 设置进入动画
    pub fn on_enter(mut self, animation: impl Into<AnimationRef>) -> Self {
        self.enter_animation = Some(animation.into());
        self
    }

    /// 设置退出动画
    pub fn on_exit(mut self, animation: impl Into<AnimationRef>) -> Self {
        self.exit_animation = Some(animation.into());
        self
    }

    /// 添加静态样式
    pub fn with_style(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.styles.insert(key.into(), value.into());
        self
    }

    /// 添加静态属性
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// 设置自动超时
    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 标记为终止状态
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }
}

/// 谓词上下文
#[derive(Debug)]
pub struct GuardContext<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub event: &'a str,
    pub params: &'a serde_json::Value,
    pub data: &'a MachineData,
}

/// 动作上下文（可修改附加数据）
#[derive(Debug)]
pub struct ActionContext<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub event: &'a str,
    pub params: &'a serde_json::Value,
    pub data: &'a mut MachineData,
}

/// 转换定义
#[derive(Clone)]
pub struct Transition {
    /// 源状态，`"*"` 匹配任意状态
    pub from: String,
    /// 触发事件
    pub event: String,
    /// 目标状态
    pub to: String,
    /// 转换动画
    pub animation: Option<AnimationRef>,
    /// 先求值的条件
    pub condition: Option<Predicate>,
    /// 后求值的守卫
    pub guard: Option<Predicate>,
    /// 按顺序执行的动作
    pub actions: Vec<Action>,
    /// 进行中时是否允许被新事件打断
    pub interruptible: bool,
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from)
            .field("event", &self.event)
            .field("to", &self.to)
            .field("animation", &self.animation)
            .field("condition", &self.condition.is_some())
            .field("guard", &self.guard.is_some())
            .field("actions", &self.actions.len())
            .field("interruptible", &self.interruptible)
            .finish()
    }
}

impl Transition {
    /// 创建转换
    pub fn new(from: impl Into<String>, event: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            event: event.into(),
            to: to.into(),
            animation: None,
            condition: None,
            guard: None,
            actions: Vec::new(),
            interruptible: false,
        }
    }

    /// 设置转换动画
    pub fn with_animation(mut self, animation: impl Into<AnimationRef>) -> Self {
        self.animation = Some(animation.into());
        self
    }

    /// 设置条件
    pub fn when(mut self, condition: impl Fn(&GuardContext<'_>) -> bool + 'static) -> Self {
        self.condition = Some(Rc::new(condition));
        self
    }

    /// 设置守卫
    pub fn guarded_by(mut self, guard: impl Fn(&GuardContext<'_>) -> bool + 'static) -> Self {
        self.guard = Some(Rc::new(guard));
        self
    }

    /// 追加动作
    pub fn then(
        mut self,
        action: impl Fn(&mut ActionContext<'_>) -> HandlerResult + 'static,
    ) -> Self {
        self.actions.push(Rc::new(action));
        self
    }

    /// 标记为可中断
    pub fn interruptible(mut self) -> Self {
        self.interruptible = true;
        self
    }

    fn matches(&self, state: &str, event: &str) -> bool {
        self.event == event && (self.from == state || self.from == ANY_STATE)
    }
}

/// 转换阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    /// 源状态退出动画
    Exit,
    /// 转换动画
    Animate,
    /// 已提交，目标状态进入动画
    Enter,
}

/// `send` 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// 同步完成
    Completed(TransitionRecord),
    /// 动画进行中，由后续 `tick` 完成
    InProgress { from: String, to: String },
}

impl SendOutcome {
    /// 是否已完成
    pub fn is_completed(&self) -> bool {
        matches!(self, SendOutcome::Completed(_))
    }
}

struct ResolvedState {
    def: StateDefinition,
    enter: Option<AnimationDescriptor>,
    exit: Option<AnimationDescriptor>,
}

struct ResolvedTransition {
    def: Transition,
    animation: Option<AnimationDescriptor>,
}

struct InFlight {
    /// `None` 表示 `transition_to`
    transition: Option<usize>,
    from: String,
    to: String,
    event: String,
    params: serde_json::Value,
    phase: TransitionPhase,
    /// 当前阶段是否已开始
    started: bool,
    player: Option<AnimationPlayer>,
    interruptible: bool,
}

struct PendingTimeout {
    state: String,
    clock: PlaybackClock,
}

/// 状态机构建器
pub struct MachineBuilder {
    id: String,
    initial: String,
    states: Vec<StateDefinition>,
    transitions: Vec<Transition>,
    target: Option<TargetRef>,
    history_capacity: usize,
    store: Option<(Rc<dyn KeyValueStore>, String)>,
    events: Option<EventBus>,
    on_change: Option<ChangeCallback>,
    interpolator: Option<Rc<Interpolator>>,
    data: MachineData,
}

impl std::fmt::Debug for MachineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineBuilder")
            .field("id", &self.id)
            .field("initial", &self.initial)
            .field("states", &self.states.len())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

impl MachineBuilder {
    /// 添加状态
    pub fn state(mut self, state: StateDefinition) -> Self {
        self.states.push(state);
        self
    }

    /// 添加转换
    pub fn transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    /// 设置动画与静态样式作用的目标
    pub fn with_target(mut self, target: impl Into<TargetRef>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// 设置历史容量
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// 设置持久化存储与键
    pub fn with_store(mut self, store: Rc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        self.store = Some((store, key.into()));
        self
    }

    /// 使用共享的事件总线
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// 设置状态变更回调
    pub fn on_change(
        mut self,
        callback: impl Fn(&TransitionRecord) -> HandlerResult + 'static,
    ) -> Self {
        self.on_change = Some(Rc::new(callback));
        self
    }

    /// 使用共享的插值引擎
    pub fn with_interpolator(mut self, interpolator: Rc<Interpolator>) -> Self {
        self.interpolator = Some(interpolator);
        self
    }

    /// 设置初始附加数据
    pub fn with_data(mut self, data: MachineData) -> Self {
        self.data = data;
        self
    }

    /// 构建状态机
    ///
    /// 动画引用在这里一次性解析，目标在这里一次性解析为表面。
    ///
    /// # 错误
    ///
    /// - 重复的状态 ID
    /// - 初始状态不存在
    /// - 转换引用了不存在的状态
    /// - 引用了未注册的动画
    pub fn build(
        self,
        library: &AnimationLibrary,
        resolver: &dyn TargetResolver,
    ) -> Result<StateMachine, MachineError> {
        let mut index = HashMap::new();
        let mut states = Vec::with_capacity(self.states.len());
        for def in self.states {
            if index.contains_key(&def.id) {
                return Err(MachineError::DuplicateState { id: def.id });
            }
            let enter = resolve_animation(library, def.enter_animation.as_ref())?;
            let exit = resolve_animation(library, def.exit_animation.as_ref())?;
            index.insert(def.id.clone(), states.len());
            states.push(ResolvedState { def, enter, exit });
        }

        if !index.contains_key(&self.initial) {
            return Err(MachineError::InvalidInitialState { id: self.initial });
        }

        let mut transitions = Vec::with_capacity(self.transitions.len());
        for def in self.transitions {
            for state in [&def.from, &def.to] {
                if state != ANY_STATE && !index.contains_key(state) {
                    return Err(MachineError::UnknownState {
                        id: state.clone(),
                        event: def.event.clone(),
                    });
                }
            }
            if def.to == ANY_STATE {
                return Err(MachineError::UnknownState {
                    id: def.to.clone(),
                    event: def.event.clone(),
                });
            }
            let animation = resolve_animation(library, def.animation.as_ref())?;
            transitions.push(ResolvedTransition { def, animation });
        }

        let surfaces = match &self.target {
            Some(target) => {
                let surfaces = resolver.resolve(target);
                if surfaces.is_empty() {
                    warn!(machine = %self.id, reference = %target, "状态机目标未解析到任何表面");
                }
                surfaces
            }
            None => Vec::new(),
        };

        let awaiting_initial_timeout = index
            .get(&self.initial)
            .and_then(|&i| states[i].def.timeout)
            .is_some_and(|t| t > 0.0);

        let machine = StateMachine {
            id: self.id,
            states,
            index,
            transitions,
            current: self.initial,
            previous: None,
            history: TransitionHistory::new().with_capacity(self.history_capacity),
            data: self.data,
            surfaces,
            interpolator: self
                .interpolator
                .unwrap_or_else(|| Rc::new(Interpolator::new())),
            events: self.events.unwrap_or_default(),
            store: self.store,
            on_change: self.on_change,
            in_flight: None,
            timeout: None,
            entered_at: 0.0,
            awaiting_initial_timeout,
        };
        machine.apply_static(&machine.current);
        info!(
            machine = %machine.id,
            initial = %machine.current,
            states = machine.states.len(),
            transitions = machine.transitions.len(),
            "状态机已创建"
        );
        Ok(machine)
    }
}

fn resolve_animation(
    library: &AnimationLibrary,
    reference: Option<&AnimationRef>,
) -> Result<Option<AnimationDescriptor>, MachineError> {
    reference
        .map(|r| {
            library
                .resolve(r)
                .map_err(|name| MachineError::UnknownAnimation { name })
        })
        .transpose()
}

/// 状态机
pub struct StateMachine {
    id: String,
    states: Vec<ResolvedState>,
    index: HashMap<String, usize>,
    transitions: Vec<ResolvedTransition>,
    current: String,
    previous: Option<String>,
    history: TransitionHistory,
    data: MachineData,
    surfaces: Vec<SurfaceHandle>,
    interpolator: Rc<Interpolator>,
    events: EventBus,
    store: Option<(Rc<dyn KeyValueStore>, String)>,
    on_change: Option<ChangeCallback>,
    in_flight: Option<InFlight>,
    timeout: Option<PendingTimeout>,
    /// 进入当前状态的时间
    entered_at: f64,
    awaiting_initial_timeout: bool,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("id", &self.id)
            .field("current", &self.current)
            .field("previous", &self.previous)
            .field("transitioning", &self.in_flight.is_some())
            .field("history", &self.history.len())
            .finish()
    }
}

impl StateMachine {
    /// 创建构建器
    pub fn builder(id: impl Into<String>, initial: impl Into<String>) -> MachineBuilder {
        MachineBuilder {
            id: id.into(),
            initial: initial.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            target: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            store: None,
            events: None,
            on_change: None,
            interpolator: None,
            data: MachineData::new(),
        }
    }

    // ========== 事件 ==========

    /// 发送事件
    ///
    /// 原始事件总是先派发给事件总线（即使没有匹配的转换）。
    ///
    /// # 错误
    ///
    /// 全部可恢复，状态保持不变：
    /// - [`SendError::Busy`]: 已有不可中断的转换在进行
    /// - [`SendError::Terminal`]: 当前为终止状态
    /// - [`SendError::NoTransition`]: 没有匹配的转换
    /// - [`SendError::Rejected`]: condition 或 guard 未通过
    pub fn send(
        &mut self,
        event: &str,
        params: serde_json::Value,
        now: f64,
    ) -> Result<SendOutcome, SendError> {
        self.interrupt_or_busy(event, now)?;
        self.events
            .emit(MotionEvent::new(event).with_payload(params.clone()));

        if self.current_definition().is_some_and(|s| s.terminal) {
            return Err(SendError::Terminal {
                state: self.current.clone(),
                event: event.to_string(),
            });
        }

        let Some(index) = self.find_transition(event) else {
            debug!(machine = %self.id, state = %self.current, event, "没有匹配的转换");
            return Err(SendError::NoTransition {
                state: self.current.clone(),
                event: event.to_string(),
            });
        };
        self.check(index, event, &params)?;

        let transition = &self.transitions[index].def;
        let to = transition.to.clone();
        let interruptible = transition.interruptible;
        Ok(self.begin(Some(index), event, to, params, interruptible, now))
    }

    /// 直接转换到指定状态（同步点驱动）
    ///
    /// 不经过转换表，不执行动作；退出与进入动画照常播放。
    pub fn transition_to(&mut self, state: &str, now: f64) -> Result<SendOutcome, SendError> {
        self.interrupt_or_busy(DIRECT_EVENT, now)?;
        if !self.index.contains_key(state) {
            return Err(SendError::UnknownState {
                state: state.to_string(),
            });
        }
        if self.current_definition().is_some_and(|s| s.terminal) {
            return Err(SendError::Terminal {
                state: self.current.clone(),
                event: DIRECT_EVENT.to_string(),
            });
        }
        Ok(self.begin(
            None,
            DIRECT_EVENT,
            state.to_string(),
            serde_json::Value::Null,
            false,
            now,
        ))
    }

    /// 推进进行中的转换与自动超时，返回本次完成的转换
    pub fn tick(&mut self, now: f64) -> Vec<TransitionRecord> {
        let mut completed = Vec::new();

        if self.awaiting_initial_timeout {
            self.awaiting_initial_timeout = false;
            self.entered_at = now;
            self.schedule_timeout();
        }

        if self.in_flight.is_some()
            && let Some(record) = self.drive(now, false)
        {
            completed.push(record);
        }

        if self.in_flight.is_none()
            && let Some(pending) = self.timeout.as_mut()
            && pending.clock.tick(now).contains(&ClockEvent::Finished)
        {
            let state = pending.state.clone();
            self.timeout = None;
            if state == self.current {
                debug!(machine = %self.id, state = %state, "自动超时");
                match self.send(TIMEOUT_EVENT, serde_json::Value::Null, now) {
                    Ok(SendOutcome::Completed(record)) => completed.push(record),
                    Ok(SendOutcome::InProgress { .. }) => {}
                    Err(err) => debug!(machine = %self.id, error = %err, "超时事件没有触发转换"),
                }
            }
        }

        completed
    }

    /// 当前状态下事件是否有匹配的转换（不求值谓词）
    pub fn can(&self, event: &str) -> bool {
        self.in_flight.is_none()
            && !self.current_definition().is_some_and(|s| s.terminal)
            && self.find_transition(event).is_some()
    }

    /// 当前状态下可用的事件（按声明顺序去重）
    pub fn available_events(&self) -> Vec<String> {
        let mut events: Vec<String> = Vec::new();
        for transition in &self.transitions {
            let from = transition.def.from.as_str();
            if (from == self.current || from == ANY_STATE)
                && !events.contains(&transition.def.event)
            {
                events.push(transition.def.event.clone());
            }
        }
        events
    }

    // ========== 持久化 ==========

    /// 当前快照
    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            version: SnapshotVersion::current(),
            current_state: self.current.clone(),
            previous_state: self.previous.clone(),
            history: self.history.records().to_vec(),
            data: self.data.clone(),
        }
    }

    /// 从存储恢复
    ///
    /// 读取或解析失败只记录日志；快照中的状态不存在时忽略。返回是否已恢复。
    pub fn restore(&mut self) -> bool {
        let Some((store, key)) = self.store.clone() else {
            return false;
        };
        let json = match store.get(&key) {
            Ok(Some(json)) => json,
            Ok(None) => return false,
            Err(err) => {
                warn!(machine = %self.id, key = %key, error = %err, "读取状态快照失败");
                return false;
            }
        };
        match MachineSnapshot::from_json(&json) {
            Ok(snapshot) => self.restore_from(snapshot),
            Err(err) => {
                warn!(machine = %self.id, key = %key, error = %err, "解析状态快照失败");
                false
            }
        }
    }

    /// 应用快照；状态不存在或正在转换时忽略
    pub fn restore_from(&mut self, snapshot: MachineSnapshot) -> bool {
        if self.in_flight.is_some() {
            warn!(machine = %self.id, "转换进行中，忽略快照");
            return false;
        }
        if !self.index.contains_key(&snapshot.current_state) {
            debug!(
                machine = %self.id,
                state = %snapshot.current_state,
                "快照中的状态不存在，已忽略"
            );
            return false;
        }

        self.current = snapshot.current_state;
        self.previous = snapshot.previous_state;
        self.history.replace(snapshot.history);
        self.data = snapshot.data;
        self.timeout = None;
        self.awaiting_initial_timeout = false;
        self.apply_static(&self.current);
        info!(machine = %self.id, state = %self.current, "状态已恢复");
        true
    }

    // ========== 查询 ==========

    /// 状态机 ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 当前状态
    pub fn current(&self) -> &str {
        &self.current
    }

    /// 上一个状态
    pub fn previous(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    /// 状态定义
    pub fn state(&self, id: &str) -> Option<&StateDefinition> {
        self.index.get(id).map(|&i| &self.states[i].def)
    }

    /// 转换历史
    pub fn history(&self) -> &TransitionHistory {
        &self.history
    }

    /// 附加数据
    pub fn data(&self) -> &MachineData {
        &self.data
    }

    /// 设置附加数据
    pub fn set_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// 是否正在转换
    pub fn is_transitioning(&self) -> bool {
        self.in_flight.is_some()
    }

    /// 进行中转换的阶段
    pub fn phase(&self) -> Option<TransitionPhase> {
        self.in_flight.as_ref().map(|f| f.phase)
    }

    /// 事件总线
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ========== 内部 ==========

    fn current_definition(&self) -> Option<&StateDefinition> {
        self.state(&self.current)
    }

    /// 精确匹配优先于 `"*"`；同类中按声明顺序取第一个
    fn find_transition(&self, event: &str) -> Option<usize> {
        let exact = self
            .transitions
            .iter()
            .position(|t| t.def.event == event && t.def.from == self.current);
        exact.or_else(|| {
            self.transitions
                .iter()
                .position(|t| t.def.matches(&self.current, event))
        })
    }

    fn check(
        &self,
        index: usize,
        event: &str,
        params: &serde_json::Value,
    ) -> Result<(), SendError> {
        let transition = &self.transitions[index].def;
        let ctx = GuardContext {
            from: &self.current,
            to: &transition.to,
            event,
            params,
            data: &self.data,
        };

        let checks = [
            (RejectReason::Condition, &transition.condition),
            (RejectReason::Guard, &transition.guard),
        ];
        for (reason, predicate) in checks {
            if let Some(predicate) = predicate
                && !call_guarded(&reason.to_string(), event, || predicate(&ctx)).unwrap_or(false)
            {
                debug!(machine = %self.id, event, %reason, "转换被拒绝");
                return Err(SendError::Rejected {
                    event: event.to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }

    fn interrupt_or_busy(&mut self, event: &str, now: f64) -> Result<(), SendError> {
        let Some(interruptible) = self.in_flight.as_ref().map(|f| f.interruptible) else {
            return Ok(());
        };
        if interruptible {
            debug!(machine = %self.id, event, "打断进行中的转换");
            self.drive(now, true);
            Ok(())
        } else {
            warn!(machine = %self.id, event, "转换进行中，拒绝事件");
            Err(SendError::Busy {
                event: event.to_string(),
            })
        }
    }

    fn begin(
        &mut self,
        transition: Option<usize>,
        event: &str,
        to: String,
        params: serde_json::Value,
        interruptible: bool,
        now: f64,
    ) -> SendOutcome {
        let from = self.current.clone();
        debug!(machine = %self.id, from = %from, to = %to, event, "开始转换");
        self.in_flight = Some(InFlight {
            transition,
            from: from.clone(),
            to: to.clone(),
            event: event.to_string(),
            params,
            phase: TransitionPhase::Exit,
            started: false,
            player: None,
            interruptible,
        });
        match self.drive(now, false) {
            Some(record) => SendOutcome::Completed(record),
            None => SendOutcome::InProgress { from, to },
        }
    }

    /// 推进转换；`interrupt` 时所有动画立即跳到结尾
    fn drive(&mut self, now: f64, interrupt: bool) -> Option<TransitionRecord> {
        let mut flight = self.in_flight.take()?;
        loop {
            if !flight.started {
                flight.started = true;
                if flight.phase == TransitionPhase::Enter {
                    self.commit(&flight, now);
                }
                let animation = self.phase_animation(&flight);
                flight.player = self.start_animation(animation, now);
            }

            if let Some(player) = flight.player.as_mut() {
                if interrupt {
                    player.finish_now();
                } else {
                    player.tick(now);
                }
                if !player.is_finished() {
                    self.in_flight = Some(flight);
                    return None;
                }
                flight.player = None;
            }

            flight.phase = match flight.phase {
                TransitionPhase::Exit => TransitionPhase::Animate,
                TransitionPhase::Animate => TransitionPhase::Enter,
                TransitionPhase::Enter => return Some(self.finalize(flight, now)),
            };
            flight.started = false;
        }
    }

    fn phase_animation(&self, flight: &InFlight) -> Option<AnimationDescriptor> {
        match flight.phase {
            TransitionPhase::Exit => self.resolved(&flight.from).and_then(|s| s.exit.clone()),
            TransitionPhase::Animate => flight
                .transition
                .and_then(|i| self.transitions[i].animation.clone()),
            TransitionPhase::Enter => self.resolved(&flight.to).and_then(|s| s.enter.clone()),
        }
    }

    fn resolved(&self, id: &str) -> Option<&ResolvedState> {
        self.index.get(id).map(|&i| &self.states[i])
    }

    fn start_animation(
        &self,
        animation: Option<AnimationDescriptor>,
        now: f64,
    ) -> Option<AnimationPlayer> {
        let animation = animation?;
        if self.surfaces.is_empty() {
            return None;
        }
        let entry = TimelineEntry::for_animation(
            self.id.clone(),
            TargetRef::new(self.id.clone()),
            animation,
            0.0,
        );
        let timeline = CompiledTimeline::from_entries(vec![entry], None);
        let mut player = AnimationPlayer::new(
            timeline,
            &FixedResolver(self.surfaces.clone()),
            self.interpolator.clone(),
        )
        .with_events(self.events.clone());
        player.play(now);
        Some(player)
    }

    fn commit(&mut self, flight: &InFlight, now: f64) {
        if let Some(index) = flight.transition {
            let actions = self.transitions[index].def.actions.clone();
            for action in &actions {
                let mut ctx = ActionContext {
                    from: &flight.from,
                    to: &flight.to,
                    event: &flight.event,
                    params: &flight.params,
                    data: &mut self.data,
                };
                invoke_guarded("action", &flight.event, || action(&mut ctx));
            }
        }

        self.previous = Some(std::mem::replace(&mut self.current, flight.to.clone()));
        self.entered_at = now;
        self.timeout = None;
        self.apply_static(&flight.to);
    }

    fn finalize(&mut self, flight: InFlight, now: f64) -> TransitionRecord {
        let record = TransitionRecord::new(flight.from, flight.to, flight.event, now);
        self.history.push(record.clone());
        self.persist();

        if let Some(callback) = self.on_change.clone() {
            invoke_guarded("on_change", &self.id, || callback(&record));
        }

        let payload = serde_json::json!({
            "machine": self.id,
            "from": record.from,
            "to": record.to,
            "event": record.event,
        });
        self.events
            .emit(MotionEvent::new(STATE_CHANGED_EVENT).with_payload(payload.clone()));
        self.events
            .emit(MotionEvent::new(format!("state:{}", record.to)).with_payload(payload));

        self.schedule_timeout();
        info!(
            machine = %self.id,
            from = %record.from,
            to = %record.to,
            event = %record.event,
            "状态转换完成"
        );
        record
    }

    /// 以进入当前状态的时间为原点安排超时
    fn schedule_timeout(&mut self) {
        let timeout = self
            .current_definition()
            .and_then(|s| s.timeout)
            .filter(|t| *t > 0.0);
        self.timeout = timeout.map(|timeout| {
            let mut clock = PlaybackClock::new(CompiledTimeline::from_entries(Vec::new(), Some(timeout)));
            clock.play(self.entered_at);
            PendingTimeout {
                state: self.current.clone(),
                clock,
            }
        });
    }

    fn apply_static(&self, state: &str) {
        let Some(def) = self.state(state) else {
            return;
        };
        for surface in &self.surfaces {
            for (key, value) in &def.styles {
                apply_value(surface.as_ref(), TrackKind::Style, key, value);
            }
            for (key, value) in &def.properties {
                apply_value(surface.as_ref(), TrackKind::Property, key, value);
            }
        }
    }

    fn persist(&self) {
        let Some((store, key)) = &self.store else {
            return;
        };
        match self.snapshot().to_json().and_then(|json| store.set(key, &json)) {
            Ok(()) => debug!(machine = %self.id, key = %key, "状态快照已保存"),
            Err(err) => warn!(machine = %self.id, key = %key, error = %err, "保存状态快照失败"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use serde_json::json;

    use super::*;
    use crate::easing::EasingFunction;
    use crate::error::StoreError;
    use crate::surface::{MemorySurface, SurfaceRegistry};

    fn toggle() -> MachineBuilder {
        StateMachine::builder("menu", "closed")
            .state(StateDefinition::new("closed").with_style("opacity", 0.0))
            .state(StateDefinition::new("open").with_style("opacity", 1.0))
            .transition(Transition::new("closed", "toggle", "open"))
            .transition(Transition::new("open", "toggle", "closed"))
    }

    fn fade(from: f64, to: f64) -> AnimationDescriptor {
        AnimationDescriptor::new(100.0)
            .style("opacity", from, to)
            .with_easing(EasingFunction::Linear)
    }

    fn with_surface(builder: MachineBuilder) -> (StateMachine, Rc<MemorySurface>) {
        let surface = MemorySurface::new();
        let mut registry = SurfaceRegistry::new();
        registry.register("#menu", surface.clone());
        let machine = builder
            .with_target("#menu")
            .build(&AnimationLibrary::new(), &registry)
            .unwrap();
        (machine, surface)
    }

    #[test]
    fn test_send_completes_without_animations() {
        let mut machine = toggle().build(&AnimationLibrary::new(), &SurfaceRegistry::new()).unwrap();
        let bus = machine.events().clone();
        let heard = Rc::new(RefCell::new(Vec::new()));
        let h = heard.clone();
        bus.on_any(move |e| {
            h.borrow_mut().push(e.name.clone());
            Ok(())
        });

        let outcome = machine.send("toggle", json!(null), 10.0).unwrap();
        assert!(outcome.is_completed());
        assert_eq!(machine.current(), "open");
        assert_eq!(machine.previous(), Some("closed"));
        assert_eq!(
            machine.history().last(),
            Some(&TransitionRecord::new("closed", "open", "toggle", 10.0))
        );
        assert_eq!(*heard.borrow(), vec!["toggle", "state-changed", "state:open"]);
    }

    #[test]
    fn test_missing_transition_still_dispatches() {
        let mut machine = toggle().build(&AnimationLibrary::new(), &SurfaceRegistry::new()).unwrap();
        let heard = Rc::new(Cell::new(0));
        let h = heard.clone();
        machine.events().on("unknown", move |_| {
            h.set(h.get() + 1);
            Ok(())
        });

        let err = machine.send("unknown", json!(null), 0.0).unwrap_err();
        assert!(matches!(err, SendError::NoTransition { .. }));
        assert_eq!(heard.get(), 1);
        assert_eq!(machine.current(), "closed");
        assert!(machine.history().is_empty());
    }

    #[test]
    fn test_condition_and_guard() {
        let mut machine = StateMachine::builder("door", "locked")
            .state(StateDefinition::new("locked"))
            .state(StateDefinition::new("open"))
            .transition(
                Transition::new("locked", "unlock", "open")
                    .when(|ctx| ctx.params["key"] == "right")
                    .guarded_by(|ctx| ctx.data.get("jammed").is_none()),
            )
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();

        let err = machine.send("unlock", json!({"key": "wrong"}), 0.0).unwrap_err();
        assert_eq!(
            err,
            SendError::Rejected {
                event: "unlock".to_string(),
                reason: RejectReason::Condition
            }
        );

        machine.set_data("jammed", json!(true));
        let err = machine.send("unlock", json!({"key": "right"}), 0.0).unwrap_err();
        assert!(matches!(err, SendError::Rejected { reason: RejectReason::Guard, .. }));
        assert_eq!(machine.current(), "locked");

        machine.data.remove("jammed");
        assert!(machine.send("unlock", json!({"key": "right"}), 0.0).is_ok());
        assert_eq!(machine.current(), "open");
    }

    #[test]
    fn test_panicking_guard_rejects() {
        let mut machine = StateMachine::builder("m", "a")
            .state(StateDefinition::new("a"))
            .state(StateDefinition::new("b"))
            .transition(Transition::new("a", "go", "b").guarded_by(|_| panic!("guard panic")))
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();
        assert!(matches!(
            machine.send("go", json!(null), 0.0),
            Err(SendError::Rejected { reason: RejectReason::Guard, .. })
        ));
        assert_eq!(machine.current(), "a");
    }

    #[test]
    fn test_wildcard_and_exact_priority() {
        let mut machine = StateMachine::builder("m", "a")
            .state(StateDefinition::new("a"))
            .state(StateDefinition::new("b"))
            .state(StateDefinition::new("reset"))
            .transition(Transition::new("*", "go", "reset"))
            .transition(Transition::new("a", "go", "b"))
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();

        assert_eq!(machine.available_events(), vec!["go"]);
        machine.send("go", json!(null), 0.0).unwrap();
        assert_eq!(machine.current(), "b");
        machine.send("go", json!(null), 1.0).unwrap();
        assert_eq!(machine.current(), "reset");
    }

    #[test]
    fn test_second_send_while_animating_is_busy() {
        let (mut machine, surface) = with_surface(
            StateMachine::builder("menu", "closed")
                .state(StateDefinition::new("closed").on_exit(fade(1.0, 0.0)))
                .state(StateDefinition::new("open"))
                .state(StateDefinition::new("hidden"))
                .transition(Transition::new("closed", "toggle", "open"))
                .transition(Transition::new("closed", "hide", "hidden")),
        );

        let first = machine.send("toggle", json!(null), 0.0).unwrap();
        assert_eq!(
            first,
            SendOutcome::InProgress {
                from: "closed".to_string(),
                to: "open".to_string()
            }
        );
        assert_eq!(machine.phase(), Some(TransitionPhase::Exit));

        let second = machine.send("hide", json!(null), 10.0).unwrap_err();
        assert!(matches!(second, SendError::Busy { .. }));
        assert!(!machine.can("hide"));

        machine.tick(50.0);
        assert_eq!(surface.style("opacity"), Some(Value::Number(0.5)));
        assert_eq!(machine.current(), "closed");

        let done = machine.tick(100.0);
        assert_eq!(done.len(), 1);
        assert_eq!(machine.current(), "open");
        assert_eq!(machine.history().len(), 1);
        assert_eq!(machine.history().records()[0].event, "toggle");
        assert!(!machine.is_transitioning());
    }

    #[test]
    fn test_interruptible_transition_completes_first() {
        let (mut machine, surface) = with_surface(
            StateMachine::builder("menu", "closed")
                .state(StateDefinition::new("closed"))
                .state(StateDefinition::new("open"))
                .transition(
                    Transition::new("closed", "toggle", "open")
                        .with_animation(fade(0.0, 1.0))
                        .interruptible(),
                )
                .transition(Transition::new("open", "toggle", "closed")),
        );

        assert!(!machine.send("toggle", json!(null), 0.0).unwrap().is_completed());
        let outcome = machine.send("toggle", json!(null), 30.0).unwrap();
        assert!(outcome.is_completed());
        assert_eq!(surface.style("opacity"), Some(Value::Number(1.0)));
        assert_eq!(machine.current(), "closed");
        assert_eq!(machine.history().len(), 2);
    }

    #[test]
    fn test_static_snapshot_applied() {
        let (mut machine, surface) = with_surface(toggle());
        assert_eq!(surface.style("opacity"), Some(Value::Number(0.0)));
        machine.send("toggle", json!(null), 0.0).unwrap();
        assert_eq!(surface.style("opacity"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_actions_and_callbacks_are_isolated() {
        let changes = Rc::new(Cell::new(0));
        let c = changes.clone();
        let mut machine = StateMachine::builder("counter", "idle")
            .state(StateDefinition::new("idle"))
            .state(StateDefinition::new("busy"))
            .transition(
                Transition::new("idle", "start", "busy")
                    .then(|ctx| {
                        ctx.data.insert("started".to_string(), ctx.params["at"].clone());
                        Ok(())
                    })
                    .then(|_| Err("second action fails".to_string()))
                    .then(|ctx| {
                        ctx.data.insert("third".to_string(), json!(true));
                        Ok(())
                    }),
            )
            .transition(Transition::new("busy", "stop", "idle"))
            .on_change(move |_| {
                c.set(c.get() + 1);
                panic!("callback panic")
            })
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();

        machine.send("start", json!({"at": 5}), 0.0).unwrap();
        assert_eq!(machine.data().get("started"), Some(&json!(5)));
        assert_eq!(machine.data().get("third"), Some(&json!(true)));
        assert_eq!(machine.current(), "busy");

        machine.send("stop", json!(null), 1.0).unwrap();
        assert_eq!(changes.get(), 2);
        assert_eq!(machine.current(), "idle");
    }

    #[test]
    fn test_timeout_fires_only_in_same_state() {
        let mut machine = StateMachine::builder("toast", "hidden")
            .state(StateDefinition::new("hidden"))
            .state(StateDefinition::new("visible").with_timeout(500.0))
            .transition(Transition::new("hidden", "show", "visible"))
            .transition(Transition::new("visible", "timeout", "hidden"))
            .transition(Transition::new("visible", "dismiss", "hidden"))
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();

        machine.send("show", json!(null), 0.0).unwrap();
        assert!(machine.tick(400.0).is_empty());
        let fired = machine.tick(500.0);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event, "timeout");
        assert_eq!(machine.current(), "hidden");

        // 提前离开状态后超时不再触发
        machine.send("show", json!(null), 1000.0).unwrap();
        machine.send("dismiss", json!(null), 1100.0).unwrap();
        assert!(machine.tick(2000.0).is_empty());
        assert_eq!(machine.history().len(), 4);
    }

    #[test]
    fn test_initial_state_timeout() {
        let mut machine = StateMachine::builder("splash", "shown")
            .state(StateDefinition::new("shown").with_timeout(100.0))
            .state(StateDefinition::new("gone"))
            .transition(Transition::new("shown", "timeout", "gone"))
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();

        assert!(machine.tick(50.0).is_empty());
        assert!(machine.tick(120.0).is_empty());
        assert_eq!(machine.tick(150.0).len(), 1);
        assert_eq!(machine.current(), "gone");
    }

    #[test]
    fn test_terminal_state_rejects() {
        let mut machine = StateMachine::builder("m", "a")
            .state(StateDefinition::new("a"))
            .state(StateDefinition::new("done").terminal())
            .transition(Transition::new("*", "go", "done"))
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();
        machine.send("go", json!(null), 0.0).unwrap();
        assert!(matches!(
            machine.send("go", json!(null), 1.0),
            Err(SendError::Terminal { .. })
        ));
        assert!(!machine.can("go"));
    }

    #[test]
    fn test_transition_to() {
        let mut machine = toggle().build(&AnimationLibrary::new(), &SurfaceRegistry::new()).unwrap();
        let outcome = machine.transition_to("open", 5.0).unwrap();
        assert!(outcome.is_completed());
        assert_eq!(machine.current(), "open");
        assert_eq!(machine.history().last().unwrap().event, DIRECT_EVENT);
        assert!(matches!(
            machine.transition_to("nowhere", 6.0),
            Err(SendError::UnknownState { .. })
        ));
    }

    #[test]
    fn test_build_errors() {
        let library = AnimationLibrary::new();
        let registry = SurfaceRegistry::new();

        let err = toggle()
            .state(StateDefinition::new("open"))
            .build(&library, &registry)
            .unwrap_err();
        assert_eq!(err, MachineError::DuplicateState { id: "open".to_string() });

        let err = StateMachine::builder("m", "missing")
            .state(StateDefinition::new("a"))
            .build(&library, &registry)
            .unwrap_err();
        assert_eq!(err, MachineError::InvalidInitialState { id: "missing".to_string() });

        let err = toggle()
            .transition(Transition::new("open", "explode", "nowhere"))
            .build(&library, &registry)
            .unwrap_err();
        assert!(matches!(err, MachineError::UnknownState { .. }));

        let err = StateMachine::builder("m", "a")
            .state(StateDefinition::new("a").on_enter("pop"))
            .build(&library, &registry)
            .unwrap_err();
        assert_eq!(err, MachineError::UnknownAnimation { name: "pop".to_string() });
    }

    #[test]
    fn test_named_animation_resolved_from_library() {
        let library = AnimationLibrary::new().with("fade-in", fade(0.0, 1.0));
        let surface = MemorySurface::new();
        let mut registry = SurfaceRegistry::new();
        registry.register("#menu", surface.clone());
        let mut machine = toggle()
            .transition(Transition::new("closed", "show", "open").with_animation("fade-in"))
            .with_target("#menu")
            .build(&library, &registry)
            .unwrap();

        machine.send("show", json!(null), 0.0).unwrap();
        machine.tick(25.0);
        assert_eq!(surface.style("opacity"), Some(Value::Number(0.25)));
        machine.tick(100.0);
        assert_eq!(machine.current(), "open");
    }

    #[test]
    fn test_persist_restore_round_trip() {
        let store = Rc::new(MemoryStore::new());
        let mut machine = toggle()
            .with_store(store.clone(), "menu-state")
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();
        machine.set_data("count", json!(3));
        machine.set_data("ratio", json!(0.1));
        machine.send("toggle", json!(null), 120.25).unwrap();
        machine.send("toggle", json!(null), 250.5).unwrap();
        machine.send("toggle", json!(null), 300.0).unwrap();
        let saved = machine.snapshot();

        let mut restored = toggle()
            .with_store(store.clone(), "menu-state")
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();
        assert!(restored.restore());
        assert_eq!(restored.current(), "open");
        assert_eq!(restored.previous(), Some("closed"));
        assert_eq!(restored.history().records(), machine.history().records());
        assert_eq!(restored.data(), machine.data());
        assert_eq!(restored.snapshot(), saved);
    }

    #[test]
    fn test_restore_ignores_unknown_state() {
        let store = Rc::new(MemoryStore::new());
        let snapshot = MachineSnapshot {
            version: SnapshotVersion::current(),
            current_state: "deleted".to_string(),
            previous_state: None,
            history: Vec::new(),
            data: MachineData::new(),
        };
        store.set("k", &snapshot.to_json().unwrap()).unwrap();

        let mut machine = toggle()
            .with_store(store, "k")
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();
        assert!(!machine.restore());
        assert_eq!(machine.current(), "closed");
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Io("disk gone".to_string()))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Io("disk gone".to_string()))
        }

        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_store_failures_are_not_propagated() {
        let mut machine = toggle()
            .with_store(Rc::new(FailingStore), "k")
            .build(&AnimationLibrary::new(), &SurfaceRegistry::new())
            .unwrap();
        assert!(machine.send("toggle", json!(null), 0.0).is_ok());
        assert!(!machine.restore());
        assert_eq!(machine.current(), "open");
    }
}
