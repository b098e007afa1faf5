//! # Event 模块
//!
//! 事件总线与函数注册表。
//!
//! 两者都是可克隆的句柄（内部 `Rc<RefCell<..>>`），同一个上下文中的执行器、
//! 播放器、状态机与同步组共享同一份注册表。
//!
//! 用户回调返回 `Err` 或发生 panic 时只记录日志，不会中断其余监听器的派发，
//! 也不会破坏总线状态。派发过程中再次 `emit` 的事件会排队，在当前派发结束后依次处理。

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

/// 用户回调的返回值
pub type HandlerResult = Result<(), String>;

/// 事件监听器
pub type Listener = Rc<dyn Fn(&MotionEvent) -> HandlerResult>;

/// 注册函数（`CALL` 命令、回调阶段、`ON` 绑定）
pub type Function = Rc<dyn Fn(&serde_json::Value) -> HandlerResult>;

/// 事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionEvent {
    /// 事件名
    pub name: String,
    /// 载荷
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MotionEvent {
    /// 创建无载荷事件
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// 设置载荷
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// 监听器 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    /// `None` 表示监听全部事件
    filter: Option<String>,
    listener: Listener,
}

impl Registration {
    fn matches(&self, name: &str) -> bool {
        self.filter.as_deref().is_none_or(|f| f == name)
    }
}

#[derive(Default)]
struct BusInner {
    listeners: Vec<Registration>,
    next_id: u64,
    dispatching: bool,
    queue: VecDeque<MotionEvent>,
}

/// 事件总线
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<BusInner>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("EventBus")
            .field("listeners", &inner.listeners.len())
            .field("queued", &inner.queue.len())
            .finish()
    }
}

impl EventBus {
    /// 创建空总线
    pub fn new() -> Self {
        Self::default()
    }

    /// 监听指定事件
    pub fn on(
        &self,
        name: impl Into<String>,
        listener: impl Fn(&MotionEvent) -> HandlerResult + 'static,
    ) -> ListenerId {
        self.register(Some(name.into()), Rc::new(listener))
    }

    /// 监听全部事件
    pub fn on_any(&self, listener: impl Fn(&MotionEvent) -> HandlerResult + 'static) -> ListenerId {
        self.register(None, Rc::new(listener))
    }

    /// 移除监听器
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.listeners.len();
        inner.listeners.retain(|r| r.id != id);
        inner.listeners.len() != before
    }

    /// 移除全部监听器
    pub fn clear(&self) {
        self.inner.borrow_mut().listeners.clear();
    }

    /// 监听器数量
    pub fn listener_count(&self) -> usize {
        self.inner.borrow().listeners.len()
    }

    /// 派发事件，返回成功处理的监听器数量
    ///
    /// 在派发过程中调用时事件进入队列，返回 0。
    pub fn emit(&self, event: MotionEvent) -> usize {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.dispatching {
                inner.queue.push_back(event);
                return 0;
            }
            inner.dispatching = true;
        }

        let delivered = self.dispatch(&event);
        loop {
            let next = self.inner.borrow_mut().queue.pop_front();
            match next {
                Some(queued) => {
                    self.dispatch(&queued);
                }
                None => break,
            }
        }

        self.inner.borrow_mut().dispatching = false;
        delivered
    }

    /// 派发无载荷事件
    pub fn emit_named(&self, name: impl Into<String>) -> usize {
        self.emit(MotionEvent::new(name))
    }

    fn register(&self, filter: Option<String>, listener: Listener) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.listeners.push(Registration {
            id,
            filter,
            listener,
        });
        id
    }

    fn dispatch(&self, event: &MotionEvent) -> usize {
        // 先复制出监听器列表，回调中可以自由注册/移除
        let listeners: Vec<Listener> = self
            .inner
            .borrow()
            .listeners
            .iter()
            .filter(|r| r.matches(&event.name))
            .map(|r| r.listener.clone())
            .collect();

        trace!(event = %event.name, listeners = listeners.len(), "派发事件");
        listeners
            .iter()
            .filter(|listener| invoke_guarded("listener", &event.name, || listener(event)))
            .count()
    }
}

/// 函数注册表
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Rc<RefCell<HashMap<String, Function>>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let functions = self.functions.borrow();
        let mut names: Vec<&String> = functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("names", &names).finish()
    }
}

impl FunctionRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册函数（同名覆盖）
    pub fn register(
        &self,
        name: impl Into<String>,
        function: impl Fn(&serde_json::Value) -> HandlerResult + 'static,
    ) {
        self.functions
            .borrow_mut()
            .insert(name.into(), Rc::new(function));
    }

    /// 注销函数
    pub fn unregister(&self, name: &str) -> bool {
        self.functions.borrow_mut().remove(name).is_some()
    }

    /// 是否已注册
    pub fn contains(&self, name: &str) -> bool {
        self.functions.borrow().contains_key(name)
    }

    /// 获取函数
    pub fn get(&self, name: &str) -> Option<Function> {
        self.functions.borrow().get(name).cloned()
    }

    /// 调用函数；未注册、返回错误或 panic 时返回 `false`
    pub fn call(&self, name: &str, args: &serde_json::Value) -> bool {
        let Some(function) = self.get(name) else {
            warn!(function = name, "函数未注册，已跳过");
            return false;
        };
        invoke_guarded("function", name, || function(args))
    }
}

/// 调用用户回调，捕获错误与 panic 并记录日志
pub(crate) fn invoke_guarded(kind: &str, name: &str, f: impl FnOnce() -> HandlerResult) -> bool {
    match call_guarded(kind, name, f) {
        Some(Ok(())) => true,
        Some(Err(message)) => {
            warn!(kind, name, error = %message, "回调返回错误");
            false
        }
        None => false,
    }
}

/// 调用用户代码，panic 时记录日志并返回 `None`
pub(crate) fn call_guarded<T>(kind: &str, name: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            error!(kind, name, panic = %panic_message(payload.as_ref()), "回调发生 panic");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
