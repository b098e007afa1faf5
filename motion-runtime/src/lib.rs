//! # Motion Runtime
//!
//! 动画编排引擎的核心运行时库。
//!
//! ## 架构概述
//!
//! `motion-runtime` 决定视觉变化 **何时** 以及 **以何种顺序** 发生，
//! 不负责绘制，也不负责把目标引用解析为真实句柄。
//! 宿主通过能力接口（[`TargetResolver`]、[`Surface`]、[`MotionPreference`]）
//! 接入，并以单调递增的时间戳驱动 `tick`：
//!
//! ```text
//! Host                               Runtime
//!   │                                   │
//!   │──── tick(now) ──────────────────►│
//!   │                                   │ 推进时钟、执行命令、插值
//!   │◄─── Surface::apply_style ────────│
//!   │◄─── TickReport / 事件总线 ────────│
//!   │                                   │
//! ```
//!
//! 所有时间单位均为毫秒（`f64`），全部逻辑运行在单线程上。
//!
//! ## 核心类型
//!
//! - [`Orchestrator`]：显式构造的编排上下文
//! - [`Command`] / [`CommandPlan`] / [`PlanExecutor`]：依赖感知的命令调度
//! - [`TimelineCompiler`] / [`CompiledTimeline`]：时间轴编译
//! - [`PlaybackClock`] / [`AnimationPlayer`]：协作式播放
//! - [`StateMachine`]：带转换动画的有限状态机
//! - [`SyncGroup`]：多动画同步
//! - [`Interpolator`]：数值、颜色、复合值插值
//!
//! ## 使用示例
//!
//! ```ignore
//! use motion_runtime::{Command, MotionConfig, Orchestrator};
//!
//! let mut motion = Orchestrator::new(resolver)
//!     .with_config(MotionConfig::load("motion.json"))
//!     .with_library(library);
//!
//! motion.create_sequence("intro", vec![
//!     Command::animate("title", "#title", "fade-in"),
//!     Command::animate("body", "#body", "slide-up").after("title"),
//! ])?;
//! motion.play_sequence("intro", now);
//!
//! // 主循环
//! loop {
//!     let report = motion.tick(now);
//!     for (id, event) in report.sequences {
//!         // 宿主处理完成通知...
//!     }
//! }
//! ```
//!
//! ## 模块结构
//!
//! - [`easing`]：缓动函数
//! - [`interpolation`]：插值引擎
//! - [`graph`]：依赖解析
//! - [`command`] / [`executor`]：命令与执行器
//! - [`stagger`]：错开分配
//! - [`timeline`]：时间轴编译
//! - [`clock`] / [`player`]：播放时钟与播放器
//! - [`machine`]：状态机
//! - [`sync`]：同步协调
//! - [`surface`]：宿主能力接口
//! - [`event`]：事件总线与函数注册表
//! - [`orchestrator`]：编排上下文
//! - [`config`]：运行时配置
//! - [`error`]：错误类型定义

pub mod animation;
pub mod clock;
pub mod command;
pub mod config;
pub mod easing;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod interpolation;
pub mod machine;
pub mod orchestrator;
pub mod player;
pub mod stagger;
pub mod surface;
pub mod sync;
pub mod timeline;

// 重导出核心类型
pub use animation::{AnimationDescriptor, AnimationLibrary, AnimationRef, Track};
pub use clock::{ClockEvent, ClockState, CompletionToken, PlaybackClock, Repeat, StageState};
pub use command::{Command, CommandKind, CommandPlan, Comparison, Condition, Instruction};
pub use config::MotionConfig;
pub use easing::{Easing, EasingDescriptor, EasingFunction};
pub use error::{
    CommandError, ConfigError, GraphError, GroupError, MachineError, MotionError, MotionResult,
    SendError, StoreError, TimelineError,
};
pub use event::{EventBus, FunctionRegistry, HandlerResult, ListenerId, MotionEvent};
pub use executor::{ExecutionContext, ExecutionEvent, ExecutorState, PlanExecutor};
pub use graph::{DependencyNode, ExecutionPlan, resolve};
pub use interpolation::{BlendMode, InterpolationConfig, Interpolator, PropertyType, Value};
pub use machine::{
    FileStore, KeyValueStore, MachineBuilder, MachineSnapshot, MemoryStore, SendOutcome,
    StateDefinition, StateMachine, Transition, TransitionRecord,
};
pub use orchestrator::{Orchestrator, TickReport};
pub use player::AnimationPlayer;
pub use stagger::{StaggerConfig, StaggerPlan, StaggerTarget, distribute};
pub use surface::{
    MemorySurface, MotionPreference, NoPreference, StaticPreference, Surface, SurfaceHandle,
    SurfaceRegistry, TargetRef, TargetResolver,
};
pub use sync::{GroupState, SyncEvent, SyncGroup, SyncStrategy, SyncedAnimation};
pub use timeline::{CompiledTimeline, Placement, Stage, TimelineCompiler, TimelineEntry};
