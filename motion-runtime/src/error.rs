//! # Error 模块
//!
//! 定义 motion-runtime 中使用的错误类型。
//!
//! 构建期错误（循环依赖、无效初始状态、空同步组等）是致命的，直接返回给调用方；
//! 运行期的可恢复情况（无匹配转换、守卫拒绝、目标未解析）只记录日志或返回
//! 对应的 `Err`，不会破坏已有状态。

use thiserror::Error;

/// 依赖图错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// 重复的节点 ID
    #[error("重复的 ID '{id}'")]
    DuplicateId { id: String },

    /// 依赖了未声明的节点
    #[error("'{id}' 依赖了未声明的 '{dependency}'")]
    UnknownDependency { id: String, dependency: String },

    /// 循环依赖
    #[error("检测到循环依赖 (circular dependency)：'{id}'，路径 {}", .cycle.join(" -> "))]
    CircularDependency { id: String, cycle: Vec<String> },
}

/// 命令解析错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// 依赖图错误
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// 缺少必需参数
    #[error("命令 '{id}' ({kind}) 缺少参数 '{param}'")]
    MissingParameter {
        id: String,
        kind: String,
        param: String,
    },

    /// 参数值无效
    #[error("命令 '{id}' 的参数 '{param}' 无效 - {message}")]
    InvalidParameter {
        id: String,
        param: String,
        message: String,
    },

    /// 控制块不配对（IF/END_IF、FOR_EACH/END_FOR_EACH）
    #[error("命令 '{id}'：控制块不匹配 - {message}")]
    UnbalancedBlock { id: String, message: String },

    /// SEQUENCE/PARALLEL 引用了不存在的子命令
    #[error("命令 '{id}' 引用了未声明的子命令 '{step}'")]
    UnknownStep { id: String, step: String },

    /// 动画名称未注册
    #[error("命令 '{id}' 引用了未注册的动画 '{name}'")]
    UnknownAnimation { id: String, name: String },
}

/// 时间轴编译错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimelineError {
    /// 阶段依赖图错误
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// 阶段引用的动画名称未注册
    #[error("阶段 '{stage}' 引用了未注册的动画 '{name}'")]
    UnknownAnimation { stage: String, name: String },
}

/// 状态机构建错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MachineError {
    /// 初始状态不存在
    #[error("初始状态 '{id}' 不存在")]
    InvalidInitialState { id: String },

    /// 转换引用了不存在的状态
    #[error("转换 '{event}' 引用了不存在的状态 '{id}'")]
    UnknownState { id: String, event: String },

    /// 重复的状态 ID
    #[error("重复的状态 ID '{id}'")]
    DuplicateState { id: String },

    /// 动画名称未注册
    #[error("状态机引用了未注册的动画 '{name}'")]
    UnknownAnimation { name: String },
}

/// 守卫拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// condition 未通过
    Condition,
    /// guard 未通过
    Guard,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Condition => write!(f, "condition"),
            RejectReason::Guard => write!(f, "guard"),
        }
    }
}

/// `send()` 失败原因
///
/// 这些都是可恢复的：状态机保持原状态不变。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SendError {
    /// 已有转换正在进行（不可重入）
    #[error("状态机正在转换中，拒绝事件 '{event}'")]
    Busy { event: String },

    /// 当前状态没有匹配的转换
    #[error("状态 '{state}' 没有匹配事件 '{event}' 的转换")]
    NoTransition { state: String, event: String },

    /// condition 或 guard 未通过
    #[error("事件 '{event}' 被 {reason} 拒绝")]
    Rejected { event: String, reason: RejectReason },

    /// 当前处于终止状态
    #[error("状态 '{state}' 为终止状态，拒绝事件 '{event}'")]
    Terminal { state: String, event: String },

    /// 目标状态不存在（`transition_to`）
    #[error("目标状态 '{state}' 不存在")]
    UnknownState { state: String },
}

/// 同步组错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GroupError {
    /// 初始化时没有任何动画
    #[error("同步组 '{id}' 没有任何动画")]
    EmptyGroup { id: String },

    /// 初始化之后修改结构
    #[error("同步组 '{id}' 已离开初始化阶段（当前 {state}），不允许修改结构")]
    Locked { id: String, state: String },

    /// 未初始化就播放
    #[error("同步组 '{id}' 尚未初始化（当前 {state}）")]
    NotReady { id: String, state: String },

    /// 重复的动画 ID
    #[error("同步组 '{group}' 中重复的动画 ID '{id}'")]
    DuplicateAnimation { group: String, id: String },
}

/// 持久化存储错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// 文件操作失败
    #[error("文件操作失败: {0}")]
    Io(String),

    /// 序列化失败
    #[error("序列化失败: {0}")]
    Serialization(String),

    /// 反序列化失败
    #[error("反序列化失败: {0}")]
    Deserialization(String),
}

/// 配置加载错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// 文件读取失败
    #[error("无法读取配置文件 '{path}': {message}")]
    Io { path: String, message: String },

    /// 解析失败
    #[error("配置文件 '{path}' 解析失败: {message}")]
    Parse { path: String, message: String },

    /// 字段取值无效
    #[error("配置项 '{field}' 无效: {message}")]
    Invalid { field: String, message: String },
}

/// motion-runtime 统一错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MotionError {
    /// 依赖图错误
    #[error("依赖图错误: {0}")]
    Graph(#[from] GraphError),

    /// 命令错误
    #[error("命令错误: {0}")]
    Command(#[from] CommandError),

    /// 时间轴错误
    #[error("时间轴错误: {0}")]
    Timeline(#[from] TimelineError),

    /// 状态机错误
    #[error("状态机错误: {0}")]
    Machine(#[from] MachineError),

    /// 事件被拒绝
    #[error("事件被拒绝: {0}")]
    Send(#[from] SendError),

    /// 同步组错误
    #[error("同步组错误: {0}")]
    Group(#[from] GroupError),

    /// 存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
}

/// Result 类型别名
pub type MotionResult<T> = Result<T, MotionError>;
