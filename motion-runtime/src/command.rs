//! # Command 模块
//!
//! 声明式命令与命令计划。
//!
//! ## 设计原则
//!
//! - **声明式**：[`Command`] 只描述"做什么"，参数放在 JSON 参数包里
//! - **一次解析**：构建 [`CommandPlan`] 时把参数包解析为类型化的 [`Instruction`]，
//!   动画引用同时经动画库解析，执行期不再做类型判断
//! - **容错**：未知类型只记录警告并跳过，不会中断整个计划
//!
//! ## 命令词汇
//!
//! | 类型 | 参数 |
//! |---|---|
//! | `ANIMATE` | `target`, `animation`, `repeat?`, `alternate?` |
//! | `STAGGER` | `targets`, `animation`, `stagger?`（数字或错开配置） |
//! | `WAIT` | `duration` |
//! | `SEQUENCE` / `PARALLEL` | `steps` |
//! | `IF` / `ELSE_IF` | `variable`, `op?`, `value?` |
//! | `ELSE` / `END_IF` / `END_FOR_EACH` | 无 |
//! | `FOR_EACH` | `items`（列表或 `"$变量"`）, `as?`, `index?` |
//! | `CALL` | `function`, `args?` |
//! | `SET` | `variable`, `value?` |
//! | `ON` | `event`, `function` |
//! | `EMIT` | `event`, `payload?` |
//!
//! 字符串参数写成 `"$name"` 时在执行期替换为变量 `name` 的值。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::animation::{AnimationDescriptor, AnimationLibrary, AnimationRef};
use crate::error::CommandError;
use crate::graph::{self, DependencyNode, ExecutionPlan};
use crate::stagger::StaggerConfig;

/// 命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// 对单个目标播放动画
    Animate,
    /// 对一组目标错开播放动画
    Stagger,
    /// 等待一段时间
    Wait,
    /// 依次执行子命令
    Sequence,
    /// 同时执行子命令
    Parallel,
    /// 条件块开始
    If,
    /// 条件分支
    ElseIf,
    /// 默认分支
    Else,
    /// 条件块结束
    EndIf,
    /// 循环开始
    ForEach,
    /// 循环结束
    EndForEach,
    /// 调用注册函数
    Call,
    /// 设置变量
    Set,
    /// 把事件绑定到函数
    On,
    /// 派发事件
    Emit,
}

impl CommandKind {
    /// 类型标签
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Animate => "ANIMATE",
            CommandKind::Stagger => "STAGGER",
            CommandKind::Wait => "WAIT",
            CommandKind::Sequence => "SEQUENCE",
            CommandKind::Parallel => "PARALLEL",
            CommandKind::If => "IF",
            CommandKind::ElseIf => "ELSE_IF",
            CommandKind::Else => "ELSE",
            CommandKind::EndIf => "END_IF",
            CommandKind::ForEach => "FOR_EACH",
            CommandKind::EndForEach => "END_FOR_EACH",
            CommandKind::Call => "CALL",
            CommandKind::Set => "SET",
            CommandKind::On => "ON",
            CommandKind::Emit => "EMIT",
        }
    }

    /// 是否为控制块命令
    pub fn is_block(&self) -> bool {
        matches!(
            self,
            CommandKind::If
                | CommandKind::ElseIf
                | CommandKind::Else
                | CommandKind::EndIf
                | CommandKind::ForEach
                | CommandKind::EndForEach
        )
    }
}

impl FromStr for CommandKind {
    type Err = ();

    /// 大小写不敏感，`-` 与 `_` 等价
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "ANIMATE" => Ok(CommandKind::Animate),
            "STAGGER" => Ok(CommandKind::Stagger),
            "WAIT" => Ok(CommandKind::Wait),
            "SEQUENCE" => Ok(CommandKind::Sequence),
            "PARALLEL" => Ok(CommandKind::Parallel),
            "IF" => Ok(CommandKind::If),
            "ELSE_IF" | "ELSEIF" => Ok(CommandKind::ElseIf),
            "ELSE" => Ok(CommandKind::Else),
            "END_IF" | "ENDIF" => Ok(CommandKind::EndIf),
            "FOR_EACH" | "FOREACH" => Ok(CommandKind::ForEach),
            "END_FOR_EACH" | "ENDFOREACH" => Ok(CommandKind::EndForEach),
            "CALL" => Ok(CommandKind::Call),
            "SET" => Ok(CommandKind::Set),
            "ON" => Ok(CommandKind::On),
            "EMIT" => Ok(CommandKind::Emit),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 声明式命令
///
/// ```json
/// { "id": "fade", "type": "ANIMATE", "params": { "target": "#card", "animation": "fade-in" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// 唯一 ID
    pub id: String,
    /// 类型标签（保留原文，未知类型在构建计划时跳过）
    #[serde(rename = "type")]
    pub kind: String,
    /// 参数包
    #[serde(default)]
    pub params: Map<String, JsonValue>,
    /// 开始前的延迟（毫秒）
    #[serde(default)]
    pub delay: f64,
    /// 依赖的命令 ID
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 标签
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

impl Command {
    /// 创建命令
    pub fn new(id: impl Into<String>, kind: CommandKind) -> Self {
        Self::with_tag(id, kind.as_str())
    }

    /// 以任意类型标签创建命令
    pub fn with_tag(id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: tag.into(),
            params: Map::new(),
            delay: 0.0,
            dependencies: Vec::new(),
            labels: BTreeSet::new(),
        }
    }

    /// `ANIMATE`
    pub fn animate(id: impl Into<String>, target: impl Into<String>, animation: impl Into<AnimationRef>) -> Self {
        let animation = serde_json::to_value(animation.into()).unwrap_or(JsonValue::Null);
        Self::new(id, CommandKind::Animate)
            .with_param("target", target.into())
            .with_param("animation", animation)
    }

    /// `WAIT`
    pub fn wait(id: impl Into<String>, duration: f64) -> Self {
        Self::new(id, CommandKind::Wait).with_param("duration", duration)
    }

    /// `CALL`
    pub fn call(id: impl Into<String>, function: impl Into<String>) -> Self {
        Self::new(id, CommandKind::Call).with_param("function", function.into())
    }

    /// `SET`
    pub fn set(id: impl Into<String>, variable: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::new(id, CommandKind::Set)
            .with_param("variable", variable.into())
            .with_param("value", value)
    }

    /// `EMIT`
    pub fn emit(id: impl Into<String>, event: impl Into<String>) -> Self {
        Self::new(id, CommandKind::Emit).with_param("event", event.into())
    }

    /// `SEQUENCE`
    pub fn sequence<S: Into<String>>(id: impl Into<String>, steps: impl IntoIterator<Item = S>) -> Self {
        let steps: Vec<JsonValue> = steps.into_iter().map(|s| JsonValue::String(s.into())).collect();
        Self::new(id, CommandKind::Sequence).with_param("steps", steps)
    }

    /// `PARALLEL`
    pub fn parallel<S: Into<String>>(id: impl Into<String>, steps: impl IntoIterator<Item = S>) -> Self {
        let steps: Vec<JsonValue> = steps.into_iter().map(|s| JsonValue::String(s.into())).collect();
        Self::new(id, CommandKind::Parallel).with_param("steps", steps)
    }

    /// 设置参数
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// 设置延迟
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// 添加依赖
    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// 添加标签
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// 已识别的类型
    pub fn command_kind(&self) -> Option<CommandKind> {
        CommandKind::from_str(&self.kind).ok()
    }

    /// 获取参数
    pub fn param(&self, key: &str) -> Option<&JsonValue> {
        self.params.get(key).filter(|v| !v.is_null())
    }

    fn require(&self, key: &str) -> Result<&JsonValue, CommandError> {
        self.param(key).ok_or_else(|| CommandError::MissingParameter {
            id: self.id.clone(),
            kind: self.kind.clone(),
            param: key.to_string(),
        })
    }

    fn invalid(&self, key: &str, message: impl Into<String>) -> CommandError {
        CommandError::InvalidParameter {
            id: self.id.clone(),
            param: key.to_string(),
            message: message.into(),
        }
    }

    /// 必需的字符串参数
    pub fn require_str(&self, key: &str) -> Result<&str, CommandError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| self.invalid(key, "应为字符串"))
    }

    /// 必需的非负数字参数
    pub fn require_f64(&self, key: &str) -> Result<f64, CommandError> {
        match self.require(key)?.as_f64() {
            Some(n) if n.is_finite() && n >= 0.0 => Ok(n),
            _ => Err(self.invalid(key, "应为非负数字")),
        }
    }

    /// 可选的字符串参数
    pub fn optional_str(&self, key: &str) -> Result<Option<&str>, CommandError> {
        match self.param(key) {
            None => Ok(None),
            Some(v) => v.as_str().map(Some).ok_or_else(|| self.invalid(key, "应为字符串")),
        }
    }

    /// 可选参数原值（缺省为 `null`）
    pub fn optional_value(&self, key: &str) -> JsonValue {
        self.param(key).cloned().unwrap_or(JsonValue::Null)
    }
}

impl DependencyNode for Command {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

/// 比较运算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    /// 等于
    #[default]
    Eq,
    /// 不等于
    Ne,
    /// 大于
    Gt,
    /// 大于等于
    Ge,
    /// 小于
    Lt,
    /// 小于等于
    Le,
    /// 真值判断（忽略 `value`）
    Truthy,
}

impl FromStr for Comparison {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eq" | "==" => Ok(Comparison::Eq),
            "ne" | "!=" => Ok(Comparison::Ne),
            "gt" | ">" => Ok(Comparison::Gt),
            "ge" | ">=" => Ok(Comparison::Ge),
            "lt" | "<" => Ok(Comparison::Lt),
            "le" | "<=" => Ok(Comparison::Le),
            "truthy" => Ok(Comparison::Truthy),
            _ => Err(()),
        }
    }
}

/// 条件：`变量 运算 值`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// 变量名
    pub variable: String,
    /// 运算
    pub op: Comparison,
    /// 比较值（可为 `"$变量"`）
    pub value: JsonValue,
}

impl Condition {
    /// 求值；变量不存在时视为 `null`
    ///
    /// 大小比较只对两个数字或两个字符串成立，其它组合一律为假。
    pub fn evaluate(&self, vars: &Map<String, JsonValue>) -> bool {
        let left = vars.get(&self.variable).unwrap_or(&JsonValue::Null);
        let right = substitute(&self.value, vars);
        match self.op {
            Comparison::Truthy => is_truthy(left),
            Comparison::Eq => values_equal(left, &right),
            Comparison::Ne => !values_equal(left, &right),
            Comparison::Gt => compare(left, &right).is_some_and(|o| o.is_gt()),
            Comparison::Ge => compare(left, &right).is_some_and(|o| o.is_ge()),
            Comparison::Lt => compare(left, &right).is_some_and(|o| o.is_lt()),
            Comparison::Le => compare(left, &right).is_some_and(|o| o.is_le()),
        }
    }
}

/// JSON 真值：`null`、`false`、`0`、空字符串、空数组与空对象为假
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &JsonValue, b: &JsonValue) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (JsonValue::Number(_), JsonValue::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// 变量引用：`"$name"` 返回 `Some("name")`
pub fn variable_reference(value: &JsonValue) -> Option<&str> {
    value
        .as_str()
        .and_then(|s| s.strip_prefix('$'))
        .filter(|name| !name.is_empty())
}

/// 把参数中的 `"$name"` 替换为变量值（递归处理数组与对象）
///
/// 未定义的变量替换为 `null`。
pub fn substitute(value: &JsonValue, vars: &Map<String, JsonValue>) -> JsonValue {
    if let Some(name) = variable_reference(value) {
        return vars.get(name).cloned().unwrap_or(JsonValue::Null);
    }
    match value {
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(|v| substitute(v, vars)).collect()),
        JsonValue::Object(fields) => JsonValue::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// 列表来源
#[derive(Debug, Clone, PartialEq)]
pub enum ItemSource {
    /// 字面列表（元素本身也可以是 `"$变量"`）
    Literal(Vec<JsonValue>),
    /// 列表变量
    Variable(String),
}

impl ItemSource {
    fn parse(command: &Command, key: &str) -> Result<Self, CommandError> {
        let value = command.require(key)?;
        if let Some(name) = variable_reference(value) {
            return Ok(ItemSource::Variable(name.to_string()));
        }
        match value {
            JsonValue::Array(items) => Ok(ItemSource::Literal(items.clone())),
            _ => Err(command.invalid(key, "应为列表或 \"$变量\"")),
        }
    }

    /// 执行期展开；变量不是列表时返回空
    pub fn items(&self, vars: &Map<String, JsonValue>) -> Vec<JsonValue> {
        match self {
            ItemSource::Literal(items) => items.iter().map(|v| substitute(v, vars)).collect(),
            ItemSource::Variable(name) => match vars.get(name) {
                Some(JsonValue::Array(items)) => items.clone(),
                Some(other) => {
                    warn!(variable = %name, value = %other, "变量不是列表，按空列表处理");
                    Vec::new()
                }
                None => Vec::new(),
            },
        }
    }
}

/// 类型化指令
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// 对目标播放动画
    Animate {
        target: String,
        animation: AnimationDescriptor,
        repeat: u32,
        alternate: bool,
    },
    /// 错开播放
    Stagger {
        targets: ItemSource,
        animation: AnimationDescriptor,
        config: StaggerConfig,
    },
    /// 等待
    Wait { duration: f64 },
    /// 依次执行子命令（计划中的下标）
    Sequence { steps: Vec<usize> },
    /// 同时执行子命令（计划中的下标）
    Parallel { steps: Vec<usize> },
    /// 条件块开始；`next` 为下一个分支或 `END_IF` 在顶层序列中的位置
    If { condition: Condition, next: usize },
    /// 条件分支
    ElseIf { condition: Condition, next: usize },
    /// 默认分支；`end` 为 `END_IF` 的位置
    Else { end: usize },
    /// 条件块结束
    EndIf,
    /// 循环开始；`end` 为 `END_FOR_EACH` 的位置
    ForEach {
        items: ItemSource,
        binding: String,
        index: Option<String>,
        end: usize,
    },
    /// 循环结束；`start` 为 `FOR_EACH` 的位置
    EndForEach { start: usize },
    /// 调用函数
    Call { function: String, args: JsonValue },
    /// 设置变量
    Set { variable: String, value: JsonValue },
    /// 绑定事件
    On { event: String, function: String },
    /// 派发事件
    Emit { event: String, payload: JsonValue },
    /// 未知类型（执行期跳过）
    Skip { tag: String },
}

/// 计划中的一步
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCommand {
    /// 命令 ID
    pub id: String,
    /// 开始前的延迟
    pub delay: f64,
    /// 标签
    pub labels: BTreeSet<String>,
    /// 指令
    pub instruction: Instruction,
}

/// 命令计划（不可变）
///
/// `steps` 按依赖顺序排列，包含全部命令；`top_level` 是顶层执行序列
/// （被 `SEQUENCE`/`PARALLEL` 引用的子命令只在父命令下执行）。
/// 控制块指令中的位置都指向 `top_level`。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandPlan {
    order: ExecutionPlan,
    steps: Vec<PlannedCommand>,
    top_level: Vec<usize>,
}

impl CommandPlan {
    /// 构建计划
    ///
    /// # 错误
    ///
    /// - [`CommandError::Graph`]：ID 重复、依赖未声明、依赖成环，或子命令引用成环
    /// - [`CommandError::MissingParameter`] / [`CommandError::InvalidParameter`]
    /// - [`CommandError::UnknownStep`]：子命令不存在
    /// - [`CommandError::UnknownAnimation`]：动画名称未注册
    /// - [`CommandError::UnbalancedBlock`]：控制块不配对
    ///
    /// 任何错误都不会产生部分结果。
    pub fn build(commands: &[Command], library: &AnimationLibrary) -> Result<Self, CommandError> {
        let order = graph::resolve(commands)?;
        let by_id: HashMap<&str, &Command> = commands.iter().map(|c| (c.id.as_str(), c)).collect();
        let ordered: Vec<&Command> = order.iter().filter_map(|id| by_id.get(id).copied()).collect();
        let position: HashMap<&str, usize> = ordered
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();

        // 子命令
        let mut children: HashSet<usize> = HashSet::new();
        let mut step_nodes = Vec::new();
        for command in &ordered {
            let kind = command.command_kind();
            if !matches!(kind, Some(CommandKind::Sequence | CommandKind::Parallel)) {
                continue;
            }
            let mut steps = Vec::new();
            for step in parse_steps(command)? {
                let Some(&i) = position.get(step.as_str()) else {
                    return Err(CommandError::UnknownStep {
                        id: command.id.clone(),
                        step,
                    });
                };
                if ordered[i].command_kind().is_some_and(|k| k.is_block()) {
                    return Err(command.invalid("steps", format!("控制块命令 '{step}' 不能作为子命令")));
                }
                children.insert(i);
                // 只有组合命令之间才可能形成环
                let composite = matches!(
                    ordered[i].command_kind(),
                    Some(CommandKind::Sequence | CommandKind::Parallel)
                );
                if composite {
                    steps.push(step);
                }
            }
            step_nodes.push(StepNode {
                id: command.id.clone(),
                steps,
            });
        }
        graph::resolve(&step_nodes)?;

        let top_level: Vec<usize> = (0..ordered.len()).filter(|i| !children.contains(i)).collect();
        let jumps = match_blocks(&ordered, &top_level)?;

        let mut steps = Vec::with_capacity(ordered.len());
        for (i, command) in ordered.iter().enumerate() {
            let instruction = compile(command, library, &position, jumps.get(&i).copied())?;
            steps.push(PlannedCommand {
                id: command.id.clone(),
                delay: command.delay.max(0.0),
                labels: command.labels.clone(),
                instruction,
            });
        }

        Ok(Self {
            order,
            steps,
            top_level,
        })
    }

    /// 依赖顺序
    pub fn order(&self) -> &ExecutionPlan {
        &self.order
    }

    /// 全部步骤（依赖顺序）
    pub fn steps(&self) -> &[PlannedCommand] {
        &self.steps
    }

    /// 按下标获取
    pub fn step(&self, index: usize) -> Option<&PlannedCommand> {
        self.steps.get(index)
    }

    /// 顶层执行序列（`steps` 的下标）
    pub fn top_level(&self) -> &[usize] {
        &self.top_level
    }

    /// 带指定标签的命令 ID
    pub fn labeled(&self, label: &str) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.labels.contains(label))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// 命令数量
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Display for CommandPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let children: HashSet<usize> = (0..self.steps.len())
            .filter(|i| !self.top_level.contains(i))
            .collect();
        for (index, step) in self.steps.iter().enumerate() {
            let tag = match &step.instruction {
                Instruction::Animate { .. } => "ANIMATE".to_string(),
                Instruction::Stagger { .. } => "STAGGER".to_string(),
                Instruction::Wait { duration } => format!("WAIT {duration}"),
                Instruction::Sequence { steps } => format!("SEQUENCE {}", self.names(steps)),
                Instruction::Parallel { steps } => format!("PARALLEL {}", self.names(steps)),
                Instruction::If { .. } => "IF".to_string(),
                Instruction::ElseIf { .. } => "ELSE_IF".to_string(),
                Instruction::Else { .. } => "ELSE".to_string(),
                Instruction::EndIf => "END_IF".to_string(),
                Instruction::ForEach { .. } => "FOR_EACH".to_string(),
                Instruction::EndForEach { .. } => "END_FOR_EACH".to_string(),
                Instruction::Call { function, .. } => format!("CALL {function}"),
                Instruction::Set { variable, .. } => format!("SET {variable}"),
                Instruction::On { event, function } => format!("ON {event} -> {function}"),
                Instruction::Emit { event, .. } => format!("EMIT {event}"),
                Instruction::Skip { tag } => format!("SKIP {tag}"),
            };
            let marker = if children.contains(&index) { "  " } else { "" };
            writeln!(f, "{marker}{}: {tag}", step.id)?;
        }
        Ok(())
    }
}

impl CommandPlan {
    fn names(&self, steps: &[usize]) -> String {
        let names: Vec<&str> = steps
            .iter()
            .filter_map(|&i| self.steps.get(i))
            .map(|s| s.id.as_str())
            .collect();
        format!("[{}]", names.join(", "))
    }
}

/// 子命令引用图的节点
struct StepNode {
    id: String,
    steps: Vec<String>,
}

impl DependencyNode for StepNode {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.steps
    }
}

fn parse_steps(command: &Command) -> Result<Vec<String>, CommandError> {
    let value = command.require("steps")?;
    let items = value
        .as_array()
        .ok_or_else(|| command.invalid("steps", "应为字符串列表"))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| command.invalid("steps", "应为字符串列表"))
        })
        .collect()
}

/// 控制块配对结果：命令下标（`steps`）-> 配对位置（`top_level`）
fn match_blocks(ordered: &[&Command], top_level: &[usize]) -> Result<HashMap<usize, usize>, CommandError> {
    enum Open {
        /// 各分支的 (位置, 下标)
        If { branches: Vec<(usize, usize)>, has_else: bool },
        ForEach { pos: usize, index: usize },
    }

    let unbalanced = |id: &str, message: &str| CommandError::UnbalancedBlock {
        id: id.to_string(),
        message: message.to_string(),
    };

    let mut jumps = HashMap::new();
    let mut stack: Vec<Open> = Vec::new();
    for (pos, &i) in top_level.iter().enumerate() {
        let command = ordered[i];
        match command.command_kind() {
            Some(CommandKind::If) => stack.push(Open::If {
                branches: vec![(pos, i)],
                has_else: false,
            }),
            Some(kind @ (CommandKind::ElseIf | CommandKind::Else)) => match stack.last_mut() {
                Some(Open::If { branches, has_else }) => {
                    if *has_else {
                        return Err(unbalanced(&command.id, "ELSE 之后不能再有分支"));
                    }
                    if let Some(&(_, prev)) = branches.last() {
                        jumps.insert(prev, pos);
                    }
                    branches.push((pos, i));
                    *has_else = kind == CommandKind::Else;
                }
                _ => return Err(unbalanced(&command.id, "分支不在 IF 块内")),
            },
            Some(CommandKind::EndIf) => match stack.pop() {
                Some(Open::If { branches, .. }) => {
                    // 最后一个分支跳到 END_IF
                    if let Some(&(_, last)) = branches.last() {
                        jumps.insert(last, pos);
                    }
                }
                _ => return Err(unbalanced(&command.id, "END_IF 没有对应的 IF")),
            },
            Some(CommandKind::ForEach) => stack.push(Open::ForEach { pos, index: i }),
            Some(CommandKind::EndForEach) => match stack.pop() {
                Some(Open::ForEach { pos: start, index }) => {
                    jumps.insert(index, pos);
                    jumps.insert(i, start);
                }
                _ => return Err(unbalanced(&command.id, "END_FOR_EACH 没有对应的 FOR_EACH")),
            },
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        let (index, message) = match open {
            Open::If { branches, .. } => (branches[0].1, "IF 块未闭合"),
            Open::ForEach { index, .. } => (*index, "FOR_EACH 块未闭合"),
        };
        return Err(unbalanced(&ordered[index].id, message));
    }
    Ok(jumps)
}

/// 把单条命令解析为指令；`partner` 为控制块的配对位置
fn compile(
    command: &Command,
    library: &AnimationLibrary,
    position: &HashMap<&str, usize>,
    partner: Option<usize>,
) -> Result<Instruction, CommandError> {
    let Some(kind) = command.command_kind() else {
        warn!(id = %command.id, tag = %command.kind, "未知命令类型，已跳过");
        return Ok(Instruction::Skip {
            tag: command.kind.clone(),
        });
    };
    let jump = || {
        partner.ok_or_else(|| CommandError::UnbalancedBlock {
            id: command.id.clone(),
            message: "控制块缺少配对".to_string(),
        })
    };

    let instruction = match kind {
        CommandKind::Animate => Instruction::Animate {
            target: command.require_str("target")?.to_string(),
            animation: resolve_animation(command, library)?,
            repeat: match command.param("repeat") {
                None => 0,
                Some(v) => v
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| command.invalid("repeat", "应为非负整数"))?,
            },
            alternate: command.param("alternate").is_some_and(is_truthy),
        },
        CommandKind::Stagger => Instruction::Stagger {
            targets: ItemSource::parse(command, "targets")?,
            animation: resolve_animation(command, library)?,
            config: match command.param("stagger") {
                None => StaggerConfig::default(),
                Some(JsonValue::Number(n)) => StaggerConfig::linear(n.as_f64().unwrap_or(0.0).max(0.0)),
                Some(v) => serde_json::from_value(v.clone())
                    .map_err(|e| command.invalid("stagger", e.to_string()))?,
            },
        },
        CommandKind::Wait => Instruction::Wait {
            duration: command.require_f64("duration")?,
        },
        CommandKind::Sequence | CommandKind::Parallel => {
            let steps = parse_steps(command)?
                .iter()
                .filter_map(|s| position.get(s.as_str()).copied())
                .collect();
            if kind == CommandKind::Sequence {
                Instruction::Sequence { steps }
            } else {
                Instruction::Parallel { steps }
            }
        }
        CommandKind::If => Instruction::If {
            condition: parse_condition(command)?,
            next: jump()?,
        },
        CommandKind::ElseIf => Instruction::ElseIf {
            condition: parse_condition(command)?,
            next: jump()?,
        },
        CommandKind::Else => Instruction::Else { end: jump()? },
        CommandKind::EndIf => Instruction::EndIf,
        CommandKind::ForEach => Instruction::ForEach {
            items: ItemSource::parse(command, "items")?,
            binding: command.optional_str("as")?.unwrap_or("item").to_string(),
            index: command.optional_str("index")?.map(str::to_string),
            end: jump()?,
        },
        CommandKind::EndForEach => Instruction::EndForEach { start: jump()? },
        CommandKind::Call => Instruction::Call {
            function: command.require_str("function")?.to_string(),
            args: command.optional_value("args"),
        },
        CommandKind::Set => Instruction::Set {
            variable: command.require_str("variable")?.to_string(),
            value: command.optional_value("value"),
        },
        CommandKind::On => Instruction::On {
            event: command.require_str("event")?.to_string(),
            function: command.require_str("function")?.to_string(),
        },
        CommandKind::Emit => Instruction::Emit {
            event: command.require_str("event")?.to_string(),
            payload: command.optional_value("payload"),
        },
    };
    Ok(instruction)
}

fn resolve_animation(command: &Command, library: &AnimationLibrary) -> Result<AnimationDescriptor, CommandError> {
    let value = command.require("animation")?;
    let reference: AnimationRef =
        serde_json::from_value(value.clone()).map_err(|e| command.invalid("animation", e.to_string()))?;
    library.resolve(&reference).map_err(|name| CommandError::UnknownAnimation {
        id: command.id.clone(),
        name,
    })
}

fn parse_condition(command: &Command) -> Result<Condition, CommandError> {
    let variable = command.require_str("variable")?.to_string();
    let value = command.optional_value("value");
    let op = match command.optional_str("op")? {
        Some(op) => Comparison::from_str(op).map_err(|_| command.invalid("op", format!("未知运算 '{op}'")))?,
        None if value.is_null() => Comparison::Truthy,
        None => Comparison::Eq,
    };
    Ok(Condition { variable, op, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn library() -> AnimationLibrary {
        AnimationLibrary::new().with("fade", AnimationDescriptor::new(100.0).style("opacity", 0.0, 1.0))
    }

    fn ids(plan: &CommandPlan) -> Vec<&str> {
        plan.top_level()
            .iter()
            .map(|&i| plan.steps()[i].id.as_str())
            .collect()
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!(CommandKind::from_str("animate").ok(), Some(CommandKind::Animate));
        assert_eq!(CommandKind::from_str("ELSE_IF").ok(), Some(CommandKind::ElseIf));
        assert_eq!(CommandKind::from_str("end-for-each").ok(), Some(CommandKind::EndForEach));
        assert_eq!(CommandKind::from_str("TELEPORT").ok(), None);
    }

    #[test]
    fn test_command_deserialization() {
        let command: Command = serde_json::from_value(json!({
            "id": "fade",
            "type": "ANIMATE",
            "params": { "target": "#card", "animation": "fade" },
            "dependencies": ["setup"],
            "labels": ["intro"]
        }))
        .unwrap();

        assert_eq!(command.command_kind(), Some(CommandKind::Animate));
        assert_eq!(command.require_str("target").unwrap(), "#card");
        assert_eq!(command.dependencies, vec!["setup".to_string()]);
        assert!(command.labels.contains("intro"));
        assert_eq!(command.delay, 0.0);
    }

    #[test]
    fn test_plan_follows_dependencies() {
        let commands = vec![
            Command::wait("c", 10.0).after("b"),
            Command::wait("b", 10.0).after("a"),
            Command::wait("a", 10.0),
        ];
        let plan = CommandPlan::build(&commands, &library()).unwrap();
        assert_eq!(ids(&plan), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let commands = vec![Command::wait("a", 1.0).after("b"), Command::wait("b", 1.0).after("a")];
        let err = CommandPlan::build(&commands, &library()).unwrap_err();
        assert!(matches!(
            err,
            CommandError::Graph(crate::error::GraphError::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let commands = vec![Command::with_tag("x", "TELEPORT"), Command::wait("a", 1.0)];
        let plan = CommandPlan::build(&commands, &library()).unwrap();
        assert_eq!(
            plan.step(0).unwrap().instruction,
            Instruction::Skip {
                tag: "TELEPORT".to_string()
            }
        );
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_missing_and_invalid_parameters() {
        let err = CommandPlan::build(&[Command::new("w", CommandKind::Wait)], &library()).unwrap_err();
        assert_eq!(
            err,
            CommandError::MissingParameter {
                id: "w".to_string(),
                kind: "WAIT".to_string(),
                param: "duration".to_string()
            }
        );

        let err = CommandPlan::build(&[Command::wait("w", -5.0)], &library()).unwrap_err();
        assert!(matches!(err, CommandError::InvalidParameter { .. }));
    }

    #[test]
    fn test_named_animation_is_resolved_once() {
        let plan = CommandPlan::build(&[Command::animate("a", "#card", "fade")], &library()).unwrap();
        let Instruction::Animate { animation, target, .. } = &plan.steps()[0].instruction else {
            panic!("expected ANIMATE");
        };
        assert_eq!(target, "#card");
        assert_eq!(animation.duration, 100.0);

        let err = CommandPlan::build(&[Command::animate("a", "#card", "missing")], &library()).unwrap_err();
        assert_eq!(
            err,
            CommandError::UnknownAnimation {
                id: "a".to_string(),
                name: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_children_run_only_under_parent() {
        let commands = vec![
            Command::wait("one", 10.0),
            Command::wait("two", 10.0),
            Command::sequence("seq", ["one", "two"]),
            Command::emit("done", "finished"),
        ];
        let plan = CommandPlan::build(&commands, &library()).unwrap();
        assert_eq!(ids(&plan), vec!["seq", "done"]);
        assert_eq!(
            plan.steps()[2].instruction,
            Instruction::Sequence { steps: vec![0, 1] }
        );
    }

    #[test]
    fn test_nested_composites_with_leaf_children() {
        let commands = vec![
            Command::wait("short", 10.0),
            Command::wait("long", 30.0),
            Command::sequence("inner", ["short", "long"]),
            Command::emit("ping", "ping"),
            Command::parallel("both", ["inner", "ping"]),
        ];
        let plan = CommandPlan::build(&commands, &library()).unwrap();
        assert_eq!(ids(&plan), vec!["both"]);
        assert_eq!(
            plan.steps()[4].instruction,
            Instruction::Parallel { steps: vec![2, 3] }
        );
    }

    #[test]
    fn test_unknown_and_cyclic_steps() {
        let err = CommandPlan::build(&[Command::sequence("seq", ["ghost"])], &library()).unwrap_err();
        assert_eq!(
            err,
            CommandError::UnknownStep {
                id: "seq".to_string(),
                step: "ghost".to_string()
            }
        );

        let commands = vec![Command::sequence("a", ["b"]), Command::parallel("b", ["a"])];
        let err = CommandPlan::build(&commands, &library()).unwrap_err();
        assert!(matches!(err, CommandError::Graph(_)));
    }

    #[test]
    fn test_block_jumps() {
        let commands = vec![
            Command::new("if", CommandKind::If).with_param("variable", "x"),
            Command::wait("w1", 1.0),
            Command::new("elif", CommandKind::ElseIf)
                .with_param("variable", "x")
                .with_param("op", "gt")
                .with_param("value", 3),
            Command::new("else", CommandKind::Else),
            Command::wait("w2", 1.0),
            Command::new("end", CommandKind::EndIf),
        ];
        let plan = CommandPlan::build(&commands, &library()).unwrap();
        let steps = plan.steps();

        assert!(matches!(&steps[0].instruction, Instruction::If { next: 2, condition } if condition.op == Comparison::Truthy));
        assert!(matches!(&steps[2].instruction, Instruction::ElseIf { next: 3, condition } if condition.op == Comparison::Gt));
        assert_eq!(steps[3].instruction, Instruction::Else { end: 5 });
        assert_eq!(steps[5].instruction, Instruction::EndIf);
    }

    #[test]
    fn test_unbalanced_blocks() {
        let unclosed = vec![Command::new("if", CommandKind::If).with_param("variable", "x")];
        assert!(matches!(
            CommandPlan::build(&unclosed, &library()),
            Err(CommandError::UnbalancedBlock { id, .. }) if id == "if"
        ));

        let stray = vec![Command::new("end", CommandKind::EndForEach)];
        assert!(matches!(
            CommandPlan::build(&stray, &library()),
            Err(CommandError::UnbalancedBlock { .. })
        ));

        let crossed = vec![
            Command::new("if", CommandKind::If).with_param("variable", "x"),
            Command::new("loop", CommandKind::ForEach).with_param("items", json!([1])),
            Command::new("end_if", CommandKind::EndIf),
            Command::new("end_loop", CommandKind::EndForEach),
        ];
        assert!(matches!(
            CommandPlan::build(&crossed, &library()),
            Err(CommandError::UnbalancedBlock { id, .. }) if id == "end_if"
        ));

        let double_else = vec![
            Command::new("if", CommandKind::If).with_param("variable", "x"),
            Command::new("e1", CommandKind::Else),
            Command::new("e2", CommandKind::Else),
            Command::new("end", CommandKind::EndIf),
        ];
        assert!(matches!(
            CommandPlan::build(&double_else, &library()),
            Err(CommandError::UnbalancedBlock { id, .. }) if id == "e2"
        ));
    }

    #[test]
    fn test_condition_evaluation() {
        let vars: Map<String, JsonValue> = json!({ "n": 5, "name": "card", "empty": "", "limit": 5 })
            .as_object()
            .cloned()
            .unwrap();
        let cond = |variable: &str, op, value| Condition {
            variable: variable.to_string(),
            op,
            value,
        };

        assert!(cond("n", Comparison::Eq, json!(5.0)).evaluate(&vars));
        assert!(cond("n", Comparison::Ge, json!("$limit")).evaluate(&vars));
        assert!(cond("n", Comparison::Lt, json!(6)).evaluate(&vars));
        assert!(!cond("n", Comparison::Gt, json!("7")).evaluate(&vars));
        assert!(cond("name", Comparison::Ne, json!("list")).evaluate(&vars));
        assert!(!cond("empty", Comparison::Truthy, JsonValue::Null).evaluate(&vars));
        assert!(!cond("missing", Comparison::Truthy, JsonValue::Null).evaluate(&vars));
        assert!(cond("missing", Comparison::Eq, JsonValue::Null).evaluate(&vars));
    }

    #[test]
    fn test_substitute_variables() {
        let vars: Map<String, JsonValue> = json!({ "item": "#a", "count": 2 }).as_object().cloned().unwrap();
        let value = json!({ "target": "$item", "list": ["$count", "plain", "$missing"] });
        assert_eq!(
            substitute(&value, &vars),
            json!({ "target": "#a", "list": [2, "plain", null] })
        );
        assert_eq!(substitute(&json!("$"), &vars), json!("$"));
    }

    #[test]
    fn test_plan_display() {
        let commands = vec![
            Command::wait("one", 10.0),
            Command::call("hook", "notify"),
            Command::parallel("both", ["one", "hook"]),
            Command::emit("done", "finished").after("both"),
        ];
        let plan = CommandPlan::build(&commands, &library()).unwrap();
        insta::assert_snapshot!(plan.to_string().trim_end(), @r"
          one: WAIT 10
          hook: CALL notify
        both: PARALLEL [one, hook]
        done: EMIT finished
        ");
    }
}
