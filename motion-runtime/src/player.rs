//! # Player 模块
//!
//! 把时钟事件落实为表面写入、回调调用与事件派发。
//!
//! [`PlaybackClock`] 只计算进度；[`AnimationPlayer`] 在构造时把每个条目的目标
//! 一次性解析为表面句柄，之后每次 `tick` 把缓动进度交给插值引擎，
//! 再通过 [`Surface`](crate::surface::Surface) 能力提交结果。
//!
//! 目标解析不到任何表面时记录警告，该条目收缩为起点处的瞬时条目：
//! 到达起点即完成，不写入，也不再占用时间轴。

use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::animation::AnimationDescriptor;
use crate::clock::{ClockEvent, PlaybackClock, Repeat};
use crate::event::{EventBus, FunctionRegistry, MotionEvent};
use crate::interpolation::{CompiledInterpolation, Interpolator};
use crate::surface::{SurfaceHandle, TargetRef, TargetResolver, apply_value};
use crate::timeline::{CompiledTimeline, EntryAction};

/// 条目绑定
enum Binding {
    Style {
        target: TargetRef,
        surfaces: Vec<SurfaceHandle>,
        animation: AnimationDescriptor,
        compiled: CompiledInterpolation,
    },
    Callback {
        name: String,
    },
    Event {
        name: String,
        payload: serde_json::Value,
    },
}

/// 动画播放器
pub struct AnimationPlayer {
    clock: PlaybackClock,
    bindings: HashMap<String, Binding>,
    interpolator: Rc<Interpolator>,
    events: Option<EventBus>,
    functions: Option<FunctionRegistry>,
    unresolved: Vec<String>,
}

impl std::fmt::Debug for AnimationPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationPlayer")
            .field("clock", &self.clock.state())
            .field("bindings", &self.bindings.len())
            .field("unresolved", &self.unresolved)
            .finish()
    }
}

impl AnimationPlayer {
    /// 创建播放器，并一次性解析全部目标
    pub fn new(
        timeline: CompiledTimeline,
        resolver: &dyn TargetResolver,
        interpolator: Rc<Interpolator>,
    ) -> Self {
        let mut bindings = HashMap::new();
        let mut unresolved = Vec::new();

        for entry in timeline.entries() {
            let binding = match &entry.action {
                EntryAction::None => continue,
                EntryAction::Style { target, animation } => {
                    let surfaces = resolver.resolve(target);
                    if surfaces.is_empty() {
                        warn!(entry = %entry.id, reference = %target, "目标未解析到任何表面");
                        unresolved.push(entry.id.clone());
                    }
                    Binding::Style {
                        target: target.clone(),
                        surfaces,
                        compiled: interpolator.compile(&animation.interpolation),
                        animation: animation.clone(),
                    }
                }
                EntryAction::Callback { name } => Binding::Callback { name: name.clone() },
                EntryAction::Event { name, payload } => Binding::Event {
                    name: name.clone(),
                    payload: payload.clone(),
                },
            };
            bindings.insert(entry.id.clone(), binding);
        }

        let timeline = timeline.complete_immediately(&unresolved);
        Self {
            clock: PlaybackClock::new(timeline),
            bindings,
            interpolator,
            events: None,
            functions: None,
            unresolved,
        }
    }

    /// 设置事件总线（事件阶段）
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// 设置函数注册表（回调阶段）
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = Some(functions);
        self
    }

    /// 设置重复与交替
    pub fn with_repeat(mut self, repeat: Repeat, alternate: bool) -> Self {
        self.clock = self.clock.with_repeat(repeat).with_alternate(alternate);
        self
    }

    /// 开始播放
    pub fn play(&mut self, now: f64) {
        self.clock.play(now);
    }

    /// 暂停
    pub fn pause(&mut self, now: f64) {
        self.clock.pause(now);
    }

    /// 恢复
    pub fn resume(&mut self, now: f64) {
        self.clock.resume(now);
    }

    /// 取消（写入停留在当前值）
    pub fn cancel(&mut self) {
        self.clock.cancel();
    }

    /// 修改速率
    pub fn set_rate(&mut self, rate: f64, now: f64) {
        self.clock.set_rate(rate, now);
    }

    /// 推进并应用
    pub fn tick(&mut self, now: f64) -> Vec<ClockEvent> {
        let events = self.clock.tick(now);
        self.dispatch(&events);
        events
    }

    /// 立即跳到结尾并应用最终值
    pub fn finish_now(&mut self) -> Vec<ClockEvent> {
        let events = self.clock.finish_now();
        self.dispatch(&events);
        events
    }

    /// 时钟
    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    /// 可变时钟（注册续体）
    pub fn clock_mut(&mut self) -> &mut PlaybackClock {
        &mut self.clock
    }

    /// 是否已完成
    pub fn is_finished(&self) -> bool {
        self.clock.is_finished()
    }

    /// 未解析到表面的条目
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    /// 条目目标是否未解析
    pub fn is_unresolved(&self, id: &str) -> bool {
        self.unresolved.iter().any(|u| u == id)
    }

    fn dispatch(&self, events: &[ClockEvent]) {
        for event in events {
            match event {
                ClockEvent::StageStarted { id } => self.on_started(id),
                ClockEvent::StageProgress { id, progress } => self.apply(id, *progress),
                _ => {}
            }
        }
    }

    fn on_started(&self, id: &str) {
        match self.bindings.get(id) {
            Some(Binding::Callback { name }) => match &self.functions {
                Some(functions) => {
                    functions.call(name, &serde_json::Value::Null);
                }
                None => warn!(entry = id, callback = %name, "没有函数注册表，回调被跳过"),
            },
            Some(Binding::Event { name, payload }) => match &self.events {
                Some(bus) => {
                    bus.emit(MotionEvent::new(name.clone()).with_payload(payload.clone()));
                }
                None => debug!(entry = id, event = %name, "没有事件总线，事件被丢弃"),
            },
            _ => {}
        }
    }

    fn apply(&self, id: &str, progress: f64) {
        let Some(Binding::Style {
            target,
            surfaces,
            animation,
            compiled,
        }) = self.bindings.get(id)
        else {
            return;
        };
        if surfaces.is_empty() {
            return;
        }

        for track in &animation.tracks {
            let value = self
                .interpolator
                .track_value(compiled, &track.key, &track.from, &track.to, progress);
            for surface in surfaces {
                apply_value(surface.as_ref(), track.kind, &track.key, &value);
            }
        }
        tracing::trace!(entry = id, reference = %target, progress, "已应用");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::interpolation::{BlendMode, InterpolationConfig, Value};
    use crate::surface::{MemorySurface, SurfaceRegistry};
    use crate::timeline::{Stage, TimelineCompiler};

    fn linear_fade(duration: f64) -> AnimationDescriptor {
        AnimationDescriptor::new(duration)
            .style("opacity", 0.0, 1.0)
            .property("value", 0.0, 10.0)
            .with_easing(crate::easing::EasingFunction::Linear)
    }

    #[test]
    fn test_applies_values_to_surfaces() {
        let surface = MemorySurface::new();
        let mut registry = SurfaceRegistry::new();
        registry.register("#card", surface.clone());

        let timeline = TimelineCompiler::new()
            .compile(&[Stage::style("fade", "#card", linear_fade(100.0))])
            .unwrap();
        let mut player = AnimationPlayer::new(timeline, &registry, Rc::new(Interpolator::new()));
        player.play(0.0);
        player.tick(0.0);
        player.tick(50.0);
        assert_eq!(surface.style("opacity"), Some(Value::Number(0.5)));
        assert_eq!(surface.property("value"), Some(Value::Number(5.0)));

        player.tick(200.0);
        assert_eq!(surface.style("opacity"), Some(Value::Number(1.0)));
        assert!(player.is_finished());
    }

    #[test]
    fn test_unresolved_target_only_logs() {
        let registry = SurfaceRegistry::new();
        let timeline = TimelineCompiler::new()
            .compile(&[Stage::style("fade", "#missing", linear_fade(100.0))])
            .unwrap();
        let mut player = AnimationPlayer::new(timeline, &registry, Rc::new(Interpolator::new()));
        assert!(player.is_unresolved("fade"));

        player.play(0.0);
        player.tick(150.0);
        assert!(player.is_finished());
    }

    #[test]
    fn test_unresolved_entry_completes_at_its_start() {
        let surface = MemorySurface::new();
        let mut registry = SurfaceRegistry::new();
        registry.register("#card", surface.clone());

        let timeline = TimelineCompiler::new()
            .compile(&[
                Stage::style("fade", "#card", linear_fade(100.0)),
                Stage::style("ghost", "#missing", linear_fade(300.0)),
            ])
            .unwrap();
        let mut player = AnimationPlayer::new(timeline, &registry, Rc::new(Interpolator::new()));
        assert_eq!(player.clock().timeline().duration(), 100.0);

        player.play(0.0);
        player.tick(0.0);
        let events = player.tick(100.0);
        assert!(events.contains(&ClockEvent::StageFinished { id: "ghost".to_string() }));
        assert!(player.is_finished());
        assert_eq!(surface.style("opacity"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_global_blend_mode_shapes_written_values() {
        let surface = MemorySurface::new();
        let mut registry = SurfaceRegistry::new();
        registry.register("#card", surface.clone());

        let animation = AnimationDescriptor::new(100.0)
            .property("value", 10.0, 20.0)
            .with_easing(crate::easing::EasingFunction::Linear)
            .with_interpolation(InterpolationConfig::new().with_blend_mode(BlendMode::Max));
        let timeline = TimelineCompiler::new()
            .compile(&[Stage::style("grow", "#card", animation)])
            .unwrap();
        let mut player = AnimationPlayer::new(timeline, &registry, Rc::new(Interpolator::new()));
        player.play(0.0);
        player.tick(0.0);
        player.tick(50.0);
        assert_eq!(surface.property("value"), Some(Value::Number(20.0)));
    }

    #[test]
    fn test_callback_and_event_stages() {
        let functions = FunctionRegistry::new();
        let called = Rc::new(Cell::new(0));
        let c = called.clone();
        functions.register("ping", move |_| {
            c.set(c.get() + 1);
            Ok(())
        });
        let bus = EventBus::new();
        let heard = Rc::new(Cell::new(false));
        let h = heard.clone();
        bus.on("done", move |_| {
            h.set(true);
            Ok(())
        });

        let timeline = TimelineCompiler::new()
            .compile(&[
                Stage::callback("cb", "ping").with_duration(10.0),
                Stage::event("ev", "done"),
            ])
            .unwrap();
        let mut player = AnimationPlayer::new(timeline, &SurfaceRegistry::new(), Rc::new(Interpolator::new()))
            .with_functions(functions)
            .with_events(bus);
        player.play(0.0);
        player.tick(5.0);
        assert_eq!(called.get(), 1);
        assert!(!heard.get());

        player.tick(20.0);
        assert_eq!(called.get(), 1);
        assert!(heard.get());
    }
}
