//! # Clock 模块
//!
//! 协作式播放时钟：由宿主每帧调用 [`PlaybackClock::tick`] 驱动。
//!
//! ## 状态
//!
//! ```text
//! Idle -> Playing -> { Paused, Finished, Cancelling }
//! Cancelling --(下一次 tick)--> Idle
//! ```
//!
//! ## 时间计算
//!
//! - 已播放时间 `elapsed = (now - start) * rate`
//! - 暂停时冻结 `elapsed`，恢复时 `start = now - elapsed / rate`
//! - 修改速率时同样重新锚定 `start`，已经过去的时间不会被重新缩放
//! - 周期 `cycle = floor(elapsed / duration)`；交替模式下奇数周期反向播放
//! - `cycle` 超过重复次数时进入 `Finished`，且只触发一次
//!
//! `tick` 不直接调用任何外部代码，而是返回 [`ClockEvent`] 列表，由调用方处理。

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::timeline::{CompiledTimeline, TimelineEntry};

/// 完成令牌
///
/// 由 [`PlaybackClock::continuation_at`] 或 [`PlaybackClock::on_stage_end`] 返回，
/// 时间越过对应边界时以 [`ClockEvent::Continuation`] 交还。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompletionToken(u64);

impl CompletionToken {
    /// 令牌值
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// 重复设置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Repeat {
    /// 额外重复次数
    Times(u32),
    /// 无限循环
    Infinite,
}

impl Default for Repeat {
    fn default() -> Self {
        Repeat::Times(0)
    }
}

/// 时钟状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockState {
    /// 未开始
    #[default]
    Idle,
    /// 播放中
    Playing,
    /// 已暂停
    Paused,
    /// 已完成
    Finished,
    /// 取消中（下一次 tick 回到 Idle）
    Cancelling,
}

/// 单个条目的播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageState {
    /// 尚未进入
    #[default]
    Idle,
    /// 区间内
    Playing,
    /// 已离开
    Finished,
}

/// 时钟事件
#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    /// 条目首次进入区间
    StageStarted { id: String },
    /// 条目缓动进度
    StageProgress { id: String, progress: f64 },
    /// 条目离开区间（之前已发出最终进度）
    StageFinished { id: String },
    /// 一个周期结束
    CycleCompleted { cycle: u32 },
    /// 续体到期
    Continuation(CompletionToken),
    /// 全部周期结束
    Finished,
    /// 取消完成
    Cancelled,
}

#[derive(Debug, Clone)]
struct Continuation {
    token: CompletionToken,
    /// 正向播放时的触发时间
    forward_at: f64,
    /// 反向播放时的触发时间
    reverse_at: f64,
    fired: bool,
}

/// 进度区间判断结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Before,
    Inside,
    After,
}

/// 播放时钟
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    timeline: CompiledTimeline,
    state: ClockState,
    start: f64,
    elapsed: f64,
    rate: f64,
    repeat: Repeat,
    alternate: bool,
    cycle: u32,
    stages: Vec<StageState>,
    continuations: Vec<Continuation>,
    next_token: u64,
}

impl PlaybackClock {
    /// 创建时钟
    pub fn new(timeline: CompiledTimeline) -> Self {
        let stages = vec![StageState::Idle; timeline.entries().len()];
        Self {
            timeline,
            state: ClockState::Idle,
            start: 0.0,
            elapsed: 0.0,
            rate: 1.0,
            repeat: Repeat::default(),
            alternate: false,
            cycle: 0,
            stages,
            continuations: Vec::new(),
            next_token: 1,
        }
    }

    /// 设置重复
    pub fn with_repeat(mut self, repeat: Repeat) -> Self {
        self.repeat = repeat;
        self
    }

    /// 设置交替播放
    pub fn with_alternate(mut self, alternate: bool) -> Self {
        self.alternate = alternate;
        self
    }

    /// 设置初始速率
    pub fn with_rate(mut self, rate: f64) -> Self {
        if rate > 0.0 && rate.is_finite() {
            self.rate = rate;
        }
        self
    }

    // ========== 控制 ==========

    /// 开始播放
    ///
    /// `Idle` / `Finished` 从头开始；`Paused` 等同于恢复。
    pub fn play(&mut self, now: f64) {
        match self.state {
            ClockState::Idle | ClockState::Finished => {
                self.start = now;
                self.elapsed = 0.0;
                self.cycle = 0;
                self.reset_cycle();
                self.state = ClockState::Playing;
                debug!(duration = self.timeline.duration(), "时钟开始播放");
            }
            ClockState::Paused => self.resume(now),
            ClockState::Playing => {}
            ClockState::Cancelling => warn!("时钟正在取消，忽略 play"),
        }
    }

    /// 暂停
    pub fn pause(&mut self, now: f64) {
        if self.state == ClockState::Playing {
            self.elapsed = self.elapsed_at(now);
            self.state = ClockState::Paused;
        }
    }

    /// 恢复
    pub fn resume(&mut self, now: f64) {
        if self.state == ClockState::Paused {
            self.start = now - self.elapsed / self.rate;
            self.state = ClockState::Playing;
        }
    }

    /// 修改速率（只影响之后的时间）
    pub fn set_rate(&mut self, rate: f64, now: f64) {
        if !(rate > 0.0 && rate.is_finite()) {
            warn!(rate, "无效的播放速率，已忽略");
            return;
        }
        if self.state == ClockState::Playing {
            let elapsed = self.elapsed_at(now);
            self.rate = rate;
            self.start = now - elapsed / rate;
        } else {
            self.rate = rate;
        }
    }

    /// 取消
    ///
    /// 立即清除全部续体；下一次 `tick` 返回 [`ClockEvent::Cancelled`] 并回到 `Idle`。
    pub fn cancel(&mut self) {
        if matches!(self.state, ClockState::Playing | ClockState::Paused) {
            self.continuations.clear();
            self.state = ClockState::Cancelling;
            debug!("时钟取消");
        }
    }

    /// 立即结束当前周期并完成
    ///
    /// 所有未结束的条目收到最终进度与结束事件。
    pub fn finish_now(&mut self) -> Vec<ClockEvent> {
        let mut events = Vec::new();
        if !matches!(self.state, ClockState::Playing | ClockState::Paused) {
            return events;
        }
        let forward = self.is_forward(self.cycle);
        let end = if forward { self.timeline.duration() } else { 0.0 };
        self.evaluate(end, forward, &mut events);
        events.push(ClockEvent::CycleCompleted { cycle: self.cycle });
        events.push(ClockEvent::Finished);
        self.state = ClockState::Finished;
        events
    }

    // ========== 续体 ==========

    /// 注册在时间轴时间 `at` 处触发的续体
    pub fn continuation_at(&mut self, at: f64) -> CompletionToken {
        self.push_continuation(at, at)
    }

    /// 注册在条目结束时触发的续体；条目不存在时返回 `None`
    pub fn on_stage_end(&mut self, id: &str) -> Option<CompletionToken> {
        let (start, end) = self.timeline.entry(id).map(|e| (e.start, e.end))?;
        Some(self.push_continuation(end, start))
    }

    /// 撤销续体
    pub fn cancel_continuation(&mut self, token: CompletionToken) {
        self.continuations.retain(|c| c.token != token);
    }

    /// 待触发的续体数量
    pub fn pending_continuations(&self) -> usize {
        self.continuations.iter().filter(|c| !c.fired).count()
    }

    fn push_continuation(&mut self, forward_at: f64, reverse_at: f64) -> CompletionToken {
        let token = CompletionToken(self.next_token);
        self.next_token += 1;
        self.continuations.push(Continuation {
            token,
            forward_at,
            reverse_at,
            fired: false,
        });
        token
    }

    // ========== 驱动 ==========

    /// 推进到 `now`，返回本次产生的事件
    pub fn tick(&mut self, now: f64) -> Vec<ClockEvent> {
        let mut events = Vec::new();
        match self.state {
            ClockState::Playing => {}
            ClockState::Cancelling => {
                self.elapsed = 0.0;
                self.cycle = 0;
                self.reset_cycle();
                self.state = ClockState::Idle;
                events.push(ClockEvent::Cancelled);
                return events;
            }
            ClockState::Idle | ClockState::Paused | ClockState::Finished => return events,
        }

        let elapsed = self.elapsed_at(now);
        self.elapsed = elapsed;
        let duration = self.timeline.duration();

        if duration <= 0.0 {
            self.evaluate(0.0, true, &mut events);
            events.push(ClockEvent::CycleCompleted { cycle: 0 });
            events.push(ClockEvent::Finished);
            self.state = ClockState::Finished;
            return events;
        }

        let target_cycle = (elapsed / duration).floor().min(f64::from(u32::MAX)) as u32;
        while self.cycle < target_cycle {
            let forward = self.is_forward(self.cycle);
            self.evaluate(if forward { duration } else { 0.0 }, forward, &mut events);
            events.push(ClockEvent::CycleCompleted { cycle: self.cycle });
            self.cycle += 1;

            if self.exhausted() {
                self.state = ClockState::Finished;
                events.push(ClockEvent::Finished);
                debug!(cycles = self.cycle, "时钟播放完成");
                return events;
            }
            self.reset_cycle();
        }

        let forward = self.is_forward(self.cycle);
        let local = elapsed - f64::from(self.cycle) * duration;
        let local = if forward { local } else { duration - local };
        self.evaluate(local, forward, &mut events);
        events
    }

    /// 在时间轴时间 `t` 处评估全部条目与续体
    fn evaluate(&mut self, t: f64, forward: bool, events: &mut Vec<ClockEvent>) {
        for (entry, state) in self.timeline.entries().iter().zip(self.stages.iter_mut()) {
            let phase = phase_of(entry, t, forward);
            match (*state, phase) {
                (StageState::Finished, _) | (_, Phase::Before) => {}
                (StageState::Idle, Phase::Inside) => {
                    events.push(ClockEvent::StageStarted {
                        id: entry.id.clone(),
                    });
                    events.push(ClockEvent::StageProgress {
                        id: entry.id.clone(),
                        progress: entry.progress_at(t),
                    });
                    *state = StageState::Playing;
                }
                (StageState::Playing, Phase::Inside) => {
                    events.push(ClockEvent::StageProgress {
                        id: entry.id.clone(),
                        progress: entry.progress_at(t),
                    });
                }
                (StageState::Idle | StageState::Playing, Phase::After) => {
                    if *state == StageState::Idle {
                        events.push(ClockEvent::StageStarted {
                            id: entry.id.clone(),
                        });
                    }
                    let boundary = if forward { entry.end } else { entry.start };
                    events.push(ClockEvent::StageProgress {
                        id: entry.id.clone(),
                        progress: entry.progress_at(boundary),
                    });
                    events.push(ClockEvent::StageFinished {
                        id: entry.id.clone(),
                    });
                    *state = StageState::Finished;
                }
            }
        }

        for continuation in self.continuations.iter_mut().filter(|c| !c.fired) {
            let crossed = if forward {
                t >= continuation.forward_at
            } else {
                t <= continuation.reverse_at
            };
            if crossed {
                continuation.fired = true;
                events.push(ClockEvent::Continuation(continuation.token));
            }
        }
    }

    fn reset_cycle(&mut self) {
        self.stages.fill(StageState::Idle);
        for continuation in &mut self.continuations {
            continuation.fired = false;
        }
    }

    fn is_forward(&self, cycle: u32) -> bool {
        !self.alternate || cycle % 2 == 0
    }

    fn exhausted(&self) -> bool {
        match self.repeat {
            Repeat::Times(n) => self.cycle > n,
            Repeat::Infinite => false,
        }
    }

    fn elapsed_at(&self, now: f64) -> f64 {
        match self.state {
            ClockState::Playing => ((now - self.start) * self.rate).max(0.0),
            _ => self.elapsed,
        }
    }

    // ========== 查询 ==========

    /// 当前状态
    pub fn state(&self) -> ClockState {
        self.state
    }

    /// 当前周期
    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// 当前速率
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// `now` 时的已播放时间（跨周期累计）
    pub fn elapsed(&self, now: f64) -> f64 {
        self.elapsed_at(now)
    }

    /// 时间轴
    pub fn timeline(&self) -> &CompiledTimeline {
        &self.timeline
    }

    /// 条目状态
    pub fn stage_state(&self, id: &str) -> Option<StageState> {
        self.timeline
            .entries()
            .iter()
            .position(|e| e.id == id)
            .map(|i| self.stages[i])
    }

    /// 是否正在播放
    pub fn is_playing(&self) -> bool {
        self.state == ClockState::Playing
    }

    /// 是否已完成
    pub fn is_finished(&self) -> bool {
        self.state == ClockState::Finished
    }
}

fn phase_of(entry: &TimelineEntry, t: f64, forward: bool) -> Phase {
    if forward {
        if t < entry.start {
            Phase::Before
        } else if t >= entry.end {
            Phase::After
        } else {
            Phase::Inside
        }
    } else if t > entry.end {
        Phase::Before
    } else if t <= entry.start {
        Phase::After
    } else {
        Phase::Inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(duration: f64) -> CompiledTimeline {
        CompiledTimeline::from_entries(vec![TimelineEntry::new("a", 0.0, duration)], None)
    }

    fn progress_of(events: &[ClockEvent], id: &str) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| match e {
                ClockEvent::StageProgress { id: i, progress } if i == id => Some(*progress),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_stage_lifecycle() {
        let mut clock = PlaybackClock::new(single(100.0));
        assert!(clock.tick(0.0).is_empty());

        clock.play(0.0);
        let events = clock.tick(0.0);
        assert_eq!(
            events,
            vec![
                ClockEvent::StageStarted { id: "a".to_string() },
                ClockEvent::StageProgress {
                    id: "a".to_string(),
                    progress: 0.0
                },
            ]
        );

        assert_eq!(progress_of(&clock.tick(50.0), "a"), vec![0.5]);

        let events = clock.tick(120.0);
        assert_eq!(
            events,
            vec![
                ClockEvent::StageProgress {
                    id: "a".to_string(),
                    progress: 1.0
                },
                ClockEvent::StageFinished { id: "a".to_string() },
                ClockEvent::CycleCompleted { cycle: 0 },
                ClockEvent::Finished,
            ]
        );
        assert!(clock.is_finished());
        assert!(clock.tick(200.0).is_empty());
    }

    #[test]
    fn test_skipped_stage_still_gets_final_update() {
        let timeline = CompiledTimeline::from_entries(
            vec![
                TimelineEntry::new("a", 0.0, 10.0),
                TimelineEntry::new("b", 200.0, 10.0),
            ],
            None,
        );
        let mut clock = PlaybackClock::new(timeline);
        clock.play(0.0);
        let events = clock.tick(50.0);
        assert_eq!(events[0], ClockEvent::StageStarted { id: "a".to_string() });
        assert_eq!(progress_of(&events, "a"), vec![1.0]);
        assert_eq!(clock.stage_state("a"), Some(StageState::Finished));
        assert_eq!(clock.stage_state("b"), Some(StageState::Idle));
    }

    #[test]
    fn test_pause_resume() {
        let mut clock = PlaybackClock::new(single(100.0));
        clock.play(0.0);
        clock.tick(40.0);
        clock.pause(40.0);
        assert!(clock.tick(90.0).is_empty());
        assert_eq!(clock.elapsed(90.0), 40.0);

        clock.resume(100.0);
        assert_eq!(progress_of(&clock.tick(110.0), "a"), vec![0.5]);
    }

    #[test]
    fn test_rate_change_is_not_retroactive() {
        let mut clock = PlaybackClock::new(single(1000.0));
        clock.play(0.0);
        clock.tick(50.0);
        clock.set_rate(2.0, 50.0);
        assert_eq!(clock.elapsed(60.0), 70.0);

        clock.set_rate(-1.0, 60.0);
        assert_eq!(clock.rate(), 2.0);
    }

    #[test]
    fn test_repeat_alternate_finishes_once() {
        let mut clock = PlaybackClock::new(single(100.0))
            .with_repeat(Repeat::Times(1))
            .with_alternate(true);
        clock.play(0.0);
        clock.tick(10.0);

        let events = clock.tick(150.0);
        assert!(events.contains(&ClockEvent::CycleCompleted { cycle: 0 }));
        // 反向周期：局部时间 100 - 50
        assert_eq!(progress_of(&events, "a").last().copied(), Some(0.5));
        assert_eq!(clock.cycle(), 1);

        let events = clock.tick(180.0);
        assert_eq!(progress_of(&events, "a"), vec![0.2]);

        let events = clock.tick(250.0);
        let finished = events.iter().filter(|e| **e == ClockEvent::Finished).count();
        assert_eq!(finished, 1);
        assert!(clock.tick(300.0).is_empty());
    }

    #[test]
    fn test_infinite_repeat_keeps_playing() {
        let mut clock = PlaybackClock::new(single(10.0)).with_repeat(Repeat::Infinite);
        clock.play(0.0);
        let events = clock.tick(35.0);
        let cycles = events
            .iter()
            .filter(|e| matches!(e, ClockEvent::CycleCompleted { .. }))
            .count();
        assert_eq!(cycles, 3);
        assert!(clock.is_playing());
    }

    #[test]
    fn test_continuations() {
        let timeline = CompiledTimeline::from_entries(
            vec![
                TimelineEntry::new("a", 0.0, 50.0),
                TimelineEntry::new("b", 50.0, 50.0),
            ],
            None,
        );
        let mut clock = PlaybackClock::new(timeline);
        let mid = clock.continuation_at(30.0);
        let end_a = clock.on_stage_end("a").unwrap();
        assert!(clock.on_stage_end("missing").is_none());

        clock.play(0.0);
        assert!(!clock.tick(20.0).contains(&ClockEvent::Continuation(mid)));
        assert!(clock.tick(30.0).contains(&ClockEvent::Continuation(mid)));
        let events = clock.tick(60.0);
        assert!(events.contains(&ClockEvent::Continuation(end_a)));
        assert!(!events.contains(&ClockEvent::Continuation(mid)));
        assert_eq!(clock.pending_continuations(), 0);
    }

    #[test]
    fn test_cancel_clears_continuations() {
        let mut clock = PlaybackClock::new(single(100.0));
        clock.continuation_at(90.0);
        clock.play(0.0);
        clock.tick(10.0);
        clock.cancel();
        assert_eq!(clock.state(), ClockState::Cancelling);
        assert_eq!(clock.pending_continuations(), 0);

        assert_eq!(clock.tick(20.0), vec![ClockEvent::Cancelled]);
        assert_eq!(clock.state(), ClockState::Idle);
        assert!(clock.tick(95.0).is_empty());
    }

    #[test]
    fn test_empty_timeline_finishes_on_first_tick() {
        let mut clock = PlaybackClock::new(CompiledTimeline::default());
        clock.play(0.0);
        let events = clock.tick(0.0);
        assert_eq!(events.last(), Some(&ClockEvent::Finished));
    }

    #[test]
    fn test_finish_now() {
        let mut clock = PlaybackClock::new(single(100.0));
        clock.play(0.0);
        clock.tick(10.0);
        let events = clock.finish_now();
        assert_eq!(progress_of(&events, "a"), vec![1.0]);
        assert_eq!(events.last(), Some(&ClockEvent::Finished));
        assert!(clock.is_finished());
    }
}
