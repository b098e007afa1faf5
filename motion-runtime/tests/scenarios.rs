//! 端到端场景测试：经由公开 API 驱动引擎

use std::rc::Rc;

use motion_runtime::interpolation::{blend_numbers, interpolate_number};
use motion_runtime::surface::FixedResolver;
use motion_runtime::{
    AnimationDescriptor, AnimationLibrary, BlendMode, Command, CommandError, EasingFunction,
    ExecutionEvent, GraphError, Interpolator, MemorySurface, MotionConfig, Orchestrator,
    SendError, StaggerConfig, StaggerTarget, StateDefinition, SurfaceHandle, SurfaceRegistry,
    SyncGroup, SyncStrategy, SyncedAnimation, Transition, Value, distribute,
};
use serde_json::json;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("motion_runtime=debug"))
        .with_test_writer()
        .try_init();
}

fn fade(duration: f64) -> AnimationDescriptor {
    AnimationDescriptor::new(duration)
        .with_easing(EasingFunction::Linear)
        .style("opacity", 0.0, 1.0)
}

fn orchestrator() -> (Orchestrator, Rc<MemorySurface>) {
    init_logging();
    let surface = MemorySurface::new();
    let mut registry = SurfaceRegistry::new();
    registry.register("#menu", surface.clone());
    let motion = Orchestrator::new(Rc::new(registry))
        .with_library(AnimationLibrary::new().with("fade", fade(100.0)));
    (motion, surface)
}

fn initialized(strategy: SyncStrategy, items: Vec<SyncedAnimation>, duration: Option<f64>) -> SyncGroup {
    let surface: SurfaceHandle = MemorySurface::new();
    let mut group = SyncGroup::new("g", strategy);
    for item in items {
        group.add(item).unwrap();
    }
    if let Some(duration) = duration {
        group.set_duration(duration).unwrap();
    }
    group.initialize(&FixedResolver(vec![surface])).unwrap();
    group
}

#[test]
fn chained_commands_plan_in_dependency_order() {
    let (mut motion, _) = orchestrator();
    let commands = vec![
        Command::wait("C", 10.0).after("B"),
        Command::wait("A", 10.0),
        Command::wait("B", 10.0).after("A"),
    ];
    let sequence = motion.create_sequence("chain", commands).unwrap();
    assert_eq!(sequence.plan().order().ids(), ["A", "B", "C"]);

    motion.play_sequence("chain", 0.0);
    let report = motion.tick(30.0);
    let finished: Vec<_> = report
        .sequences
        .iter()
        .filter_map(|(_, e)| match e {
            ExecutionEvent::CommandFinished { id } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(finished, ["A", "B", "C"]);
}

#[test]
fn cyclic_commands_leave_no_partial_state() {
    let (mut motion, _) = orchestrator();
    motion.create_sequence("s", vec![Command::wait("ok", 10.0)]).unwrap();

    let err = motion
        .create_sequence(
            "s",
            vec![Command::wait("a", 1.0).after("b"), Command::wait("b", 1.0).after("a")],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Graph(GraphError::CircularDependency { .. })
    ));
    assert!(err.to_string().contains("circular dependency"));
    assert_eq!(motion.sequence("s").unwrap().plan().order().ids(), ["ok"]);
}

#[test]
fn clamped_lerp() {
    assert_eq!(interpolate_number(0.0, 100.0, 0.5, Some([30.0, 70.0]), &[], 0.05), 50.0);
    assert_eq!(interpolate_number(0.0, 100.0, 0.8, Some([30.0, 70.0]), &[], 0.05), 70.0);
}

#[test]
fn multiply_blend() {
    let value = blend_numbers(10.0, 20.0, 0.5, &BlendMode::Multiply);
    assert!((value - 14.142).abs() < 1e-3);

    let engine = Interpolator::new();
    let Value::Number(blended) =
        engine.blend(&Value::Number(10.0), &Value::Number(20.0), 0.5, &BlendMode::Multiply)
    else {
        panic!("应为数值");
    };
    assert!((blended - 10.0 * 2f64.sqrt()).abs() < 1e-9);
}

#[test]
fn linear_stagger_and_cap() {
    let targets: Vec<StaggerTarget> = (0..5).map(|i| StaggerTarget::new(format!("t{i}"))).collect();

    let plan = distribute(&targets, 100.0, &StaggerConfig::linear(50.0));
    assert_eq!(plan.delays(), vec![0.0, 50.0, 100.0, 150.0, 200.0]);

    let capped = distribute(
        &targets,
        100.0,
        &StaggerConfig::linear(50.0).with_max_total_duration(150.0),
    );
    let last = capped.slots.last().unwrap();
    assert!((last.delay + last.duration - 150.0).abs() < 1e-9);
    assert_eq!(capped.delays(), vec![0.0, 12.5, 25.0, 37.5, 50.0]);
}

#[test]
fn common_duration_adapts_items() {
    let items = vec![
        SyncedAnimation::new("a", "#a", fade(100.0)).adaptive(),
        SyncedAnimation::new("b", "#b", fade(250.0)).adaptive(),
        SyncedAnimation::new("c", "#c", fade(80.0)),
    ];
    let group = initialized(SyncStrategy::CommonDuration, items.clone(), None);
    assert_eq!(group.duration(), 250.0);
    assert_eq!(group.timing("a").unwrap().duration, 250.0);
    assert_eq!(group.timing("b").unwrap().duration, 250.0);
    assert_eq!(group.timing("c").unwrap().duration, 80.0);

    let group = initialized(SyncStrategy::CommonDuration, items, Some(400.0));
    assert_eq!(group.duration(), 400.0);
    assert_eq!(group.timing("a").unwrap().duration, 400.0);
    assert_eq!(group.timing("b").unwrap().duration, 400.0);
}

#[test]
fn simultaneous_end_aligns_fixed_items() {
    let items = vec![
        SyncedAnimation::new("a", "#a", fade(100.0)),
        SyncedAnimation::new("b", "#b", fade(300.0)),
        SyncedAnimation::new("c", "#c", fade(175.5)),
        SyncedAnimation::new("d", "#d", fade(50.0)).adaptive(),
    ];
    let group = initialized(SyncStrategy::SimultaneousEnd, items, None);
    let total = group.duration();
    assert_eq!(total, 300.0);

    for id in ["a", "b", "c"] {
        let timing = group.timing(id).unwrap();
        assert!((timing.start + timing.duration - total).abs() < 1e-9, "{id}");
    }
    let adaptive = group.timing("d").unwrap();
    assert_eq!((adaptive.start, adaptive.duration), (0.0, 300.0));
}

#[test]
fn concurrent_send_is_rejected() {
    let (mut motion, _) = orchestrator();
    let builder = motion
        .machine("menu", "closed")
        .with_target("#menu")
        .state(StateDefinition::new("closed"))
        .state(StateDefinition::new("open"))
        .state(StateDefinition::new("hidden"))
        .transition(Transition::new("closed", "toggle", "open").with_animation("fade"))
        .transition(Transition::new("closed", "hide", "hidden"));
    let machine = motion.register_machine(builder).unwrap();

    assert!(!machine.borrow_mut().send("toggle", json!(null), 0.0).unwrap().is_completed());
    let second = machine.borrow_mut().send("hide", json!(null), 10.0).unwrap_err();
    assert!(matches!(second, SendError::Busy { .. }));

    let report = motion.tick(100.0);
    assert_eq!(report.transitions.len(), 1);
    assert_eq!(machine.borrow().current(), "open");
    assert_eq!(machine.borrow().history().len(), 1);
}

#[test]
fn persisted_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = MotionConfig {
        persistence_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let toggle = |motion: &Orchestrator| {
        motion
            .machine("menu", "closed")
            .state(StateDefinition::new("closed"))
            .state(StateDefinition::new("open"))
            .transition(Transition::new("closed", "toggle", "open"))
            .transition(Transition::new("open", "toggle", "closed"))
    };

    let (motion, _) = orchestrator();
    let mut motion = motion.with_config(config.clone());
    let builder = toggle(&motion);
    let machine = motion.register_machine(builder).unwrap();
    machine.borrow_mut().set_data("count", json!(2));
    machine.borrow_mut().send("toggle", json!(null), 10.0).unwrap();
    machine.borrow_mut().send("toggle", json!(null), 20.5).unwrap();
    machine.borrow_mut().send("toggle", json!(null), 30.25).unwrap();
    let saved = machine.borrow().snapshot();

    let (motion, _) = orchestrator();
    let mut motion = motion.with_config(config);
    let builder = toggle(&motion);
    let restored = motion.register_machine(builder).unwrap();
    let restored = restored.borrow();
    assert_eq!(restored.current(), "open");
    assert_eq!(restored.previous(), Some("closed"));
    assert_eq!(restored.history().records(), machine.borrow().history().records());
    assert_eq!(restored.data(), machine.borrow().data());
    assert_eq!(restored.snapshot(), saved);
}
