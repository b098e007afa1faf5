//! 依赖解析的性质测试

use std::collections::HashSet;

use motion_runtime::{Command, GraphError, resolve};
use proptest::prelude::*;

/// 生成无环命令集：节点 i 只依赖下标更小的节点，再打乱声明顺序
fn acyclic_commands() -> impl Strategy<Value = Vec<Command>> {
    (1usize..12)
        .prop_flat_map(|n| {
            (0..n)
                .map(|i| proptest::collection::vec(any::<bool>(), i))
                .collect::<Vec<_>>()
        })
        .prop_map(|deps| {
            deps.into_iter()
                .enumerate()
                .map(|(i, mask)| {
                    mask.into_iter()
                        .enumerate()
                        .filter(|(_, on)| *on)
                        .fold(Command::wait(format!("c{i}"), 10.0), |cmd, (j, _)| {
                            cmd.after(format!("c{j}"))
                        })
                })
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

proptest! {
    #[test]
    fn plan_is_permutation_with_dependencies_first(commands in acyclic_commands()) {
        let plan = resolve(&commands).unwrap();

        prop_assert_eq!(plan.len(), commands.len());
        let ids: HashSet<&str> = plan.iter().collect();
        prop_assert_eq!(ids.len(), commands.len());

        for command in &commands {
            let at = plan.position(&command.id).unwrap();
            for dep in &command.dependencies {
                prop_assert!(plan.position(dep).unwrap() < at, "{} 应在 {} 之前", dep, command.id);
            }
        }
    }

    #[test]
    fn resolve_is_deterministic(commands in acyclic_commands()) {
        prop_assert_eq!(resolve(&commands).unwrap(), resolve(&commands).unwrap());
    }

    #[test]
    fn cycle_is_reported(ring in 2usize..6, extra in 0usize..4) {
        let mut commands: Vec<Command> = (0..ring)
            .map(|i| Command::wait(format!("r{i}"), 1.0).after(format!("r{}", (i + 1) % ring)))
            .collect();
        commands.extend((0..extra).map(|i| Command::wait(format!("x{i}"), 1.0)));

        let err = resolve(&commands).unwrap_err();
        let is_cycle = matches!(err, GraphError::CircularDependency { .. });
        prop_assert!(is_cycle);
    }
}

#[test]
fn independent_commands_keep_declaration_order() {
    let commands = vec![
        Command::wait("z", 1.0),
        Command::wait("a", 1.0),
        Command::wait("m", 1.0),
    ];
    let plan = resolve(&commands).unwrap();
    assert_eq!(plan.ids(), ["z", "a", "m"]);
}
