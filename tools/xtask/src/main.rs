//! # xtask - 开发辅助工具
//!
//! 提供本地质量门禁与开发辅助命令。
//!
//! ## 命令
//!
//! - `check-all`: 运行 fmt、clippy、test
//! - `cov-runtime`: 运行 motion-runtime 覆盖率
//! - `plan-check`: 检查编排文件（依赖、控制块、动画引用、时间轴）

use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

use clap::{Parser, Subcommand};
use motion_runtime::{AnimationLibrary, CommandPlan, MotionConfig, Placement, Stage, TimelineCompiler};
use serde::Deserialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "开发辅助工具")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 运行时配置文件（提供日志过滤与默认缓动）
    #[arg(long, default_value = "motion.json", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行 fmt、clippy、test 门禁检查
    CheckAll,

    /// 运行 motion-runtime 覆盖率报告
    CovRuntime,

    /// 检查编排文件
    ///
    /// 不带参数时检查 plans/ 下所有 .json 文件。
    PlanCheck {
        /// 文件或目录
        path: Option<PathBuf>,
    },
}

fn run(step: &str, cmd: &mut Command) -> anyhow::Result<()> {
    eprintln!("\n==> {step}");
    let status = cmd.status()?;
    if !status.success() {
        anyhow::bail!("{step} failed with {status}");
    }
    Ok(())
}

fn ensure_cargo_llvm_cov_available() -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["llvm-cov", "--version"]);
    match cmd.status() {
        Ok(s) if s.success() => Ok(()),
        _ => anyhow::bail!(
            "cargo llvm-cov 不可用。\n\
请先安装：\n\
  - cargo install cargo-llvm-cov\n\
  - rustup component add llvm-tools-preview\n\
然后重试。"
        ),
    }
}

fn main() -> ExitCode {
    if let Err(e) = real_main() {
        eprintln!("xtask error: {e:#}");
        return ExitCode::from(1);
    }
    ExitCode::from(0)
}

fn real_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = MotionConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match cli.command {
        Commands::CheckAll => {
            let mut fmt = Command::new("cargo");
            fmt.args(["fmt", "--all", "--", "--check"]);
            run("cargo fmt --all -- --check", &mut fmt)?;

            let mut clippy = Command::new("cargo");
            clippy.args(["clippy", "--workspace", "--all-targets"]);
            run("cargo clippy --workspace --all-targets", &mut clippy)?;

            let mut test = Command::new("cargo");
            test.args(["test", "--workspace"]);
            run("cargo test --workspace", &mut test)?;
        }
        Commands::CovRuntime => {
            ensure_cargo_llvm_cov_available()?;

            let mut cov = Command::new("cargo");
            cov.args(["llvm-cov", "-p", "motion-runtime", "--all-features", "--html"]);
            run("cargo llvm-cov -p motion-runtime --all-features --html", &mut cov)?;

            eprintln!("\nCoverage HTML: target/llvm-cov/html/index.html");
        }
        Commands::PlanCheck { path } => plan_check(path.as_deref(), &config)?,
    }

    Ok(())
}

//=============================================================================
// plan-check 命令实现
//=============================================================================

/// 默认编排目录（相对于 workspace root）
const PLANS_DIR: &str = "plans";

/// 编排文件
///
/// ```json
/// {
///   "animations": { "fade-in": { "duration": 200, "tracks": [...] } },
///   "commands": [ { "id": "a", "type": "ANIMATE", "params": { ... } } ],
///   "stages": [ { "id": "intro", "kind": "style", ... } ],
///   "placement": { "kind": "sequential" }
/// }
/// ```
#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(default)]
    animations: AnimationLibrary,
    #[serde(default)]
    commands: Vec<motion_runtime::Command>,
    #[serde(default)]
    stages: Vec<Stage>,
    #[serde(default)]
    placement: Placement,
}

/// 单个文件的检查结果
enum FileOutcome {
    Passed { steps: usize, duration: f64 },
    Failed(String),
}

/// 执行编排检查
fn plan_check(path: Option<&Path>, config: &MotionConfig) -> anyhow::Result<()> {
    let files = match path {
        Some(p) if p.is_file() => vec![p.to_path_buf()],
        Some(p) if p.is_dir() => collect_plan_files(p),
        Some(p) => anyhow::bail!("路径不存在: {}", p.display()),
        None => {
            let dir = Path::new(PLANS_DIR);
            if !dir.exists() {
                anyhow::bail!("默认编排目录不存在: {PLANS_DIR}\n请在 workspace 根目录运行，或指定文件路径");
            }
            collect_plan_files(dir)
        }
    };

    if files.is_empty() {
        eprintln!("未找到编排文件（.json）");
        return Ok(());
    }

    eprintln!("==> 检查 {} 个编排文件...\n", files.len());

    let mut failures = 0;
    for file in &files {
        match check_plan_file(file, config) {
            FileOutcome::Passed { steps, duration } => {
                eprintln!("[OK] {}: {steps} 条命令，时间轴 {duration}ms", file.display());
            }
            FileOutcome::Failed(message) => {
                eprintln!("[ERROR] {}: {message}", file.display());
                failures += 1;
            }
        }
    }

    eprintln!("─────────────────────────────────────────────────────");
    if failures > 0 {
        eprintln!("❌ {failures} 个文件有错误");
        anyhow::bail!("编排检查发现错误");
    }
    eprintln!("✅ 检查通过，无错误");
    Ok(())
}

/// 收集目录下的所有编排文件
fn collect_plan_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

/// 检查单个编排文件
fn check_plan_file(file: &Path, config: &MotionConfig) -> FileOutcome {
    let content = match std::fs::read_to_string(file) {
        Ok(c) => c,
        Err(e) => return FileOutcome::Failed(format!("无法读取文件 - {e}")),
    };
    let plan_file: PlanFile = match serde_json::from_str(&content) {
        Ok(p) => p,
        Err(e) => return FileOutcome::Failed(format!("解析失败 - {e}")),
    };

    let plan = match CommandPlan::build(&plan_file.commands, &plan_file.animations) {
        Ok(plan) => plan,
        Err(e) => return FileOutcome::Failed(e.to_string()),
    };
    debug!(file = %file.display(), "执行计划:\n{plan}");

    let timeline = match TimelineCompiler::new()
        .with_library(&plan_file.animations)
        .with_placement(plan_file.placement)
        .with_default_easing(config.default_easing.clone())
        .compile(&plan_file.stages)
    {
        Ok(timeline) => timeline,
        Err(e) => return FileOutcome::Failed(e.to_string()),
    };
    info!(file = %file.display(), entries = timeline.entries().len(), "时间轴编译完成");

    FileOutcome::Passed {
        steps: plan.len(),
        duration: timeline.duration(),
    }
}
