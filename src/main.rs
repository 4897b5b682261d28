use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use esp_collection::{Collection, EspDebugger, GameType, ModFlags, PluginId, ProgressCallback, SaveFlags, StdoutDiagnostics, SUPPORTED_EXTENSIONS};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "esp_collection")]
#[command(about = "按加载顺序读取 ESP/ESM 插件，查看覆盖与冲突，重建插件文件")]
#[command(version = "0.1.0")]
struct Cli {
    /// 游戏类型（决定记录头部长度）
    #[arg(long, value_enum, default_value_t = GameArg::Skyrim)]
    game: GameArg,

    /// 静默模式(仅输出错误)
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 显示插件统计信息
    Stats {
        /// 按加载顺序排列的插件
        #[arg(required = true)]
        plugins: Vec<PathBuf>,
    },
    /// 列出存在冲突的记录
    Conflicts {
        #[arg(required = true)]
        plugins: Vec<PathBuf>,
        /// 只列出与胜出版本不一致的覆盖
        #[arg(long)]
        extended: bool,
        /// 把冲突报告写入JSON文件
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// 解析后直接重建，用于验证解析和重建逻辑
    Rebuild {
        #[arg(short, long)]
        input: PathBuf,
        /// 默认为 `<名称>_rebuilt.<扩展名>`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 生成插件结构dump
    Dump {
        #[arg(short, long)]
        input: PathBuf,
        /// 默认为 `<输入>.dump`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum GameArg {
    Oblivion,
    Fallout3,
    FalloutNv,
    Skyrim,
}

impl From<GameArg> for GameType {
    fn from(arg: GameArg) -> Self {
        match arg {
            GameArg::Oblivion => GameType::Oblivion,
            GameArg::Fallout3 => GameType::Fallout3,
            GameArg::FalloutNv => GameType::FalloutNewVegas,
            GameArg::Skyrim => GameType::Skyrim,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match &cli.command {
        Command::Stats { plugins } => handle_stats(&cli, plugins),
        Command::Conflicts { plugins, extended, json } => handle_conflicts(&cli, plugins, *extended, json.as_deref()),
        Command::Rebuild { input, output } => handle_rebuild(&cli, input, output.clone()),
        Command::Dump { input, output } => handle_dump(&cli, input, output.clone()),
    }
}

/// 日志级别由 `ESP_LOG` 控制，默认只输出警告
fn init_logging() {
    let filter = EnvFilter::try_from_env("ESP_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// 验证输入文件
fn validate_input(input: &Path) -> Result<()> {
    if !input.exists() {
        bail!("输入文件不存在: {:?}", input);
    }

    let extension = input
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    if !SUPPORTED_EXTENSIONS.iter().any(|&ext| Some(ext) == extension.as_deref()) {
        bail!("输入文件必须是ESP或ESM文件: {:?}", input);
    }

    Ok(())
}

/// 按给定顺序把插件加入同一个集合（以第一个插件所在目录为根）并加载
fn load_collection(cli: &Cli, paths: &[PathBuf], flags: ModFlags) -> Result<(Collection, Vec<PluginId>)> {
    let first = paths.first().context("没有指定插件")?;
    for path in paths {
        validate_input(path)?;
    }
    let root = first.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut collection = Collection::new(root, cli.game.into());
    if !cli.quiet {
        collection = collection.with_diagnostics(Arc::new(StdoutDiagnostics));
    }

    let mut ids = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("无效的文件名: {:?}", path))?;
        ids.push(collection.add_plugin(name, flags)?);
    }

    let quiet = cli.quiet;
    let mut report = |position: u32, max: u32, name: &str| {
        if !quiet {
            eprintln!("[{}/{}] {}", position + 1, max + 1, name);
        }
        true
    };
    let progress: ProgressCallback<'_> = &mut report;
    collection.load(Some(progress)).context("加载插件失败")?;
    Ok((collection, ids))
}

fn handle_stats(cli: &Cli, plugins: &[PathBuf]) -> Result<()> {
    let (collection, ids) = load_collection(cli, plugins, ModFlags::empty())?;
    for id in ids {
        println!("{}", collection.plugin_stats(id)?);
    }
    Ok(())
}

fn handle_conflicts(cli: &Cli, plugins: &[PathBuf], extended: bool, json: Option<&Path>) -> Result<()> {
    let (collection, _) = load_collection(cli, plugins, ModFlags::empty())?;
    let reports = collection.all_conflicts(extended)?;

    if let Some(json_path) = json {
        let json_output = serde_json::to_string_pretty(&reports).context("序列化JSON失败")?;
        std::fs::write(json_path, json_output).with_context(|| format!("写入文件失败: {:?}", json_path))?;
        if !cli.quiet {
            println!("冲突报告已写入: {:?}", json_path);
        }
    }

    if !cli.quiet {
        println!("发现 {} 个冲突记录", reports.len());
        for report in reports.iter().take(20) {
            println!(
                "[{}] 胜出: {} | 冲突: {}",
                report.form_id,
                report.winning_plugin.as_deref().unwrap_or("<已删除>"),
                report.conflicting_plugins.join(", ")
            );
        }
        if reports.len() > 20 {
            println!("... 还有 {} 个冲突记录", reports.len() - 20);
        }
    }
    Ok(())
}

fn handle_rebuild(cli: &Cli, input: &Path, output: Option<PathBuf>) -> Result<()> {
    let output_path = output.unwrap_or_else(|| derived_path(input, "_rebuilt"));
    if !cli.quiet {
        println!("测试模式：解析并重建文件 {:?}", input);
    }

    let (mut collection, ids) = load_collection(cli, &[input.to_path_buf()], ModFlags::SAVEABLE)?;
    let written = collection.save_plugin(ids[0], SaveFlags::empty(), Some(&absolute(&output_path)?))?;

    if !cli.quiet {
        println!("重建文件输出到: {:?}", written);
        compare_file_sizes(input, &written)?;
    }
    Ok(())
}

fn handle_dump(cli: &Cli, input: &Path, output: Option<PathBuf>) -> Result<()> {
    let output_path = output.unwrap_or_else(|| input.with_extension("dump"));
    let (collection, ids) = load_collection(cli, &[input.to_path_buf()], ModFlags::empty())?;
    EspDebugger::dump_file_structure(&collection, ids[0], &output_path)?;
    if !cli.quiet {
        println!("结构dump已写入: {:?}", output_path);
    }
    Ok(())
}

/// `dir/name.ext` → `dir/name<suffix>.ext`
fn derived_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("plugin");
    let file_name = match input.extension().and_then(|e| e.to_str()) {
        Some(extension) => format!("{}{}.{}", stem, suffix, extension),
        None => format!("{}{}", stem, suffix),
    };
    input.with_file_name(file_name)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// 比较文件大小
fn compare_file_sizes(input_path: &Path, output_path: &Path) -> Result<()> {
    let original_size = std::fs::metadata(input_path)?.len();
    let rebuilt_size = std::fs::metadata(output_path)?.len();

    println!("文件大小对比:");
    println!("  原文件: {} 字节", original_size);
    println!("  重建文件: {} 字节", rebuilt_size);

    if original_size == rebuilt_size {
        println!("✓ 文件大小一致");
    } else {
        println!("⚠ 文件大小不一致，差异: {} 字节", (rebuilt_size as i64) - (original_size as i64));
    }
    Ok(())
}
