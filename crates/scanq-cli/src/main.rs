//! scanq: service daemon and task utility.
//!
//! `scanq run` hosts the scheduler until interrupted; `scanq create-task`
//! writes a canonical task descriptor into the tasks directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scanq_core::clock::SystemClock;
use scanq_core::config::{ConfigError, ConfigFile};
use scanq_core::domain::TaskId;
use scanq_core::engine::CommandEngine;
use scanq_core::engine::device::SystemProbe;
use scanq_core::scheduler::Scheduler;

#[derive(Parser)]
#[command(
    name = "scanq",
    version,
    about = "Durable file-backed job queue for segmentation inference"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service daemon until interrupted.
    Run {
        /// JSON configuration file; built-in defaults apply when omitted.
        #[arg(long, env = "SCANQ_CONFIG")]
        config: Option<PathBuf>,

        /// Override the configured base directory.
        #[arg(long)]
        base_dir: Option<PathBuf>,

        /// Override the poll interval in seconds.
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Write a task descriptor into the tasks directory.
    CreateTask {
        /// Input scan file.
        #[arg(long)]
        input: PathBuf,

        /// Output directory for segmentation artifacts.
        #[arg(long)]
        output: PathBuf,

        /// Segmentation type: full, point, or specific.
        #[arg(long = "type", default_value = "full")]
        seg_type: String,

        /// Point coordinates as x,y,z (point mode).
        #[arg(long)]
        point: Option<String>,

        /// Target output label for point mode.
        #[arg(long)]
        label: Option<u32>,

        /// Comma-separated organ labels or names (specific mode).
        #[arg(long)]
        organs: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// Unique task identifier; generated when omitted.
        #[arg(long)]
        task_id: Option<String>,

        #[arg(long, default_value = "./scanq/tasks")]
        tasks_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        Command::Run {
            config,
            base_dir,
            interval,
        } => run(config, base_dir, interval).await,
        Command::CreateTask {
            input,
            output,
            seg_type,
            point,
            label,
            organs,
            description,
            task_id,
            tasks_dir,
        } => create_task(
            input,
            output,
            seg_type,
            point,
            label,
            organs,
            description,
            task_id,
            tasks_dir,
        ),
    }
}

async fn run(
    config_path: Option<PathBuf>,
    base_dir: Option<PathBuf>,
    interval: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = match &config_path {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    if let Some(base_dir) = base_dir {
        file.base_directory = base_dir;
    }
    if let Some(interval) = interval {
        file.check_interval = interval;
    }
    let config = Arc::new(file.resolve()?);

    let _log_guard = init_tracing(config.log_file.as_deref())?;
    config.ensure_dirs()?;

    let Some(engine_config) = &config.engine else {
        return Err(Box::new(ConfigError::MissingEngineCommand));
    };
    let engine = Arc::new(CommandEngine::from_config(engine_config));

    tracing::info!(
        base_dir = %config.base_dir.display(),
        engine = %engine_config.command,
        "scanq v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let scheduler = Scheduler::new(
        Arc::clone(&config),
        engine,
        Arc::new(SystemProbe),
        Arc::new(SystemClock),
    );

    let census = scheduler.snapshot().await?;
    tracing::info!(
        pending = census.pending,
        in_flight = census.in_flight,
        processed = census.processed,
        failed = census.failed,
        "queue census at startup"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await;
    Ok(())
}

/// Stdout logging, plus a non-blocking file layer when configured. The
/// returned guard must stay alive for the file writer to flush.
fn init_tracing(
    log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, Box<dyn std::error::Error>> {
    let env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .init();
        return Ok(None);
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "scanq.log".into());

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Ok(Some(guard))
}

#[allow(clippy::too_many_arguments)]
fn create_task(
    input: PathBuf,
    output: PathBuf,
    seg_type: String,
    point: Option<String>,
    label: Option<u32>,
    organs: Option<String>,
    description: Option<String>,
    task_id: Option<String>,
    tasks_dir: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let task_id = task_id.unwrap_or_else(|| TaskId::generate(&SystemClock).to_string());

    let mut doc = serde_json::json!({
        "task_id": task_id,
        "input_file": input,
        "output_directory": output,
        "segmentation_type": seg_type,
    });

    match seg_type.as_str() {
        "full" => {}
        "point" => {
            let point = point.ok_or("--point x,y,z is required for point segmentation")?;
            let label = label.ok_or("--label is required for point segmentation")?;
            let coordinates = parse_point(&point)?;
            doc["segmentation_prompts"] = serde_json::json!([{
                "target_output_label": label,
                "positive_points": [coordinates],
                "negative_points": [],
            }]);
        }
        "specific" => {
            let organs = organs.ok_or("--organs is required for specific segmentation")?;
            let labels: Vec<serde_json::Value> = organs
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| match s.parse::<u32>() {
                    Ok(id) => serde_json::json!(id),
                    Err(_) => serde_json::json!(s),
                })
                .collect();
            if labels.is_empty() {
                return Err("--organs must name at least one label".into());
            }
            doc["label_prompt"] = serde_json::Value::Array(labels);
        }
        other => {
            return Err(format!("unknown segmentation type: {other}").into());
        }
    }

    if let Some(description) = description {
        doc["description"] = serde_json::Value::String(description);
    }

    std::fs::create_dir_all(&tasks_dir)?;
    let task_file = tasks_dir.join(format!("{task_id}.json"));
    std::fs::write(&task_file, serde_json::to_vec_pretty(&doc)?)?;

    println!("Task file created: {}", task_file.display());
    Ok(())
}

fn parse_point(raw: &str) -> Result<[i64; 3], String> {
    let parts: Vec<i64> = raw
        .split(',')
        .map(|part| part.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("point coordinates must be integers: {e}"))?;
    match parts.as_slice() {
        [x, y, z] => Ok([*x, *y, *z]),
        _ => Err("point coordinates must be in the form x,y,z".to_string()),
    }
}
