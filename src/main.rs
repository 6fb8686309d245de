use anyhow::Context;
use property_uploader::{
    logging,
    uploader::{FolderScanner, ScanOptions},
    AppConfig, BatchId, CappedRetry, LocalBlobStore, Scheduler, TaskStatusView, TimestampedEvent,
    UploadEvent, UploadTask, UploadTaskStatus,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

const USAGE: &str = "用法: property-uploader <entity-id> <folder> [config.toml]";

/// 未指定配置文件时使用的路径
const DEFAULT_CONFIG_PATH: &str = "config/uploader.toml";

struct CliArgs {
    entity_id: String,
    folder: PathBuf,
    config_path: Option<PathBuf>,
}

impl CliArgs {
    fn parse() -> Option<Self> {
        let mut args = std::env::args().skip(1);
        let entity_id = args.next()?;
        let folder = PathBuf::from(args.next()?);
        let config_path = args.next().map(PathBuf::from);
        if args.next().is_some() {
            return None;
        }
        Some(Self {
            entity_id,
            folder,
            config_path,
        })
    }
}

/// 批次结果汇总（输出到标准输出）
#[derive(Debug, Serialize)]
struct BatchSummary {
    batch_id: BatchId,
    entity_id: String,
    total: usize,
    completed: usize,
    failed: usize,
    tasks: Vec<TaskStatusView>,
}

impl BatchSummary {
    fn new(batch_id: BatchId, entity_id: String, tasks: &[UploadTask]) -> Self {
        let count = |status: UploadTaskStatus| tasks.iter().filter(|t| t.status == status).count();
        Self {
            batch_id,
            entity_id,
            total: tasks.len(),
            completed: count(UploadTaskStatus::Completed),
            failed: count(UploadTaskStatus::Failed),
            tasks: tasks.iter().map(UploadTask::status_view).collect(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let Some(args) = CliArgs::parse() else {
        eprintln!("{}", USAGE);
        return Ok(ExitCode::from(2));
    };

    let config = match &args.config_path {
        Some(path) => AppConfig::load_from_file(path)
            .await
            .with_context(|| format!("加载配置失败: {}", path.display()))?,
        None => load_default_config().await,
    };

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("Property Uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let store = LocalBlobStore::new(&config.storage.root_dir, &config.storage.public_base_url)
        .await
        .context("初始化本地存储失败")?;
    let scheduler =
        Scheduler::new(&config.scheduler, Arc::new(store)).context("创建上传调度器失败")?;

    let scanner = FolderScanner::with_options(
        ScanOptions::from_config(&config.scan, config.scheduler.max_file_size),
        config.scheduler.content_policy()?,
    );
    let sources = scanner.scan_sources(&args.folder).await?;
    if sources.is_empty() {
        anyhow::bail!("文件夹中没有可上传的图片: {}", args.folder.display());
    }

    tokio::spawn(log_events(scheduler.subscribe()));

    let receipt = scheduler
        .submit_batch(args.entity_id.clone(), sources)
        .context("提交上传批次失败")?;

    let capped = CappedRetry::new(scheduler.clone(), config.scheduler.max_retries);
    let mut tasks = scheduler.wait_batch(receipt.batch_id).await?;
    loop {
        let requeued = capped.retry_failed(receipt.batch_id)?;
        if requeued.is_empty() {
            break;
        }
        info!("重试失败的任务: {} 个", requeued.len());
        tasks = scheduler.wait_batch(receipt.batch_id).await?;
    }

    let summary = BatchSummary::new(receipt.batch_id, args.entity_id, &tasks);
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("序列化结果失败")?
    );

    if summary.failed > 0 {
        warn!(
            "批次完成，{} 个成功，{} 个失败",
            summary.completed, summary.failed
        );
        return Ok(ExitCode::FAILURE);
    }

    info!("批次完成，全部 {} 个文件上传成功", summary.completed);
    Ok(ExitCode::SUCCESS)
}

/// 读取默认配置文件，不存在时写出一份默认配置
async fn load_default_config() -> AppConfig {
    let path = Path::new(DEFAULT_CONFIG_PATH);
    let config = AppConfig::load_or_default(path).await;
    if !path.exists() {
        if let Err(e) = config.save_to_file(path).await {
            eprintln!("写入默认配置失败: {}, 错误: {:#}", path.display(), e);
        }
    }
    config
}

/// 将状态事件写入日志
async fn log_events(mut events: broadcast::Receiver<TimestampedEvent>) {
    loop {
        match events.recv().await {
            Ok(stamped) => match &stamped.event {
                UploadEvent::Progress {
                    task_id, progress, ..
                } => debug!("上传进度: task={}, {}%", task_id, progress),
                UploadEvent::Failed {
                    task_id,
                    error,
                    attempt,
                    ..
                } => warn!("上传失败: task={}, attempt={}, {}", task_id, attempt, error),
                event => info!(
                    "事件 #{}: {} task={}",
                    stamped.event_id,
                    event.event_type_name(),
                    event.task_id()
                ),
            },
            Err(RecvError::Lagged(skipped)) => warn!("事件处理过慢，跳过 {} 条", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}
