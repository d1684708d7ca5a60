//! Portray server binary.
//!
//! Wires the full stack together: VRAM admission control, the progress bus,
//! local asset storage, HTTP collaborator clients, the pipeline worker pool,
//! and the public HTTP API. Model inference itself runs in the collaborator
//! services; this process only orchestrates them.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use portray_events::{BusConfig, BusMetrics, ProgressBus};
use portray_gateway::{serve, AppState, GatewayMetrics, RequestLimits};
use portray_gpu::{GpuMetrics, GpuResourceManager, VramBudget, DEFAULT_RESERVED_MB, DEFAULT_TOTAL_VRAM_MB};
use portray_pipeline::{
    DetectionClientConfig, HttpDetectionClient, HttpMattingClient, HttpSynthesisClient,
    MattingClientConfig, PipelineConfig, PipelineController, PipelineMetrics,
    SynthesisClientConfig, TaskRegistry, WorkerConfig, WorkerService,
};
use portray_storage::{LocalStore, StorageManager, StorageMetrics};

#[derive(Parser)]
#[command(name = "portray-server")]
#[command(about = "Portray talking-head video generation server", long_about = None)]
struct Cli {
    /// HTTP listen address
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Asset storage directory
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Total GPU VRAM in MB
    #[arg(long, default_value_t = DEFAULT_TOTAL_VRAM_MB)]
    vram_total_mb: u64,

    /// VRAM held back for driver and runtime overhead in MB
    #[arg(long, default_value_t = DEFAULT_RESERVED_MB)]
    vram_reserved_mb: u64,

    /// Person detection service endpoint
    #[arg(long, default_value = "http://127.0.0.1:9101")]
    detection_endpoint: String,

    /// Background matting service endpoint
    #[arg(long, default_value = "http://127.0.0.1:9102")]
    matting_endpoint: String,

    /// Speech synthesis service endpoint
    #[arg(long, default_value = "http://127.0.0.1:9103")]
    synthesis_endpoint: String,

    /// VRAM estimate for a detection pass in MB
    #[arg(long, default_value = "2000")]
    detection_vram_mb: u64,

    /// VRAM estimate for a matting pass in MB
    #[arg(long, default_value = "3000")]
    matting_vram_mb: u64,

    /// VRAM estimate for a synthesis render in MB
    #[arg(long, default_value = "6000")]
    synthesis_vram_mb: u64,

    /// Longest a stage waits for a VRAM grant (ms)
    #[arg(long, default_value = "30000")]
    admission_timeout_ms: u64,

    /// Overall deadline for one synthesis render (ms)
    #[arg(long, default_value = "180000")]
    synthesis_timeout_ms: u64,

    /// Submission queue capacity
    #[arg(long, default_value = "64")]
    queue_capacity: usize,

    /// Concurrent pipeline executions
    #[arg(long, default_value = "2")]
    concurrency: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("Starting Portray server");
    info!(
        listen = %cli.listen,
        data_dir = %cli.data_dir.display(),
        vram_total_mb = cli.vram_total_mb,
        concurrency = cli.concurrency,
        "configuration"
    );

    // One registry; every subsystem hangs its metrics off it and the
    // gateway's /metrics endpoint exposes the lot.
    let metrics_registry = prometheus::Registry::new();
    let gpu_metrics = Arc::new(GpuMetrics::new(&metrics_registry)?);
    let bus_metrics = Arc::new(BusMetrics::new(&metrics_registry)?);
    let storage_metrics = Arc::new(StorageMetrics::new(&metrics_registry)?);
    let pipeline_metrics = Arc::new(PipelineMetrics::new(&metrics_registry)?);
    let gateway_metrics = Arc::new(GatewayMetrics::new(&metrics_registry)?);

    let shutdown = CancellationToken::new();

    let budget = VramBudget::with_reserved(cli.vram_total_mb, cli.vram_reserved_mb);
    let gpu = GpuResourceManager::with_metrics(budget, Arc::clone(&gpu_metrics));

    let bus = ProgressBus::with_metrics(BusConfig::default(), bus_metrics);
    tokio::spawn(bus.clone().run_maintenance(shutdown.clone()));

    let storage = StorageManager::with_metrics(
        Arc::new(LocalStore::new(cli.data_dir.clone())?),
        storage_metrics,
    );

    let detector = HttpDetectionClient::new(DetectionClientConfig {
        endpoint: cli.detection_endpoint.clone(),
        ..DetectionClientConfig::default()
    })?;
    let matter = HttpMattingClient::new(MattingClientConfig {
        endpoint: cli.matting_endpoint.clone(),
        ..MattingClientConfig::default()
    })?;
    let synthesizer = HttpSynthesisClient::new(SynthesisClientConfig {
        endpoint: cli.synthesis_endpoint.clone(),
        timeout_ms: cli.synthesis_timeout_ms,
        ..SynthesisClientConfig::default()
    })?;

    let pipeline_config = PipelineConfig {
        detection_vram_mb: cli.detection_vram_mb,
        matting_vram_mb: cli.matting_vram_mb,
        synthesis_vram_mb: cli.synthesis_vram_mb,
        admission_timeout: Duration::from_millis(cli.admission_timeout_ms),
    };
    let controller = Arc::new(
        PipelineController::new(
            pipeline_config,
            gpu.clone(),
            bus.clone(),
            storage.clone(),
            Arc::new(detector),
            Arc::new(matter),
            Arc::new(synthesizer),
        )
        .with_metrics(Arc::clone(&pipeline_metrics)),
    );

    let registry = Arc::new(TaskRegistry::new());
    let worker_config = WorkerConfig {
        queue_capacity: cli.queue_capacity,
        concurrency: cli.concurrency,
        ..WorkerConfig::default()
    };
    let (worker, submitter) = WorkerService::new(
        worker_config,
        controller,
        Arc::clone(&registry),
        Some(pipeline_metrics),
    );
    tokio::spawn(worker.run(shutdown.clone()));

    let state = Arc::new(AppState {
        bus,
        gpu,
        storage,
        registry,
        submitter,
        metrics_registry,
        limits: RequestLimits::default(),
        metrics: Some(gateway_metrics),
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    info!("Press Ctrl+C to stop");
    serve(cli.listen, state, shutdown).await?;

    info!("Portray server stopped");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
