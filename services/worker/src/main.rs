use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vidtrack_worker::{
    resolve_queue_url, Config, FramePipeline, GstDecoder, GstEncoder, LeaseManager,
    LeaseSettings, OnnxTracker, PipelineSettings, RetryPolicy, S3Gateway, SqsQueue, Worker,
    WorkerSettings,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.logging.level, &config.logging.format);

    info!(service = %config.service.name, "Starting Vidtrack worker");

    config.validate().context("Invalid configuration")?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.aws.region.clone()))
        .load()
        .await;

    let queue_url = resolve_queue_url(&sdk_config, &config.aws, &config.queue)
        .await
        .context("Failed to resolve queue URL")?;

    let retry = RetryPolicy::from(&config.retry);
    let queue = SqsQueue::new(&sdk_config, &config.aws, queue_url.clone());
    let leases = LeaseManager::new(queue, LeaseSettings::from(&config.queue), retry.clone());
    let store = S3Gateway::new(&sdk_config, &config.aws, &config.storage, retry);

    let tracker = OnnxTracker::load(&config.model).context("Failed to load detection model")?;
    if config.model.use_gpu && tracker.device() == "cpu" {
        warn!("GPU requested but the model runs on CPU");
    }

    let pipeline = FramePipeline::new(
        GstDecoder::new(config.pipeline.decode_timeout())
            .context("Failed to initialize video decoder")?,
        GstEncoder::new().context("Failed to initialize video encoder")?,
        PipelineSettings::from(&config.pipeline),
    );

    let mut worker = Worker::new(
        leases,
        store,
        tracker,
        pipeline,
        WorkerSettings::from(&config),
    );

    info!(queue_url = %queue_url, "Polling for messages");

    // An in-flight message is left for redelivery when the loop is dropped
    tokio::select! {
        _ = worker.run() => {}
        _ = shutdown_signal() => {}
    }

    info!("Vidtrack worker stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
