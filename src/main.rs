//! Facial Emotion Service
//!
//! Estimates discrete emotion, valence and arousal for the first face in an
//! image. Face localization runs on OpenVINO, the emotion network on candle.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use emoface::config::Config;
use emoface::error::StartupError;
use emoface::engine::{
    device::{open_or_cpu, probe_for_policy},
    weights::weights_path_for,
    select_device, ComputeDevice, EmoNetBuilder, ModelHandle, OpenVinoRuntime, ScrfdLocalizer,
};
use emoface::service::EmotionService;
use emoface::api::rest::{AppState, create_rest_router};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let loaded = Config::load(Config::default_path());
    let config = loaded.as_ref().cloned().unwrap_or_default();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .with_target(false)
        .init();

    info!("Starting Facial Emotion Service v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = &loaded {
        info!("Using default config ({})", e);
    }

    info!("Configuration loaded:");
    info!("  Port: {}", config.server.port);
    info!("  Device policy: {}", config.inference.device);
    info!("  Classes: {}", config.inference.class_count);
    info!("  Weights: {}", config.models.weights_dir.display());

    // Select and open the compute device, once
    let selected = select_device(probe_for_policy(&config.inference.device).as_ref());
    let (device, candle_device) = open_or_cpu(selected);
    if device == ComputeDevice::Cpu && config.inference.device.eq_ignore_ascii_case("cuda") {
        error!("CUDA was requested but the emotion model runs on CPU");
    }

    // Load the emotion model
    let weights_path = weights_path_for(&config.models.weights_dir, config.inference.class_count);
    let model = ModelHandle::load(
        &weights_path,
        device,
        candle_device,
        config.inference.class_count,
        config.inference.image_size,
        &EmoNetBuilder::default(),
    )?;
    info!("Emotion model weights: {}", model.weights_path().display());

    // Load the face detector
    let runtime = OpenVinoRuntime::new(&config.inference.detector_device)?;
    let localizer = ScrfdLocalizer::load(&runtime, &config.models.detector, config.inference.detector_threshold)
        .map_err(StartupError::Detector)?;
    info!(
        "Face detector on {} (confidence threshold {})",
        runtime.device(),
        localizer.confidence_threshold()
    );

    // Create emotion service
    let service = Arc::new(EmotionService::new(
        Box::new(localizer),
        model,
        config.inference.image_size,
    ));

    // Create REST router
    let app_state = Arc::new(AppState { service: service.clone() });
    let rest_router = create_rest_router(app_state, config.server.body_limit_bytes);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Facial Emotion Service is ready!");
    info!("REST: http://{}/health", addr);

    // Serve until a shutdown signal arrives
    axum::serve(listener, rest_router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received, cleaning up...");
        })
        .await?;

    // Drain in-flight predictions and release the model
    tokio::task::spawn_blocking(move || service.shutdown()).await?;

    info!("Goodbye!");
    Ok(())
}
