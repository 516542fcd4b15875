use anyhow::Result;
use axum::{extract::State, routing::get, Router};
use image_sentry::{
    config::Config, metrics, protocol::ImageResponse, service, CascadeEngine, ImageRequest,
    InferenceService, SentryError,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tower_http::trace::TraceLayer;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Health check endpoint
async fn health_handler(State(engine): State<Arc<CascadeEngine>>) -> &'static str {
    if engine.is_ready() {
        "OK"
    } else {
        "LOADING"
    }
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> String {
    metrics::export_metrics()
}

/// Start the health/metrics HTTP server
async fn start_metrics_server(engine: Arc<CascadeEngine>, bind_addr: String) -> Result<()> {
    let addr: std::net::SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics bind address: {}", e))?;

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(engine);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Metrics server error: {}", e))
}

/// Write flagged verdicts to stdout, one JSON object per line.
async fn write_responses(mut responses: mpsc::UnboundedReceiver<ImageResponse>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(response) = responses.recv().await {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Read requests from stdin until EOF.
async fn read_requests(requests: mpsc::UnboundedSender<ImageRequest>) -> Result<()> {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ImageRequest>(&line) {
            Ok(request) => {
                if requests.send(request).is_err() {
                    return Err(SentryError::Channel("inference service stopped".into()).into());
                }
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed request"),
        }
    }
    tracing::info!("Request stream closed");
    Ok(())
}

fn env_filter() -> Result<tracing_subscriber::EnvFilter> {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    // onnxruntime is chatty at info level
    Ok(tracing_subscriber::EnvFilter::new("info").add_directive("ort=warn".parse()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the response channel, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(env_filter()?)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting image sentry...");

    metrics::init_metrics();

    let config = Config::load()?;
    tracing::info!(
        weapons = ?config.models.weapons_path,
        pistols = ?config.models.pistols_path,
        threshold = config.detection.min_score,
        "Configuration loaded"
    );

    let engine = Arc::new(CascadeEngine::weapons_then_pistols(config.detection.clone()));

    // Requests arriving before the models are ready wait inside the engine
    {
        let engine = engine.clone();
        let config = config.clone();
        tokio::spawn(async move {
            service::load_models(&engine, &config).await;
        });
    }

    if let Some(bind) = config.metrics_bind.clone() {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(engine, bind).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        });
    }

    let service = Arc::new(InferenceService::new(engine, config.fetch.clone())?);
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(write_responses(response_rx));
    let server = tokio::spawn(service.serve(request_rx, response_tx));

    // EOF closes the request side; analyses already dispatched still finish
    let drain = async {
        read_requests(request_tx).await?;
        server.await?;
        writer.await??;
        Ok::<_, anyhow::Error>(())
    };

    tokio::select! {
        result = drain => {
            if let Err(e) = result {
                tracing::error!("Channel failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            // Pending analyses are abandoned with the runtime
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Image sentry stopped");
    Ok(())
}
