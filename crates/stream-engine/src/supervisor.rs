use std::{sync::Arc, time::Duration};

use axum_server::tls_rustls::RustlsConfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    api::{router, AppState},
    config::Config,
    directory::StreamDirectory,
    extractor::ExtractorAdapter,
    pipeline::PipelineOrchestrator,
    reaper::Reaper,
    registry::ProcessRegistry,
    transcoder::TranscoderAdapter,
};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);
const STREAM_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Wires every component together and drives the process lifecycle: starts
/// the TLS and cleartext-redirect listeners, runs the reaper in the
/// background, and tears everything down cleanly on a shutdown signal.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let directory = Arc::new(StreamDirectory::new(STREAM_TIMEOUT));
    let registry = Arc::new(ProcessRegistry::new());
    let extractor = Arc::new(ExtractorAdapter::new(config.ytdlp_path.clone(), config.dev_mode));
    let transcoder = Arc::new(TranscoderAdapter::new("ffmpeg"));
    let pipeline = Arc::new(PipelineOrchestrator::new(
        extractor,
        transcoder,
        directory.clone(),
        registry.clone(),
        config.streams_dir.clone(),
    ));

    let state = AppState {
        directory: directory.clone(),
        pipeline,
        streams_dir: config.streams_dir.clone(),
    };
    let app = router(state, config.static_dir.clone());

    let cancel = CancellationToken::new();

    let reaper_cancel = cancel.clone();
    let reaper_directory = directory.clone();
    let reaper_registry = registry.clone();
    let reaper_streams_dir = config.streams_dir.clone();
    let reaper_handle = tokio::spawn(async move {
        let reaper = Reaper::new(reaper_directory, Duration::from_secs(30));
        reaper
            .run(reaper_cancel.clone(), move |stream_id| {
                let registry = reaper_registry.clone();
                let streams_dir = reaper_streams_dir.clone();
                let cancel = reaper_cancel.clone();
                async move {
                    registry.cleanup_stream(&stream_id, &cancel).await;
                    let dir = streams_dir.join(&stream_id);
                    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(stream_id, error = %e, "failed to remove expired stream directory");
                        }
                    }
                    telemetry::metrics::STREAMS_EXPIRED_TOTAL.inc();
                }
            })
            .await;
    });

    let tls_config = RustlsConfig::from_pem_file(&config.tls_cert_file, &config.tls_key_file)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "failed to load TLS material from {} / {}: {e}",
                config.tls_cert_file.display(),
                config.tls_key_file.display()
            )
        })?;

    let tls_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.tls_port));
    let https_handle = axum_server::Handle::new();
    let https_server = axum_server::bind_rustls(tls_addr, tls_config)
        .handle(https_handle.clone())
        .serve(app.clone().into_make_service());

    let http_port = config.http_port;
    let tls_port = config.tls_port;
    let redirect_addr = std::net::SocketAddr::from(([0, 0, 0, 0], http_port));
    let redirect_handle = axum_server::Handle::new();
    let redirect_app = axum::Router::new().fallback(move |req: axum::extract::Request| {
        redirect_to_https(req, tls_port)
    });
    let redirect_server = axum_server::bind(redirect_addr)
        .handle(redirect_handle.clone())
        .serve(redirect_app.into_make_service());

    info!(addr = %tls_addr, "https listener starting");
    info!(addr = %redirect_addr, "http redirect listener starting");

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = https_server => {
            if let Err(e) = result {
                error!(error = %e, "https server exited");
            }
        }
        result = redirect_server => {
            if let Err(e) = result {
                error!(error = %e, "http redirect server exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received (ctrl-c)");
        }
        _ = sigterm.recv() => {
            info!("shutdown signal received (sigterm)");
        }
    }

    https_handle.graceful_shutdown(Some(SHUTDOWN_DEADLINE));
    redirect_handle.graceful_shutdown(Some(SHUTDOWN_DEADLINE));

    cancel.cancel();
    reaper_handle.abort();

    registry.cleanup_all(&CancellationToken::new()).await;
    for id in directory.ids() {
        let dir = config.streams_dir.join(&id);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    info!("shutdown complete");
    Ok(())
}

async fn redirect_to_https(req: axum::extract::Request, tls_port: u16) -> axum::response::Redirect {
    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let hostname = host.split(':').next().unwrap_or(host);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    axum::response::Redirect::temporary(&format!("https://{hostname}:{tls_port}{path_and_query}"))
}
