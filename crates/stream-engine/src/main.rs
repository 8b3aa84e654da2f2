use stream_engine::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    telemetry::init_with_service("stream-engine");

    if let Err(e) = stream_engine::supervisor::run(config).await {
        tracing::error!(error = %e, "stream-engine exited with an error");
        std::process::exit(1);
    }

    Ok(())
}
