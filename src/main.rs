use std::sync::Arc;

use audio_extract_rs::{
    config::ServerConfig, ffmpeg::FFMpegWrapper, otel, service, storage::Workspace, SERVICE_NAME,
};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version = env!("CARGO_APP_VERSION"), name = SERVICE_NAME, about="Service for extracting MP3 audio from MP4 video",
    long_about = None)]
struct Args {
    /// HTTP server port
    #[arg(long, env, default_value = "5000")]
    port: u16,
    #[command(flatten)]
    server: ServerConfig,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::trace::TracerProvider as _;

    let (provider, tr_info) = otel::init_tracer()?;
    let _guard = otel::TracerGuard::new(provider.clone());
    let tracer = provider.tracer(SERVICE_NAME);
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::Layer::default().compact())
        .with(telemetry)
        .init();
    tracing::info!(info = tr_info, "tracer");
    let args = Args::parse();
    if let Err(e) = main_int(args).await {
        tracing::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn main_int(args: Args) -> anyhow::Result<()> {
    tracing::info!(name = SERVICE_NAME, "Starting HTTP service");
    tracing::info!(version = env!("CARGO_APP_VERSION"));
    tracing::info!(port = args.port);
    tracing::info!(
        max_upload_mb = args.server.max_upload_mb,
        max_concurrent = args.server.max_concurrent,
        timeout_sec = args.server.converter.convert_timeout_sec,
        "limits"
    );

    let cancel_token = CancellationToken::new();

    let mut int_stream = signal(SignalKind::interrupt())?;
    let mut term_stream = signal(SignalKind::terminate())?;
    let ct = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = int_stream.recv() => tracing::info!("Exit event int"),
            _ = term_stream.recv() => tracing::info!("Exit event term"),
        }
        tracing::debug!("sending exit event");
        ct.cancel();
    });

    let transcoder = FFMpegWrapper::new(&args.server.converter);
    match transcoder.version().await {
        Ok(v) => tracing::info!(ffmpeg = %v, "found ffmpeg"),
        Err(e) => tracing::warn!(error = %e, "ffmpeg not available, conversions will fail with 503"),
    }
    let workspace = Workspace::create(&args.server.upload_dir, &args.server.output_dir).await?;
    let service = Arc::new(service::Service::new(
        transcoder,
        workspace,
        args.server.concurrency_limit(),
        cancel_token.clone(),
    ));
    let app = service::router(service, &args.server);

    let address: std::net::SocketAddr = format!("[::]:{}", args.port).parse()?;
    tracing::info!(address = format!("{:?}", address), "address");
    let listener = tokio::net::TcpListener::bind(address).await?;

    let ct = cancel_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
        })
        .await?;

    tracing::info!("Service stopped");
    Ok(())
}
