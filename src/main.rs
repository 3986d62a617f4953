use n0_error::{Result, StdResultExt};
use sap_relay::{Config, Relay, Supervisor};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let listener = TcpListener::bind(config.listen_addr())
        .await
        .std_context("failed to bind public port")?;
    info!(
        port = config.external_port,
        ws_path = %config.ws_path,
        backend = %config.backend_addr(),
        "relay listening"
    );

    let supervisor = Supervisor::new(config.clone());
    let backend = tokio::spawn(async move {
        match supervisor.run().await {
            Ok(child) => Some(child),
            Err(err) => {
                warn!("backend did not start: {err:#}");
                None
            }
        }
    });

    let relay = Relay::new(config);
    let shutdown = CancellationToken::new();
    let serve = tokio::spawn({
        let relay = relay.clone();
        let shutdown = shutdown.clone();
        async move { relay.serve(listener, shutdown).await }
    });

    tokio::signal::ctrl_c()
        .await
        .std_context("failed to listen for ctrl-c")?;
    info!("shutting down");
    shutdown.cancel();
    serve.await.anyerr()??;

    if !backend.is_finished() {
        backend.abort();
    } else if let Ok(Some(mut child)) = backend.await
        && let Err(err) = child.start_kill()
    {
        warn!("failed to stop backend: {err:#}");
    }

    let stats = relay.metrics().snapshot();
    info!(
        connections = stats.connections,
        info_requests = stats.info_requests,
        rejected = stats.rejected_requests,
        splices = stats.splices,
        failed_dials = stats.failed_dials,
        bytes_to_backend = stats.bytes_to_backend,
        bytes_to_client = stats.bytes_to_client,
        "relay stopped"
    );
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
