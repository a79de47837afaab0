use anyhow::Context;
use deploy_hook::action::CommandAction;
use deploy_hook::config::Config;
use deploy_hook::deployer::Deployer;
use deploy_hook::http_server::{self, HttpSettings, ServerState};
use deploy_hook::journal::RunJournal;
use deploy_hook::telemetry;
use deploy_hook::verification::Verifier;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    telemetry::init_tracing(config.log_json);

    let journal = RunJournal::open(config.log.clone())
        .await
        .context("failed to open run journal")?;
    let action = CommandAction::new(&config.command, &config.workdir).args(config.args.clone());
    let deployer = Deployer::new(
        Arc::new(action),
        Arc::new(journal),
        config.timeout,
        config.output_limit,
    );

    if config.accept_sha256 {
        info!("accepting X-Hub-Signature-256 alongside X-Hub-Signature");
    }
    let verifier = Verifier::new(config.secret.clone()).accept_sha256(config.accept_sha256);
    let state = ServerState::new(verifier, deployer.clone()).only_branch(config.branch.clone());
    let app = http_server::router(
        state,
        &HttpSettings {
            path: config.path.clone(),
            max_body_bytes: config.max_body_bytes,
            read_timeout: config.read_timeout,
        },
    );

    let addr = SocketAddr::new(config.bind, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        path = %config.path,
        command = %config.command.display(),
        workdir = %config.workdir.display(),
        timeout_secs = config.timeout.as_secs(),
        "deploy-hook listening"
    );

    http_server::serve(listener, app, wait_for_shutdown_signal())
        .await
        .context("HTTP server failed")?;

    if deployer.is_running() {
        info!("waiting for in-flight deploy to finish");
        let grace = deployer.timeout().saturating_add(Duration::from_secs(5));
        if tokio::time::timeout(grace, deployer.wait_idle()).await.is_err() {
            warn!("in-flight deploy did not finish before exit");
        }
    }
    info!("deploy-hook stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C stops the server");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}
