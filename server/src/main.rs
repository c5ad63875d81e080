use clap::Command;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use arena_env::Config;
use arena_server::context::ApplicationContext;
use arena_server::gateway::{self, GatewayState, PortProfile};
use arena_server::recovery::{self, RecoveryContext};

fn cli() -> Command {
    Command::new("arena-server")
        .about("Authoritative arena server: match engine and lobby/escrow coordinator.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new("run").about("Run the server"))
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("run", _)) => run().await,
        _ => unreachable!(),
    }
}

async fn run() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Fatal: {}", e);
            std::process::exit(1);
        }
    };

    let file_appender =
        tracing_appender::rolling::daily(&config.storage.log_dir, "arena-server.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.storage.log_level)
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(file_writer.and(std::io::stdout))
        .init();

    if config.alert.sentry_dsn.is_some() {
        // Error reporting is collected by the external agent watching the
        // log directory; the DSN is passed through for its configuration.
        info!("Sentry DSN configured");
    }

    let (app, signal_loop) = match ApplicationContext::try_new_and_start(config).await {
        Ok(started) => started,
        Err(e) => {
            error!("Fatal init failure: {}", e);
            std::process::exit(1);
        }
    };

    // Settle what the previous process left behind before accepting
    // any traffic.
    let recovery_ctx = RecoveryContext {
        store: app.store.clone(),
        chain: app.chain.clone(),
        wallets: app.wallets.clone(),
        alerts: app.alerts.clone(),
        settlement: app.settlement.clone(),
        winner_payout: app.config.wallet.winner_payout,
        lookback_blocks: app.config.chain.reconcile_lookback_blocks,
    };
    match recovery::recover_interrupted_matches(&recovery_ctx).await {
        Ok(0) => {}
        Ok(n) => info!("Recovered {} interrupted match(es)", n),
        Err(e) => warn!("Recovery pass failed, continuing: {}", e),
    }

    let public = tokio::spawn(gateway::serve(
        GatewayState {
            app: app.clone(),
            profile: PortProfile::Public,
        },
        app.config.net.public_port,
        app.shutdown_rx.clone(),
    ));
    let admin = tokio::spawn(gateway::serve(
        GatewayState {
            app: app.clone(),
            profile: PortProfile::Admin,
        },
        app.config.net.admin_port,
        app.shutdown_rx.clone(),
    ));

    wait_for_shutdown_signal().await;
    app.shutdown().await;

    for (name, handle) in [("public", public), ("admin", admin)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} listener error: {}", name, e),
            Err(e) => error!("{} listener panicked: {}", name, e),
        }
    }
    if let Err(e) = signal_loop.await {
        error!("Signal loop join error: {}", e);
    }
    info!("Shutdown complete");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("SIGINT received");
    }
}
