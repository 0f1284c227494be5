use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use peer_mux::{
    event_callback, log_error, log_info,
    utils::{set_global_log_handler, set_global_log_level, ConsoleLogger, LogLevel},
    Address, Connection, MemoryConnection, MemoryRelay, PeerAcceptor, PeerSession,
    PeerSessionConfig,
};

#[derive(Parser)]
#[command(name = "peer-mux", about = "Addressed peer sessions over one shared transport")]
struct Cli {
    /// debug, info, warn or error
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Print library logs as plain lines instead of going through tracing.
    #[arg(long)]
    plain_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a handshake and exchange a few envelopes over an in-process relay.
    Demo {
        #[arg(long, default_value = "alice")]
        from: Address,
        #[arg(long, default_value = "bob")]
        to: Address,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        /// Never answer the handshake, to watch it time out.
        #[arg(long)]
        silent_responder: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();
    set_global_log_level(cli.log_level);
    if cli.plain_log {
        set_global_log_handler(Box::new(ConsoleLogger));
    }

    let result = match cli.command {
        Command::Demo {
            from,
            to,
            timeout_ms,
            silent_responder,
        } => run_demo(from, to, timeout_ms, silent_responder).await,
    };

    if let Err(e) = &result {
        log_error!("Demo", "{:#}", e);
    }
    result
}

async fn run_demo(
    from: Address,
    to: Address,
    timeout_ms: u64,
    silent_responder: bool,
) -> anyhow::Result<()> {
    let config = PeerSessionConfig::default().with_timeout(Duration::from_millis(timeout_ms));
    let relay = MemoryRelay::new();

    let initiator: Arc<dyn Connection> =
        Arc::new(MemoryConnection::new(relay.clone(), from.clone()));
    let responder: Arc<dyn Connection> =
        Arc::new(MemoryConnection::new(relay.clone(), to.clone()));
    responder.connect().await?;

    let acceptor = (!silent_responder)
        .then(|| PeerAcceptor::bind(to.clone(), responder.clone(), config.clone()));

    let session = PeerSession::new(from, to, initiator.clone(), config);
    session
        .connect()
        .await
        .context("handshake with responder failed")?;
    println!("Status: {}", session.status());

    let Some(acceptor) = acceptor else {
        return Ok(());
    };
    let remote = acceptor
        .accept()
        .await
        .context("responder transport went away")?;

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    remote.on_message(event_callback(move |payload| {
        println!("Responder got message: {}", payload);
        let _ = done_tx.send(());
        async {}
    }));
    remote.on_event(
        "greeting",
        event_callback(|payload| async move {
            println!("Responder got greeting: {}", payload);
        }),
        true,
    );

    session.emit_event("greeting", json!({"text": "hello"})).await?;
    session.send(json!({"text": "how are you?"})).await?;
    done_rx.recv().await;

    session.disconnect().await?;
    // give the destroy envelope time to land
    tokio::time::sleep(Duration::from_millis(10)).await;
    log_info!("Demo", "initiator {}, responder {}", session.status(), remote.status());
    println!("Final status: {} / {}", session.status(), remote.status());

    initiator.disconnect().await?;
    responder.disconnect().await?;
    Ok(())
}
