use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

use clap::Parser;
use rtsp_relay::{Config, RelayError, Server};

#[derive(Parser)]
#[command(
    name = "rtsp-relayd",
    about = "RTSP relay server: live publishers fanned out to RTP subscribers"
)]
struct Args {
    /// Path to a JSON configuration file; defaults apply when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(long)]
    bind: Option<String>,

    /// Override the configured listen port
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match args.config {
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::from(1);
            }
        },
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.listen_address = bind;
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }

    let mut server = Server::new(config);
    if let Err(e) = server.start() {
        eprintln!("{}", e);
        return match e {
            RelayError::Config(_) => ExitCode::from(1),
            _ => ExitCode::from(2),
        };
    }

    // Block until SIGINT/SIGTERM, then shut down cleanly.
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    }) {
        tracing::error!(error = %e, "failed to install signal handler");
        server.stop();
        return ExitCode::from(1);
    }

    let _ = shutdown_rx.recv();
    tracing::info!("shutdown signal received");
    server.stop();
    ExitCode::SUCCESS
}
