use anyhow::{Context, Result};
use clap::Parser;
use sockstun_tunnel::{init_logging, Config, Tunnel};
use std::os::fd::RawFd;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};

/// sockstun - relay a tun device through a SOCKS5 proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "tproxy.conf")]
    config: String,

    /// Already-open tun descriptor inherited from the parent process
    #[arg(short, long)]
    fd: Option<RawFd>,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,
}

async fn wait_for_signal() {
    use futures::StreamExt;
    match signal_hook_tokio::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ]) {
        Ok(mut signals) => {
            signals.next().await;
        }
        Err(e) => {
            error!("cannot install signal handlers: {}", e);
            futures::future::pending::<()>().await;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config))?;

    if args.test_config {
        println!("Configuration test passed!");
        return Ok(());
    }

    init_logging(&config.misc)?;

    let fd = args.fd.context("--fd is required to run the tunnel")?;
    let tunnel = Arc::new(Tunnel::init(fd, config)?);

    let (done_tx, done_rx) = oneshot::channel();
    let runner = {
        let tunnel = Arc::clone(&tunnel);
        std::thread::Builder::new()
            .name("sockstun".into())
            .spawn(move || {
                let result = tunnel.run();
                let _ = done_tx.send(());
                result
            })?
    };

    info!("tunnel running on fd {}, press Ctrl+C to stop", fd);

    tokio::select! {
        _ = wait_for_signal() => {
            info!("shutting down");
            tunnel.stop()?;
        }
        _ = done_rx => {}
    }

    let outcome = runner
        .join()
        .map_err(|_| anyhow::anyhow!("tunnel thread panicked"))?;

    println!("{}", tunnel.stats_snapshot());
    tunnel.fini()?;
    outcome?;
    Ok(())
}
