use anyhow::Context;
use clap::{Parser, ValueEnum};
use exaconn_transport::endpoint::{TunnelEndpoint, TunnelOptions};
use exaconn_transport::orphan::{current_parent_pid, wait_for_orphaning, DEFAULT_CHECK_INTERVAL};
use exaconn_transport::process::stats_line;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Export,
    Import,
}

/// One bulk-transport worker. Prints its proxy address on the first stdout
/// line, moves data between the database and `--file`, then prints the
/// transfer stats on the second line.
#[derive(Debug, Parser)]
#[command(name = "exaconn-tunnel", version)]
struct Args {
    #[arg(long)]
    host: String,
    #[arg(long)]
    port: u16,
    #[arg(long, value_enum)]
    mode: Mode,
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    compression: bool,
    #[arg(long)]
    encryption: bool,
    /// Parent pid to watch; the worker exits when it is re-parented.
    #[arg(long)]
    ppid: Option<u32>,
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let address = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await?
        .next()
        .with_context(|| format!("could not resolve {}", args.host))?;
    let options = TunnelOptions::new(address)
        .with_compression(args.compression)
        .with_encryption(args.encryption)
        .with_connect_timeout(Duration::from_secs(args.connect_timeout_secs));

    let endpoint = TunnelEndpoint::connect(options).await?;
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{}\n", endpoint.proxy()).as_bytes())
        .await?;
    stdout.flush().await?;

    let transfer = async {
        match args.mode {
            Mode::Export => {
                let mut file = tokio::fs::File::create(&args.file)
                    .await
                    .with_context(|| format!("could not create {}", args.file.display()))?;
                let stats = endpoint.export_to(&mut file).await?;
                file.sync_all().await?;
                anyhow::Ok(stats)
            }
            Mode::Import => {
                let mut file = tokio::fs::File::open(&args.file)
                    .await
                    .with_context(|| format!("could not open {}", args.file.display()))?;
                Ok(endpoint.import_from(&mut file).await?)
            }
        }
    };
    let watched = args.ppid.or_else(current_parent_pid);
    let orphaned = async {
        match watched {
            Some(ppid) => wait_for_orphaning(ppid, DEFAULT_CHECK_INTERVAL).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        stats = transfer => {
            let stats = stats?;
            info!(
                wire_bytes = stats.wire_bytes,
                data_bytes = stats.data_bytes,
                file = %args.file.display(),
                "transfer finished"
            );
            stdout.write_all(stats_line(&stats).as_bytes()).await?;
            stdout.flush().await?;
            Ok(())
        }
        _ = orphaned => {
            error!("parent process exited, stopping transfer");
            anyhow::bail!("orphaned")
        }
    }
}
