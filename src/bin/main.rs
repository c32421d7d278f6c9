use clap::{Parser, Subcommand};
use flowgen::{run_active, GeneratorConfig, Sink, SinkConfig};
use log::{error, info};
use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "flowgen")]
#[command(about = "A controllable multi-flow TCP load generator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate load towards a sink, reconfigurable over a control port
    #[command(visible_alias = "generate")]
    Client {
        /// Sink IP address to connect to
        #[arg(short = 'd', long, visible_alias = "dst")]
        ip: Ipv4Addr,

        /// Sink port to connect to
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,

        /// Number of flows to establish
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..=65535))]
        nflow: u32,

        /// Bandwidth to use in bits per second (including header overheads)
        #[arg(short, long, visible_alias = "bw", value_parser = clap::value_parser!(u32).range(1..))]
        bandwidth: u32,

        /// Interval in milliseconds at which each flow writes
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
        interval: u32,

        /// Port to listen on for control connections
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        listen: u16,

        /// Print the final stats as JSON on exit
        #[arg(short = 'J', long)]
        json: bool,
    },

    /// Accept flows and discard everything they send
    #[command(visible_alias = "sink")]
    Server {
        /// Port to listen on
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,

        /// Milliseconds to sleep between drain passes
        #[arg(long, default_value = "50", value_parser = clap::value_parser!(u64).range(1..1000))]
        nap: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Client {
            ip,
            port,
            nflow,
            bandwidth,
            interval,
            listen,
            json,
        } => {
            let config = GeneratorConfig::new(SocketAddr::from((ip, port)), listen)
                .with_flows(nflow)
                .with_bandwidth_bps(bandwidth)
                .with_interval_ms(interval);

            let stats = run_active(config).await?;
            info!(
                "final stats: {} bytes, {} full writes, {} partial writes, {} empty writes in {:.1}s ({:.2} Mbps)",
                stats.total_bytes,
                stats.packets,
                stats.partial_writes,
                stats.zero_writes,
                stats.elapsed.as_secs_f64(),
                stats.bits_per_second() / 1_000_000.0
            );
            if json {
                println!("{}", stats.to_json()?);
            }
        }

        Commands::Server { port, nap } => {
            let sink = Sink::bind(SinkConfig::new(port).with_nap(Duration::from_millis(nap))).await?;
            sink.run().await?;
        }
    }

    Ok(())
}
