//! telemed-sfu server binary
//!
//! Settings come from built-in defaults, then the optional TOML file, then
//! environment variables and flags.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use telemed_sfu::{SfuConfig, SfuServer};

#[derive(Parser, Debug)]
#[command(name = "telemed-sfu")]
#[command(version)]
#[command(about = "Selective forwarding media server for telemedicine calls", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Signaling listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// IP media transports listen on
    #[arg(long, env = "SFU_LISTEN_IP")]
    listen_ip: Option<IpAddr>,

    /// IP advertised to clients in ICE candidates
    #[arg(long, env = "SFU_ANNOUNCED_IP")]
    announced_ip: Option<String>,

    /// Number of media workers
    #[arg(long, env = "SFU_NUM_WORKERS")]
    num_workers: Option<usize>,

    /// Lowest RTC port
    #[arg(long, env = "SFU_RTC_MIN_PORT")]
    rtc_min_port: Option<u16>,

    /// Highest RTC port
    #[arg(long, env = "SFU_RTC_MAX_PORT")]
    rtc_max_port: Option<u16>,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn load_config(&self) -> telemed_sfu::Result<SfuConfig> {
        let mut config = match &self.config {
            Some(path) => SfuConfig::from_file(path)?,
            None => SfuConfig::default(),
        };

        if let Some(addr) = self.bind {
            config.server.bind_addr = addr;
        }
        if let Some(ip) = self.listen_ip {
            let announced = self.announced_ip.clone();
            config.webrtc_transport = config.webrtc_transport.listen_ip(ip, announced);
        } else if let Some(announced) = &self.announced_ip {
            for listen_ip in &mut config.webrtc_transport.listen_ips {
                listen_ip.announced_ip = Some(announced.clone());
            }
        }
        if let Some(n) = self.num_workers {
            config.worker.num_workers = n;
        }
        if let Some(port) = self.rtc_min_port {
            config.worker.rtc_min_port = port;
        }
        if let Some(port) = self.rtc_max_port {
            config.worker.rtc_max_port = port;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, code = e.code(), "Server stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> telemed_sfu::Result<()> {
    let config = args.load_config()?;
    tracing::info!(
        version = telemed_sfu::VERSION,
        bind = %config.server.bind_addr,
        workers = config.worker.num_workers,
        ports = %format!("{}-{}", config.worker.rtc_min_port, config.worker.rtc_max_port),
        "Starting telemed-sfu"
    );

    let server = SfuServer::new(config)?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
}
