mod config;
mod pool;
mod render;
mod session;
mod stats;
mod targets;
#[cfg(test)]
mod testing;
mod transport;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{EngineSettings, LoadMode, RunConfig};
use session::{Session, SessionEvent};
use targets::TargetSet;
use transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Intensity percentage; scales workers up and the delay down
    #[arg(short = 'i', long, default_value_t = 50.0)]
    intensity: f64,

    /// Number of concurrent workers at 100% intensity
    #[arg(short = 't', long, default_value_t = 10)]
    threads: usize,

    /// Base delay between requests in milliseconds
    #[arg(short = 'D', long = "delay", default_value_t = 100)]
    delay_ms: u64,

    /// Duration of the test in seconds; 0 or absent runs until Ctrl+C
    #[arg(short = 'd', long)]
    duration: Option<u64>,

    /// Timeout for each request in seconds
    #[arg(short = 'T', long)]
    timeout: Option<u64>,

    /// Probe random endpoints, or saturate the link with a large download
    #[arg(long, value_enum, default_value_t = LoadMode::Probe)]
    mode: LoadMode,

    /// Target URL; repeat to use several. Defaults depend on the mode
    #[arg(long = "url")]
    urls: Vec<String>,

    /// List the target URLs and exit
    #[arg(long)]
    list_urls: bool,

    /// Number of recent response times kept for live statistics
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..=1_000_000))]
    sample_window: u64,

    /// Milliseconds to wait for in-flight requests when stopping
    #[arg(long, default_value_t = 500)]
    grace_ms: u64,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            intensity: self.intensity,
            thread_count: self.threads,
            base_delay: Duration::from_millis(self.delay_ms),
            duration: self.duration.filter(|secs| *secs > 0).map(Duration::from_secs),
            mode: self.mode,
        }
    }

    fn settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::for_mode(self.mode);
        if let Some(secs) = self.timeout {
            settings.request_timeout = Duration::from_secs(secs);
        }
        settings.sample_window = self.sample_window as usize;
        settings.stop_grace = Duration::from_millis(self.grace_ms);
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let targets = if args.urls.is_empty() {
        TargetSet::defaults(args.mode)?
    } else {
        TargetSet::parse(args.urls.as_slice())?
    };

    if args.list_urls {
        println!("Test URLs:");
        for (i, url) in targets.iter().enumerate() {
            println!("  {}. {}", i + 1, url);
        }
        return Ok(());
    }

    let config = args.run_config();
    let settings = args.settings();
    render::print_config(&config, &targets);
    if config.is_extreme() {
        tracing::warn!("extreme settings may saturate the CPU or destabilize the network; only test networks you are allowed to");
    }

    let transport = Arc::new(HttpTransport::new(settings.request_timeout));
    let (session, mut events) = Session::new(targets, transport, settings);
    session.request_start(config).await?;

    let interrupt = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && interrupt.is_running() {
            interrupt.request_stop();
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Started { plan, active_workers } => render::print_plan(&plan, active_workers),
            SessionEvent::Live(live) => render::print_live(&live),
            SessionEvent::Finished(report) => {
                render::print_final(&report);
                break;
            }
        }
    }
    session.wait_idle().await;

    Ok(())
}
