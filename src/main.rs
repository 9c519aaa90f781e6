use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dialin::config::{LineSpec, SerialSettings};
use dialin::handler::{Banner, TcpBridge};
use dialin::modem::ModemFactory;
use dialin::switchboard::{ErrorAction, LineExit, RetryPolicy, Switchboard};
use dialin::SessionHandler;

#[derive(Debug, StructOpt)]
#[structopt(about = "Answers dial-up calls on modem lines")]
struct Opt {
    /// Serial line to answer on, as PORT or PORT@BAUD
    #[structopt(long = "line", env = "DIALIN_LINES", use_delimiter = true, required = true)]
    lines: Vec<LineSpec>,

    /// Baud rate for lines that do not name one
    #[structopt(long, env = "DIALIN_BAUD_RATE", default_value = "115200")]
    baud_rate: u32,

    /// Minimum number of bytes asked for per read
    #[structopt(long, env = "DIALIN_MIN_READ", default_value = "4")]
    min_read: usize,

    /// Silence around the `+++` escape before hanging up a live call
    #[structopt(long, env = "DIALIN_ESCAPE_GUARD_MS", default_value = "1000")]
    escape_guard_ms: u64,

    /// What to do when waiting for a call fails: terminate or retry
    #[structopt(long, env = "DIALIN_ON_CALL_ERROR", default_value = "terminate")]
    on_call_error: ErrorAction,

    /// What to do when waiting for a carrier fails: terminate or retry
    #[structopt(long, env = "DIALIN_ON_CONNECT_ERROR", default_value = "retry")]
    on_connect_error: ErrorAction,

    /// Pause before waiting again after a retried failure
    #[structopt(long, env = "DIALIN_RETRY_DELAY_MS", default_value = "1000")]
    retry_delay_ms: u64,

    /// Bridge callers to this TCP address instead of greeting them
    #[structopt(long, env = "DIALIN_BRIDGE")]
    bridge: Option<String>,

    /// Text sent to callers when not bridging
    #[structopt(long, env = "DIALIN_BANNER", default_value = "Welcome! Everything you type is echoed back.")]
    banner: String,

    /// Log filter used when RUST_LOG is not set
    #[structopt(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenv::dotenv().ok();
    color_eyre::install()?;

    let opt = Opt::from_args();

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&opt.log))?;
    let fmt_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(tracing_error::ErrorLayer::default())
        .init();

    let defaults = SerialSettings {
        baud_rate: opt.baud_rate,
        min_read: opt.min_read,
        escape_guard: Duration::from_millis(opt.escape_guard_ms),
    };
    let policy = RetryPolicy {
        on_call_error: opt.on_call_error,
        on_connect_error: opt.on_connect_error,
        retry_delay: Duration::from_millis(opt.retry_delay_ms),
    };

    let handler: Arc<dyn SessionHandler> = match &opt.bridge {
        Some(address) => Arc::new(TcpBridge::new(address.as_str())),
        None => Arc::new(Banner::new(opt.banner.as_str())),
    };

    let mut switchboard = Switchboard::new(handler, policy);
    switchboard.add_lines(&ModemFactory::new(defaults), &opt.lines);
    if switchboard.is_empty() {
        color_eyre::eyre::bail!("no lines to answer on");
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutting down");
                shutdown.cancel();
            }
            Err(err) => tracing::error!(error = %err, "unable to listen for shutdown signal"),
        }
    });

    let exits = switchboard.run(cancel).await;
    for (line, exit) in &exits {
        tracing::info!(line = %line, ?exit, "line finished");
    }
    if exits.iter().all(|(_, exit)| *exit == LineExit::InitFailed) {
        color_eyre::eyre::bail!("no line could be opened");
    }
    Ok(())
}
