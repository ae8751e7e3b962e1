use clap::Parser;
use tracing_subscriber::EnvFilter;

use runqd::config::DaemonConfig;
use runqd::daemon::{unix_now, Daemon};
use runqd::error::{Result, RunqError};
use runqd::privs::Identity;
use runqd::shutdown;

#[derive(Parser, Debug)]
#[command(name = "runqd")]
#[command(about = "Deferred shell-job execution daemon")]
struct Args {
    /// Enable debug logging and stay in the foreground
    #[arg(short = 'd')]
    debug: bool,

    /// Stay in the foreground (detaching is the service manager's job)
    #[arg(short = 'f')]
    foreground: bool,

    /// Run a single scan over the spool and exit
    #[arg(short = 's')]
    one_shot: bool,

    /// Batch load-average threshold; zero or below resets to the default
    #[arg(short = 'l', value_name = "LOAD")]
    load_avg: Option<f64>,

    /// Minimum seconds between batch job starts
    #[arg(short = 'b', value_name = "SECONDS")]
    batch_interval: Option<u32>,
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(e) = run(args) {
        tracing::error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = DaemonConfig::default();
    if let Some(load) = args.load_avg {
        config.set_load_avg(load);
    }
    if let Some(interval) = args.batch_interval {
        config.batch_interval = interval;
    }
    config.one_shot = args.one_shot;
    config.debug = args.debug;

    let identity = Identity::assume(&config.service_user, &config.service_group)?;

    // The spool is the daemon's working directory; forked children count
    // on it.
    std::env::set_current_dir(&config.job_dir)
        .map_err(|e| RunqError::syscall("cannot change to job spool", e))?;

    // Installed before the first scan so one-shot runs also reap their
    // workers.
    let wakeup = shutdown::install()?;

    let mut daemon = Daemon::new(config.clone(), identity);

    if config.one_shot {
        daemon.run_once(unix_now())?;
        return Ok(());
    }

    tracing::info!(
        spool = %config.job_dir.display(),
        output = %config.output_dir.display(),
        batch_interval = config.batch_interval,
        load_avg = config.load_avg,
        foreground = args.foreground || args.debug,
        "Starting runqd"
    );
    daemon.run(&wakeup)
}
