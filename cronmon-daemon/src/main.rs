use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cronmon_daemon::errors::CronmonError;
use cronmon_daemon::journal::{
    FileLockJournal, Journaler, MultiWriter, TracingWriter,
};
use cronmon_daemon::monitor::Monitor;
use cronmon_daemon::{default_journal_path, default_scripts_dir};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Keep services alive from cron: one executable file per service.
#[derive(Parser, Debug)]
#[command(name = "cronmon")]
#[command(author, version, about)]
struct Cli {
    /// Journal file path
    #[arg(short = 'j', long = "journal")]
    journal: Option<PathBuf>,

    /// Scripts directory path
    #[arg(short = 's', long = "scripts")]
    scripts: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print crontab entries that keep cronmon running
    Cron,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let journal_path = cli
        .journal
        .or_else(default_journal_path)
        .context("no journal path; pass -j or set a config directory")?;
    let scripts_dir = cli
        .scripts
        .or_else(default_scripts_dir)
        .context("no scripts directory; pass -s or set a config directory")?;

    // The scripts path may not exist yet, but if it does it must be a
    // directory.
    if let Ok(meta) = std::fs::metadata(&scripts_dir) {
        if !meta.is_dir() {
            bail!(CronmonError::NotADirectory(scripts_dir));
        }
    }

    match cli.command {
        Some(Command::Cron) => {
            print_crontab(&journal_path, &scripts_dir);
            Ok(())
        }
        None => run(journal_path, scripts_dir).await,
    }
}

/// Crontab lines for `cronmon cron`: start at boot, then poke every minute.
/// The every-minute entry is what makes the supervisor self-healing; it
/// exits immediately while another instance holds the journal lock.
fn print_crontab(journal: &PathBuf, scripts: &PathBuf) {
    let arg0 = std::env::args()
        .next()
        .unwrap_or_else(|| "cronmon".to_owned());
    let journal = format!("{:?}", journal.display().to_string());
    let scripts = format!("{:?}", format!("{}/", scripts.display()));

    println!("# Start cronmon immediately on startup.");
    println!("@reboot {arg0} -j {journal} -s {scripts}");
    println!("# Monitor cronmon's status every minute.");
    println!("* * * * * {arg0} -j {journal} -s {scripts}");
}

async fn run(journal_path: PathBuf, scripts_dir: PathBuf) -> anyhow::Result<()> {
    if let Some(parent) = journal_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let journal = match FileLockJournal::open(&journal_path) {
        Ok(journal) => journal,
        Err(CronmonError::LockedElsewhere) => {
            info!("cronmon is already running");
            return Ok(());
        }
        Err(err) => return Err(err).context("failed to acquire journal lock"),
    };

    // Recover the previous run before the journal starts taking new records.
    // A corrupt journal has been truncated by the time the error gets here.
    let previous = match journal.previous_state() {
        Ok(state) => Some(state),
        Err(CronmonError::UnexpectedEof) => None,
        Err(err) => {
            warn!("cannot restore previous state: {err}");
            None
        }
    };

    // Changing this combination of writers changes the journal identifier
    // and with it the status-directory hash.
    let journaler: Arc<dyn Journaler> = Arc::new(MultiWriter::new(vec![
        Box::new(journal),
        Box::new(TracingWriter::new()),
    ]));

    let mut monitor = match previous {
        Some(previous) => Monitor::restore(&scripts_dir, journaler, previous)?,
        None => Monitor::new(&scripts_dir, journaler)?,
    };

    wait_for_shutdown().await?;
    monitor.stop().await;

    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => info!("interrupted, shutting down"),
        _ = terminate.recv() => info!("terminated, shutting down"),
    }

    Ok(())
}
