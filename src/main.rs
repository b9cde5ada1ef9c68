use std::{
    io,
    path::PathBuf,
    process::ExitCode,
    sync::{atomic::AtomicBool, Arc},
};

use clap::Parser;
use tracing::{info, warn};

use rhino_rox::{
    config::{Config, RESERVED_FDS},
    memory::CountingAllocator,
    Server,
};

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

/// In-memory key-value server with prefix maps, priority queues and BM25
/// full-text search.
#[derive(Debug, Parser)]
#[command(name = "rhino-rox", version)]
struct Cli {
    /// Path to the INI configuration file.
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Logging may not be up yet, so also print plainly.
            eprintln!("rhino-rox: fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    init_logging(&config);
    adjust_open_files_limit(&mut config);

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(&shutdown)?;

    let mut server = Server::new(config, Arc::clone(&shutdown))?;
    server.write_pidfile();
    if let Some(addr) = server.local_addr() {
        info!(%addr, "ready to accept connections");
    }
    server.run()?;
    Ok(())
}

fn init_logging(config: &Config) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_target(false);

    let opened = config.log_file.as_ref().map(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| (path.clone(), err))
    });

    match opened {
        Some(Ok(file)) => {
            builder
                .with_ansi(false)
                .with_writer(move || -> Box<dyn io::Write> {
                    file.try_clone()
                        .map(|f| Box::new(f) as Box<dyn io::Write>)
                        .unwrap_or_else(|_| Box::new(io::stderr()))
                })
                .init();
        }
        Some(Err((path, err))) => {
            builder.init();
            warn!(path = %path.display(), "can't open log file, logging to stderr: {err}");
        }
        None => builder.init(),
    }
}

/// SIGTERM/SIGINT raise the shutdown flag that the server cron honors.
/// SIGHUP is neutralized (its flag is never read); the Rust runtime already
/// ignores SIGPIPE.
fn install_signal_handlers(shutdown: &Arc<AtomicBool>) -> io::Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

    signal_hook::flag::register(SIGTERM, Arc::clone(shutdown))?;
    signal_hook::flag::register(SIGINT, Arc::clone(shutdown))?;
    signal_hook::flag::register(SIGHUP, Arc::new(AtomicBool::new(false)))?;
    Ok(())
}

/// Try to raise `RLIMIT_NOFILE` to what `max_clients` needs; failing that,
/// shrink `max_clients` to what the limit allows.
fn adjust_open_files_limit(config: &mut Config) {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let wanted = (config.max_clients + RESERVED_FDS) as u64;
    let (soft, hard) = match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok(limits) => limits,
        Err(err) => {
            warn!("can't query RLIMIT_NOFILE: {err}");
            return;
        }
    };
    if soft >= wanted {
        return;
    }

    let target = wanted.min(hard);
    match setrlimit(Resource::RLIMIT_NOFILE, target, hard) {
        Ok(()) if target >= wanted => {
            info!(limit = target, "raised open files limit");
        }
        Ok(()) => {
            let reduced = (target as usize).saturating_sub(RESERVED_FDS).max(1);
            warn!(
                limit = target,
                max_clients = reduced,
                "open files limit capped by the hard limit, reducing max_clients"
            );
            config.max_clients = reduced;
        }
        Err(err) => {
            let reduced = (soft as usize).saturating_sub(RESERVED_FDS).max(1);
            warn!(
                max_clients = reduced,
                "can't raise open files limit ({err}), reducing max_clients"
            );
            config.max_clients = reduced;
        }
    }
}
