//! Trace a running guest's system calls from dom0.

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use slatrace_core::Tracer;
use slatrace_linux::{LinuxOffsets, LinuxOs, SymbolTable};
use slatrace_xen::XenDriver;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slatrace")]
#[command(about = "Stealthy guest syscall tracing over an alternate SLAT view")]
#[command(version)]
struct Cli {
    /// Name of the running guest to trace.
    guest: String,

    /// Path to the traced kernel's System.map.
    #[arg(long)]
    system_map: PathBuf,

    /// JSON profile with task_struct/mm_struct field offsets; without it,
    /// traced calls are attributed to process 0.
    #[arg(long)]
    offsets: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match trace(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "exiting");
            ExitCode::FAILURE
        }
    }
}

fn trace(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let domain_id = XenDriver::lookup_domain(&cli.guest)?
        .ok_or_else(|| format!("guest `{}` not found", cli.guest))?;
    tracing::debug!(?domain_id, guest = %cli.guest, "domain resolved");

    let driver = XenDriver::new(domain_id)?;

    let symbols = SymbolTable::from_file(&cli.system_map)?;
    tracing::debug!(symbols = symbols.len(), "symbol table loaded");

    let mut os = LinuxOs::new(symbols);
    match &cli.offsets {
        Some(path) => os = os.with_offsets(LinuxOffsets::from_file(path)?),
        None => tracing::warn!("no offsets profile, traced calls will carry pid 0"),
    }

    let tracer = Tracer::new(driver, os)?;

    // The standard terminating signals request an orderly quit through the
    // engine's own flag.
    let flag = tracer.interrupt_flag();
    for signal in [
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGALRM,
    ] {
        signal_hook::flag::register(signal, flag.clone())?;
    }

    let attached = tracer.attach_all(tracer.os().default_callbacks());
    if attached == 0 {
        return Err("no traceable syscall symbols in this kernel".into());
    }
    tracing::info!(attached, "tracing started");

    let run_result = tracer.run();

    // Best-effort teardown even after a fatal loop error; the guest must
    // keep running uninstrumented either way.
    let quit_result = tracer.quit();
    let close_result = tracer.close();

    run_result?;
    quit_result?;
    close_result?;

    Ok(())
}
