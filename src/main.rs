//! Main binary entry point for postgres-reorg.

use std::process::ExitCode;

use postgres_reorg::args::{Args, get_args};
use postgres_reorg::{ReorgConfig, ReorgError, TableOutcome, cleanup, interrupt};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let args = match get_args() {
        Ok(args) => args,
        Err(e) => e.exit(),
    };
    init_tracing(&args);

    let code = match run(&args) {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            e.downcast_ref::<ReorgError>()
                .map_or(1, ReorgError::exit_code)
        }
    };
    let leftover = cleanup::sweep_remaining();
    if leftover > 0 {
        warn!("dropped temporary objects of {leftover} table(s) on exit");
    }
    ExitCode::from(code as u8)
}

fn init_tracing(args: &Args) {
    let default = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = ReorgConfig::from_args(args).map_err(ReorgError::from)?;
    interrupt::install_handler()?;
    for report in postgres_reorg::run(&config)? {
        if let Some(reason) = &report.skipped {
            info!("{}: skipped: {reason}", report.database);
            continue;
        }
        let done = report.count(|o| *o == TableOutcome::Reorganized);
        let planned = report.count(|o| *o == TableOutcome::Planned);
        let failed = report.count(|o| matches!(o, TableOutcome::Failed(_)));
        let skipped = report.count(|o| matches!(o, TableOutcome::Skipped(_)));
        if config.dry_run {
            info!("{}: {planned} table(s) would be repacked", report.database);
        } else {
            info!(
                "{}: {done} table(s) repacked, {skipped} skipped, {failed} failed",
                report.database
            );
        }
    }
    Ok(())
}
