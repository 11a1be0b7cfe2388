use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use rotup::{
    Config, Orchestrator,
    archive::log_name,
    exec::{CommandRunner, SystemRunner},
    lock::RunLock,
    platform::{self, Platform},
    progress::{ConsoleSink, LogFileSink, TeeSink},
};

use crate::args::RunArgs;

pub fn run(args: RunArgs) -> anyhow::Result<i32> {
    platform::assert_root("run")?;

    let path = Config::path_or_default(args.config.as_deref())?;
    let config = Config::load(&path)?;
    config
        .validate(Platform::current())
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    let _lock = RunLock::acquire(&config.logging_directory)?;

    let date = Local::now().date_naive();
    let log_path = config
        .logging_directory
        .join(log_name(&config.backup_filename_prefix, date));
    let log = LogFileSink::open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let mut sink = TeeSink::new().with(log);
    if !args.cron {
        sink = sink.with(ConsoleSink);
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let orchestrator = Orchestrator::new(
        platform::system_catalog(runner.clone(), config.command_timeout()),
        platform::system_attachment_manager(runner),
    );
    let result = orchestrator.run_on(&config, date, &mut sink);

    if !args.cron
        && let Some(archive) = &result.archive
    {
        println!("Archive: {}", archive.path.display());
        if let Some(digest) = &result.digest {
            println!("SHA-256: {digest}");
        }
    }
    Ok(if result.succeeded { 0 } else { 1 })
}
