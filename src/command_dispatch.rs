//! Purpose: Hold top-level CLI command dispatch for `filebuffer`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Helpers in `main.rs` remain the source of command business logic.

use super::*;

pub(super) fn dispatch_command(command: Command, config: BufferConfig) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "filebuffer", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Push { time, chunks } => {
            emit_json(push_chunks(&config, time.as_deref(), chunks)?);
            Ok(RunOutcome::ok())
        }
        Command::Pull {
            from,
            limit,
            wait_ms,
        } => {
            if limit == Some(0) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--limit must be at least 1")
                    .with_hint("Omit --limit to drain everything available."));
            }
            pull_chunks(&config, from.as_deref(), limit, wait_ms)?;
            Ok(RunOutcome::ok())
        }
        Command::Pages => {
            emit_json(list_pages(&config)?);
            Ok(RunOutcome::ok())
        }
        Command::Inspect { file } => {
            emit_json(inspect_page(&file)?);
            Ok(RunOutcome::ok())
        }
    }
}
