//! Purpose: `filebuffer` CLI entry point and command dispatch bootstrap.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON value (or JSON Lines for `pull`) on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::fs;
use std::io::{self, BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bstr::ByteSlice;
use clap::{CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod page_info_json;

use filebuffer::api::{
    Buffer, BufferConfig, DEFAULT_PAGE_SIZE, DequeueOptions, Error, ErrorKind, Page, PageHandler,
    ReadOutcome, default_cache_dir, format_millis, now_millis, parse_page_file_name, to_exit_code,
};
use page_info_json::{header_json, page_info_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `filebuffer --help`."));
            }
        },
    };

    init_tracing();
    let config = BufferConfig::new(cli.dir.unwrap_or_else(default_cache_dir))
        .with_page_size(cli.page_size);
    command_dispatch::dispatch_command(cli.command, config).map_err(add_busy_hint)
}

#[derive(Parser)]
#[command(
    name = "filebuffer",
    version,
    about = "Durable, rotating, memory-mapped page log for timestamped chunks",
    after_help = r#"EXAMPLES
  $ filebuffer push hello world
  $ filebuffer pull
  $ filebuffer pages
  $ filebuffer inspect /tmp/filebuffer/19700101T000000.000Z.page

NOTES
  - Default location: $TMPDIR/filebuffer (override with --dir)
  - Set RUST_LOG=debug to trace page rotation on stderr"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Cache directory holding the page files",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_PAGE_SIZE,
        help = "Size of each page file in bytes, header included"
    )]
    page_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Enqueue chunks",
        long_about = r#"Enqueue each argument as one chunk, or each stdin line when no argument is given."#,
        after_help = r#"EXAMPLES
  $ filebuffer push hello world
  $ filebuffer push --time 2024-05-01T12:00:00Z late
  $ printf 'a\nb\n' | filebuffer push"#
    )]
    Push {
        #[arg(long, help = "Chunk timestamp: RFC 3339 or milliseconds since the epoch (default: now)")]
        time: Option<String>,
        #[arg(help = "Chunks to enqueue")]
        chunks: Vec<String>,
    },
    #[command(
        about = "Dequeue chunks as JSON Lines",
        after_help = r#"EXAMPLES
  $ filebuffer pull
  $ filebuffer pull --from 2024-05-01T00:00:00Z --limit 10
  $ filebuffer pull --wait-ms 5000 --limit 1"#
    )]
    Pull {
        #[arg(long, help = "Start at the first page keyed at or after this time")]
        from: Option<String>,
        #[arg(long, help = "Stop after this many chunks")]
        limit: Option<usize>,
        #[arg(long, help = "Wait up to this many milliseconds for each chunk")]
        wait_ms: Option<u64>,
    },
    #[command(about = "List page files with their headers")]
    Pages,
    #[command(about = "Dump one page file's header and records")]
    Inspect {
        #[arg(help = "Path to a page file", value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ filebuffer completion bash > ~/.local/share/bash-completion/completions/filebuffer
  $ filebuffer completion zsh > ~/.zfunc/_filebuffer"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

/// Accepts RFC 3339 or a plain millisecond count.
fn parse_time(input: &str) -> Result<u64, Error> {
    let input = input.trim();
    if !input.is_empty() && input.bytes().all(|byte| byte.is_ascii_digit()) {
        return input.parse::<u64>().map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("timestamp out of range: {input}"))
                .with_source(err)
        });
    }
    let parsed = OffsetDateTime::parse(input, &Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid time: {input}"))
            .with_hint("Use RFC 3339 (2024-05-01T12:00:00Z) or milliseconds since the epoch.")
            .with_source(err)
    })?;
    u64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("time precedes the epoch: {input}"))
    })
}

fn push_chunks(config: &BufferConfig, time: Option<&str>, chunks: Vec<String>) -> Result<Value, Error> {
    let timestamp = match time {
        Some(time) => parse_time(time)?,
        None => now_millis(),
    };
    let chunks = if chunks.is_empty() {
        read_stdin_lines()?
    } else {
        chunks
    };

    let mut buffer = Buffer::open(config)?;
    let mut pushed = 0usize;
    for chunk in &chunks {
        if chunk.is_empty() {
            continue;
        }
        buffer.enqueue(chunk.as_bytes(), timestamp)?;
        pushed += 1;
    }
    buffer.close()?;
    Ok(json!({
        "pushed": pushed,
        "timestamp": timestamp,
        "time": format_millis(timestamp)?,
    }))
}

fn read_stdin_lines() -> Result<Vec<String>, Error> {
    io::stdin()
        .lock()
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read stdin")
                .with_source(err)
        })
}

fn pull_chunks(
    config: &BufferConfig,
    from: Option<&str>,
    limit: Option<usize>,
    wait_ms: Option<u64>,
) -> Result<(), Error> {
    let mut buffer = Buffer::open(config)?;
    if let Some(from) = from {
        buffer.set_read_start(parse_time(from)?);
    }
    let options = wait_ms
        .map(|wait_ms| DequeueOptions::new().with_timeout(Duration::from_millis(wait_ms)));

    let mut pulled = 0usize;
    while limit.is_none_or(|limit| pulled < limit) {
        let chunk = match &options {
            Some(options) => buffer.dequeue_wait(options)?,
            None => buffer.dequeue()?,
        };
        let Some(chunk) = chunk else {
            break;
        };
        emit_line(&json!({
            "data": chunk.to_str_lossy(),
            "len": chunk.len(),
        }));
        pulled += 1;
    }
    buffer.close()
}

fn list_pages(config: &BufferConfig) -> Result<Value, Error> {
    let handler = PageHandler::open(config)?;
    let pages = handler
        .pages()?
        .iter()
        .map(page_info_json)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "dir": handler.dir().display().to_string(),
        "page_size": handler.page_size(),
        "pages": pages,
    }))
}

fn inspect_page(path: &Path) -> Result<Value, Error> {
    let meta = fs::metadata(path).map_err(|err| {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            _ => ErrorKind::Io,
        };
        Error::new(kind).with_path(path).with_source(err)
    })?;
    let timestamp = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(parse_page_file_name);
    let capacity = meta.len() as usize;
    let page = Arc::new(Page::open(path, timestamp.unwrap_or_default(), capacity));
    let header = page.header()?;

    let mut reader = page.open_for_read()?;
    let mut records = Vec::new();
    let sealed = loop {
        let offset = reader.offset();
        match reader.read()? {
            ReadOutcome::Chunk(chunk) => records.push(json!({
                "offset": offset,
                "len": chunk.len(),
                "data": chunk.to_str_lossy(),
            })),
            ReadOutcome::Empty => break false,
            ReadOutcome::EndOfPage => break true,
        }
    };
    reader.close();

    let mut map = Map::new();
    map.insert("path".to_string(), json!(path.display().to_string()));
    if let Some(timestamp) = timestamp {
        map.insert("timestamp".to_string(), json!(timestamp));
        map.insert("time".to_string(), json!(format_millis(timestamp)?));
    }
    map.insert("capacity".to_string(), json!(capacity));
    map.insert("header".to_string(), header_json(&header));
    map.insert("sealed".to_string(), json!(sealed));
    map.insert("records".to_string(), Value::Array(records));
    Ok(Value::Object(map))
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_line(value: &Value) {
    let json = serde_json::to_string(value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::SizeMismatch => "page size mismatch".to_string(),
        ErrorKind::OutOfOrder => "timestamp out of order".to_string(),
        ErrorKind::State => "invalid page state".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(timestamp) = err.timestamp() {
        inner.insert("timestamp".to_string(), json!(timestamp));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(timestamp) = err.timestamp() {
        lines.push(format!("timestamp: {timestamp}"));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn add_busy_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Busy || err.hint().is_some() {
        return err;
    }
    err.with_hint("Another filebuffer process is writing here; stop it or use a different --dir.")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, error_json, parse_time};
    use clap::CommandFactory;
    use filebuffer::api::{Error, ErrorKind};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn time_accepts_millis_and_rfc3339() {
        assert_eq!(parse_time("1500").expect("millis"), 1_500);
        assert_eq!(
            parse_time("2023-11-14T22:13:20.123Z").expect("rfc3339"),
            1_700_000_000_123
        );
        let err = parse_time("yesterday").expect_err("bad time");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = parse_time("1969-12-31T23:59:59Z").expect_err("pre-epoch");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn error_json_carries_context() {
        let err = Error::new(ErrorKind::OutOfOrder)
            .with_message("late write")
            .with_timestamp(7)
            .with_offset(16);
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "OutOfOrder");
        assert_eq!(value["error"]["message"], "late write");
        assert_eq!(value["error"]["timestamp"], 7);
        assert_eq!(value["error"]["offset"], 16);
        assert!(value["error"].get("hint").is_none());
    }
}
