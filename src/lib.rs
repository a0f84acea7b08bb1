pub mod chat_core;
pub mod commands;
pub mod inference;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::fmt::MakeWriter;

use chat_core::ChatController;
use commands::Command;
use inference::{CompletionClient, EnvSecret};

/// Return the platform-standard data directory for Remy.
///
/// - macOS: `~/Library/Application Support/com.remy.app/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.remy.app\`
/// - Linux: `$XDG_DATA_HOME/com.remy.app/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.remy/` only if none of the above can be resolved.
pub(crate) fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.remy.app");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".remy")
}

/// Initialize the tracing subscriber, writing logs to `remy.log` in the data
/// directory.
///
/// Previous logs are rotated first (`remy.log.1` .. `.3`). Logs go to a file
/// rather than stderr so they never interleave with the streamed reply.
fn init_tracing() -> anyhow::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let log_path = log_dir.join("remy.log");
    if let Err(e) = rotate_log_file(&log_path, KEPT_LOGS) {
        eprintln!("remy: could not rotate {}: {e}", log_path.display());
    }

    let log_file = LogFile::open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("remy=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== Remy starting ==="
    );

    Ok(log_path)
}

/// Old logs kept next to the live one.
const KEPT_LOGS: u32 = 3;

/// Path of the `n`th old log: `remy.log` becomes `remy.log.n`.
fn log_generation(base_path: &Path, n: u32) -> PathBuf {
    let mut name = base_path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift `remy.log` to `remy.log.1`, `.1` to `.2` and so on, dropping
/// whatever would land past `.{keep}`. Gaps in the chain are fine.
fn rotate_log_file(base_path: &Path, keep: u32) -> io::Result<()> {
    if keep == 0 {
        return remove_if_present(base_path);
    }

    remove_if_present(&log_generation(base_path, keep))?;
    for n in (1..keep).rev() {
        let older = log_generation(base_path, n);
        if older.exists() {
            fs::rename(&older, log_generation(base_path, n + 1))?;
        }
    }
    if base_path.exists() {
        fs::rename(base_path, log_generation(base_path, 1))?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Append-only log file shared by every tracing writer. Each record is
/// flushed as it is written so a crash loses nothing already logged.
#[derive(Clone)]
struct LogFile(Arc<Mutex<File>>);

impl LogFile {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self(Arc::new(Mutex::new(file))))
    }

    fn file(&self) -> MutexGuard<'_, File> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file();
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file().flush()
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run the terminal chat loop.
///
/// Reads one line per turn from stdin. Replies are printed by a separate task
/// subscribed to the controller's turn events, so text appears as it streams.
pub async fn run() -> anyhow::Result<()> {
    // Tracing first, so config loading is logged
    let log_path = init_tracing()?;

    let cwd = std::env::current_dir().unwrap_or_default();
    let config =
        inference::config::load_or_default(&cwd).context("failed to load configuration")?;
    let secrets = EnvSecret::new(config.api_key_env.clone());
    let client =
        CompletionClient::new(config, &secrets).context("failed to create completion client")?;
    let controller = Arc::new(ChatController::new(client));

    let printer = tokio::spawn(commands::print_events(controller.subscribe()));

    eprintln!(
        "remy {}: {} (log: {})",
        env!("CARGO_PKG_VERSION"),
        commands::HELP,
        log_path.display()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Quit => break,
            Command::Help => eprintln!("{}", commands::HELP),
            Command::Retry => {
                controller.retry_last_turn().await;
            }
            Command::ClearError => controller.clear_error(),
            Command::Reset => match controller.reset_conversation() {
                Ok(()) => eprintln!("(new conversation)"),
                Err(e) => eprintln!("cannot reset: {e}"),
            },
            Command::Send(text) => {
                controller.send_turn(text).await;
            }
        }
    }

    printer.abort();
    tracing::info!("=== Remy exiting ===");
    Ok(())
}
