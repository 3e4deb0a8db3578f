//! Locating and running the `VeertuManage` binary.
//!
//! The binary is located once, when the runner is built: first from the
//! `manage_path` key of `~/.veertu_config`, then from the well-known
//! application bundle paths. Commands stream their output to an optional
//! callback while they run.
//!
//! A SIGINT received while a command runs does not kill the tool. It only
//! sets the runner's `interrupted` flag, so the command can finish and its
//! exit code can be reinterpreted by the caller. Outside of a run SIGINT
//! keeps its default action.

use crate::config;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use signal_hook::consts::SIGINT;
use signal_hook::SigId;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// Well-known VeertuManage locations, checked in order.
pub const DEFAULT_TOOL_PATHS: [&str; 2] = [
    "/Applications/Veertu.app/Contents/SharedSupport/VeertuManage",
    "/Applications/Veertu Desktop.app/Contents/SharedSupport/VeertuManage",
];

/// Size of the buffer used to read child output.
const READ_CHUNK: usize = 4096;

/// Process-wide SIGINT bookkeeping shared by every runner.
struct SigintState {
    /// Runs in progress.
    active: usize,
    /// Set while no run is in progress; arms the default action.
    idle: Option<Arc<AtomicBool>>,
}

static SIGINT_STATE: Mutex<SigintState> = parking_lot::const_mutex(SigintState {
    active: 0,
    idle: None,
});

/// Traps SIGINT into a runner's flag for the lifetime of one run.
struct SigintTrap {
    sig_id: SigId,
}

impl SigintTrap {
    fn arm(flag: &Arc<AtomicBool>) -> Result<Self> {
        let mut state = SIGINT_STATE.lock();
        let idle = match state.idle {
            Some(ref idle) => Arc::clone(idle),
            None => {
                let idle = Arc::new(AtomicBool::new(true));
                signal_hook::flag::register_conditional_default(SIGINT, Arc::clone(&idle))?;
                state.idle = Some(Arc::clone(&idle));
                idle
            }
        };

        let sig_id = signal_hook::flag::register(SIGINT, Arc::clone(flag))?;
        state.active += 1;
        idle.store(false, Ordering::SeqCst);
        Ok(Self { sig_id })
    }
}

impl Drop for SigintTrap {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.sig_id);

        let mut state = SIGINT_STATE.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            if let Some(ref idle) = state.idle {
                idle.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Whether SIGINT currently has its default action.
#[cfg(test)]
fn sigint_is_default() -> bool {
    let state = SIGINT_STATE.lock();
    state
        .idle
        .as_ref()
        .map_or(true, |idle| idle.load(Ordering::SeqCst))
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Result of a single tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Process exit code (-1 if terminated by a signal).
    pub exit_code: i32,
    /// Captured stdout with `\r\n` normalized to `\n`.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful result with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given exit code and stderr.
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Check if the command exited with 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Something that can run VeertuManage.
///
/// [`VeertuManage`] is the real implementation; tests substitute scripted
/// runners.
pub trait CommandRunner: Send + Sync {
    /// Run the tool with `args`, streaming output chunks to `on_output`.
    ///
    /// Non-zero exit codes are returned, not raised; only a failure to
    /// launch the process is an error.
    fn run(
        &self,
        args: &[String],
        on_output: Option<&mut dyn FnMut(OutputStream, &str)>,
    ) -> Result<CommandOutput>;

    /// Whether an interrupt has been received by this runner.
    fn interrupted(&self) -> bool;
}

/// Finds the VeertuManage binary.
#[derive(Debug, Clone)]
pub struct ToolLocator {
    override_file: Option<PathBuf>,
    default_paths: Vec<PathBuf>,
}

impl Default for ToolLocator {
    fn default() -> Self {
        Self {
            override_file: config::override_file_path(),
            default_paths: DEFAULT_TOOL_PATHS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl ToolLocator {
    /// Create a locator with explicit sources.
    pub fn new(override_file: Option<PathBuf>, default_paths: Vec<PathBuf>) -> Self {
        Self {
            override_file,
            default_paths,
        }
    }

    /// Resolve the binary path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ToolNotFound`] if no source names an existing
    /// executable.
    pub fn locate(&self) -> Result<PathBuf> {
        if let Some(ref file) = self.override_file {
            if let Some(path) = config::read_manage_path(file)? {
                if is_executable(&path) {
                    tracing::info!(path = %path.display(), "using VeertuManage from config");
                    return Ok(path);
                }
                tracing::warn!(
                    path = %path.display(),
                    config = %file.display(),
                    "configured VeertuManage path does not exist, trying defaults"
                );
            }
        }

        let path = self
            .default_paths
            .iter()
            .find(|p| is_executable(p))
            .cloned()
            .ok_or(Error::ToolNotFound)?;

        tracing::info!(path = %path.display(), "VeertuManage path");
        Ok(path)
    }
}

/// Check that a path is an existing, executable file.
fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// The real VeertuManage subprocess runner.
#[derive(Debug, Clone)]
pub struct VeertuManage {
    path: PathBuf,
    interrupted: Arc<AtomicBool>,
}

impl VeertuManage {
    /// Create a runner for a known binary path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Locate the binary with the default sources.
    pub fn locate() -> Result<Self> {
        Self::locate_with(&ToolLocator::default())
    }

    /// Locate the binary with a custom locator.
    pub fn locate_with(locator: &ToolLocator) -> Result<Self> {
        Ok(Self::new(locator.locate()?))
    }

    /// Path of the binary.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the runner as interrupted.
    ///
    /// Running commands are not stopped; their failures are ignored.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn spawn_and_collect(
        &self,
        args: &[String],
        mut on_output: Option<&mut dyn FnMut(OutputStream, &str)>,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ToolLaunch(format!("{}: {}", self.path.display(), e)))?;

        let (tx, rx) = mpsc::channel::<(OutputStream, Vec<u8>)>();
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_chunks(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_chunks(stderr, OutputStream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        // Ends once both reader threads have hit EOF.
        for (stream, chunk) in rx {
            if let Some(cb) = on_output.as_deref_mut() {
                cb(stream, &String::from_utf8_lossy(&chunk));
            }
            match stream {
                OutputStream::Stdout => stdout.extend_from_slice(&chunk),
                OutputStream::Stderr => stderr.extend_from_slice(&chunk),
            }
        }

        for reader in readers {
            if reader.join().is_err() {
                tracing::warn!(tool = %self.path.display(), "output reader panicked; output may be truncated");
            }
        }

        let status = child.wait()?;

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).replace("\r\n", "\n"),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

impl CommandRunner for VeertuManage {
    fn run(
        &self,
        args: &[String],
        on_output: Option<&mut dyn FnMut(OutputStream, &str)>,
    ) -> Result<CommandOutput> {
        tracing::debug!(tool = %self.path.display(), ?args, "running VeertuManage");

        let trap = SigintTrap::arm(&self.interrupted)?;
        let result = self.spawn_and_collect(args, on_output);
        drop(trap);

        if self.interrupted() {
            tracing::info!("interrupted");
        }

        let output = result?;
        tracing::debug!(exit_code = output.exit_code, "VeertuManage finished");
        Ok(output)
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Read a pipe on a thread, sending each chunk down the channel.
fn forward_chunks<R: Read + Send + 'static>(
    mut pipe: R,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, Vec<u8>)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, ?stream, "error reading VeertuManage output");
                    break;
                }
            }
        }
    })
}
