//! Subprocess executor: runs the analysis procedure as an external command

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{ExecutionErrorKind, ExecutionFailure, Invocation, UnitExecutor};
use crate::Error;

/// Bytes of the procedure log kept as diagnostics on failure.
const DIAGNOSTIC_TAIL_BYTES: u64 = 4096;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `command` once per universe.
///
/// The parameter set reaches the procedure two ways:
///
/// - environment: `MULTIVERSE_SETTINGS` (JSON), `MULTIVERSE_UNIVERSE_ID`,
///   `MULTIVERSE_UNIVERSE_INDEX`, `MULTIVERSE_SEED`, `MULTIVERSE_ARTIFACT_PATH`,
///   and `TMPDIR` pointing at the universe's private working directory;
/// - argument placeholders: `{settings}`, `{artifact}`, `{seed}`,
///   `{universe_id}`, `{work_dir}` are substituted in every argument.
///
/// The process runs with the private working directory as its cwd, stdin
/// closed, and stdout/stderr appended to the universe's log file.
///
/// # Example
///
/// ```rust
/// use trueno_multiverse::executor::CommandExecutor;
///
/// let executor = CommandExecutor::new(["python", "universe.py", "--settings", "{settings}"])?;
/// assert_eq!(executor.program(), "python");
/// # Ok::<(), trueno_multiverse::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    poll_interval: Duration,
}

impl CommandExecutor {
    /// Executor for `command` (program followed by arguments).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `command` is empty.
    pub fn new<I, S>(command: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = command.into_iter().map(Into::into);
        let program = parts
            .next()
            .filter(|p: &String| !p.is_empty())
            .ok_or_else(|| Error::config("executor command must not be empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
            env: BTreeMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Extra environment variables for every invocation.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// How often the child is polled for exit, timeout and cancellation.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments as configured (placeholders unexpanded).
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Substitute placeholders in one pass; substituted text is never
    /// rescanned.
    fn render(arg: &str, invocation: &Invocation<'_>, settings: &str) -> String {
        let artifact = invocation.artifact_path.display().to_string();
        let seed = invocation.universe.seed().to_string();
        let work_dir = invocation.work_dir.display().to_string();
        let placeholders = [
            ("{settings}", settings),
            ("{artifact}", artifact.as_str()),
            ("{seed}", seed.as_str()),
            ("{universe_id}", invocation.universe.id().as_str()),
            ("{work_dir}", work_dir.as_str()),
        ];

        let mut out = String::with_capacity(arg.len());
        let mut rest = arg;
        while let Some(pos) = rest.find('{') {
            out.push_str(&rest[..pos]);
            rest = &rest[pos..];
            if let Some((key, value)) = placeholders.iter().find(|(key, _)| rest.starts_with(key)) {
                out.push_str(value);
                rest = &rest[key.len()..];
            } else {
                out.push('{');
                rest = &rest[1..];
            }
        }
        out.push_str(rest);
        out
    }

    fn spawn(&self, invocation: &Invocation<'_>) -> std::io::Result<Child> {
        let settings = invocation.settings().to_string();
        let log = File::create(invocation.log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| Self::render(a, invocation, &settings)))
            .current_dir(invocation.work_dir)
            .envs(&self.env)
            .env("MULTIVERSE_SETTINGS", &settings)
            .env("MULTIVERSE_UNIVERSE_ID", invocation.universe.id().as_str())
            .env(
                "MULTIVERSE_UNIVERSE_INDEX",
                invocation.universe.index().to_string(),
            )
            .env("MULTIVERSE_SEED", invocation.universe.seed().to_string())
            .env("MULTIVERSE_ARTIFACT_PATH", invocation.artifact_path)
            .env("TMPDIR", invocation.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own group, so a timeout reaches every descendant
            cmd.process_group(0);
        }
        cmd.spawn()
    }

    /// Poll until exit, timeout or cancellation.
    fn wait(&self, child: &mut Child, invocation: &Invocation<'_>) -> Result<ExitStatus, ExecutionFailure> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    kill(child);
                    return Err(ExecutionFailure::new(ExecutionErrorKind::Io, e.to_string()));
                }
            }

            if let Some(limit) = invocation.timeout {
                if started.elapsed() >= limit {
                    warn!(
                        universe = %invocation.universe.id().short(),
                        limit_secs = limit.as_secs_f64(),
                        "universe timed out, killing procedure"
                    );
                    kill(child);
                    return Err(ExecutionFailure::new(
                        ExecutionErrorKind::Timeout { limit },
                        log_tail(invocation.log_path),
                    ));
                }
            }

            if invocation.cancel.is_cancelled() {
                kill(child);
                return Err(ExecutionFailure::new(
                    ExecutionErrorKind::Interrupted,
                    log_tail(invocation.log_path),
                ));
            }

            thread::sleep(self.poll_interval);
        }
    }
}

impl UnitExecutor for CommandExecutor {
    fn execute(&self, invocation: &Invocation<'_>) -> Result<(), ExecutionFailure> {
        debug!(
            universe = %invocation.universe.id().short(),
            program = %self.program,
            "spawning procedure"
        );
        let mut child = self.spawn(invocation).map_err(|e| {
            ExecutionFailure::new(
                ExecutionErrorKind::Spawn,
                format!("failed to start '{}': {e}", self.program),
            )
        })?;

        let status = self.wait(&mut child, invocation)?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecutionFailure::new(
                ExecutionErrorKind::ProcedureFailed {
                    exit_code: status.code(),
                },
                log_tail(invocation.log_path),
            ))
        }
    }
}

fn kill(child: &mut Child) {
    kill_group(child);
    // Already exited is not an error here.
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // The child leads its group, so its pid is the group id.
    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(errno) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!(pgid, %errno, "process group already gone");
    }
}

#[cfg(not(unix))]
const fn kill_group(_child: &Child) {}

/// Last [`DIAGNOSTIC_TAIL_BYTES`] of the log, lossily decoded.
fn log_tail(path: &Path) -> String {
    let read = || -> std::io::Result<String> {
        let mut file = File::open(path)?;
        let len = fs::metadata(path)?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(DIAGNOSTIC_TAIL_BYTES)))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    };
    read().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_command() {
        assert!(CommandExecutor::new(Vec::<String>::new()).is_err());
        assert!(CommandExecutor::new([""]).is_err());
    }

    #[test]
    fn test_program_and_args() {
        let exec = CommandExecutor::new(["sh", "-c", "true"]).unwrap();
        assert_eq!(exec.program(), "sh");
        assert_eq!(exec.args(), ["-c", "true"]);
    }

    #[test]
    fn test_log_tail_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut content = "x".repeat(10_000);
        content.push_str("END");
        fs::write(&path, &content).unwrap();
        let tail = log_tail(&path);
        assert_eq!(tail.len(), DIAGNOSTIC_TAIL_BYTES as usize);
        assert!(tail.ends_with("END"));
    }

    #[test]
    fn test_render_does_not_rescan_substituted_text() {
        use crate::control::CancelToken;
        use crate::dimension::DimensionSet;
        use crate::universe::UniverseGrid;

        let dims = DimensionSet::builder()
            .dimension("label", ["{seed}", "{work_dir}"])
            .build()
            .unwrap();
        let grid = UniverseGrid::enumerate(&dims);
        let universe = &grid.universes()[0];
        let cancel = CancelToken::new();
        let invocation = Invocation {
            universe,
            artifact_path: Path::new("/out/a.csv"),
            work_dir: Path::new("/out/.work/u"),
            log_path: Path::new("/out/logs/u.log"),
            timeout: None,
            cancel: &cancel,
        };
        let settings = invocation.settings().to_string();

        assert_eq!(CommandExecutor::render("{settings}", &invocation, &settings), settings);
        assert!(settings.contains(r#""label":"{seed}""#));
        assert_eq!(
            CommandExecutor::render("--seed={seed} {x} {work_dir}", &invocation, &settings),
            format!("--seed={} {{x}} /out/.work/u", universe.seed())
        );
        assert_eq!(CommandExecutor::render("{", &invocation, &settings), "{");
    }

    #[test]
    fn test_log_tail_missing_file() {
        assert_eq!(log_tail(Path::new("/nonexistent/log")), "");
    }
}
