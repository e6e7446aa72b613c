//! Runs an external program over each payload, e.g. `gzip {}`.
//!
//! The payload is written to `<scratch>/<attempt id>.in`. A `{}` argument is
//! replaced by that path; without one, the file is fed to the program on
//! stdin. The result is either the program's stdout or a file next to the
//! input named `<input path><suffix>` (`gzip` writes `<input>.gz`).
//!
//! Every attempt gets its own scratch directory, removed when the attempt
//! ends whether it succeeded or not.

use std::fs::{self, File};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::{debug, warn};

use super::Transform;
use crate::executor::AttemptContext;
use crate::Error;

/// How often a running child is checked against the attempt deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest stderr excerpt carried in a transform error.
const STDERR_EXCERPT: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    Stdout,
    /// The program writes `<input path><suffix>`.
    File { suffix: String },
}

#[derive(Parser, Debug)]
#[clap(no_binary_name = true)]
struct Args {
    /// Read the result from `<input><suffix>` instead of stdout
    #[clap(short, long)]
    suffix: Option<String>,

    /// Directory holding per-attempt scratch directories
    #[clap(long)]
    scratch: Option<PathBuf>,

    /// Program and its arguments; `{}` is replaced by the input path
    #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    argv: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
    output: CommandOutput,
    scratch_root: PathBuf,
}

impl CommandTransform {
    pub fn new(program: impl Into<String>, args: Vec<String>, output: CommandOutput) -> Self {
        Self {
            program: program.into(),
            args,
            output,
            scratch_root: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    /// Parses `[--suffix S] [--scratch DIR] program [args...]`.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let args = Args::try_parse_from(args)?;
        let mut argv = args.argv.into_iter();
        let program = argv.next().unwrap_or_default();
        let output = match args.suffix {
            Some(suffix) => CommandOutput::File { suffix },
            None => CommandOutput::Stdout,
        };
        let mut transform = Self::new(program, argv.collect(), output);
        if let Some(root) = args.scratch {
            transform = transform.with_scratch_root(root);
        }
        Ok(transform)
    }

    fn spawn(&self, input: &Path, stdout_path: &Path, stderr_path: &Path) -> crate::Result<Child> {
        let input_arg = input.to_string_lossy();
        let substitutes = self.args.iter().any(|a| a.contains("{}"));
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{}", &input_arg))
            .collect();

        let stdin = if substitutes {
            Stdio::null()
        } else {
            Stdio::from(File::open(input).map_err(|e| Error::io("opening scratch input", e))?)
        };
        let stdout = match self.output {
            CommandOutput::Stdout => Stdio::from(
                File::create(stdout_path).map_err(|e| Error::io("creating scratch output", e))?,
            ),
            CommandOutput::File { .. } => Stdio::null(),
        };
        let stderr = File::create(stderr_path).map_err(|e| Error::io("creating scratch log", e))?;

        Command::new(&self.program)
            .args(&args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| Error::transform(format!("cannot start `{}`: {e}", self.program)))
    }

    fn collect_output(&self, input: &Path, stdout_path: &Path) -> crate::Result<Vec<u8>> {
        let path = match &self.output {
            CommandOutput::Stdout => stdout_path.to_path_buf(),
            CommandOutput::File { suffix } => {
                PathBuf::from(format!("{}{}", input.display(), suffix))
            }
        };
        fs::read(&path).map_err(|e| match e.kind() {
            IoErrorKind::NotFound => Error::transform(format!(
                "`{}` did not produce {}",
                self.program,
                path.display()
            )),
            _ => Error::io(format!("reading {}", path.display()), e),
        })
    }
}

/// Waits for `child`, killing it once the attempt deadline passes. The
/// child is always reaped before this returns.
fn wait_until(child: &mut Child, ctx: &AttemptContext) -> crate::Result<ExitStatus> {
    let (Some(deadline), Some(limit)) = (ctx.deadline, ctx.timeout) else {
        return child.wait().map_err(|e| Error::io("waiting for child", e));
    };
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
            Ok(None) => {
                stop(child);
                return Err(Error::Timeout(limit));
            }
            Err(e) => {
                stop(child);
                return Err(Error::io("waiting for child", e));
            }
        }
    }
}

fn stop(child: &mut Child) {
    let pid = child.id();
    if let Err(e) = child.kill() {
        warn!(pid, error = %e, "failed to kill child");
    }
    if let Err(e) = child.wait() {
        warn!(pid, error = %e, "failed to reap child");
    }
}

fn stderr_excerpt(path: &Path) -> String {
    let text = fs::read(path)
        .map(|b| String::from_utf8_lossy(&b).trim().to_string())
        .unwrap_or_default();
    match text.char_indices().nth(STDERR_EXCERPT) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text,
    }
}

impl Transform for CommandTransform {
    fn name(&self) -> &str {
        "command"
    }

    fn apply(&self, ctx: &AttemptContext, payload: &[u8]) -> crate::Result<Vec<u8>> {
        // Dropping the guard removes the directory and everything in it.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("mrp-{}-", ctx.attempt_id))
            .tempdir_in(&self.scratch_root)
            .map_err(|e| Error::io("creating scratch directory", e))?;

        let input = scratch.path().join(format!("{}.in", ctx.attempt_id));
        let stdout_path = scratch.path().join("stdout");
        let stderr_path = scratch.path().join("stderr");
        fs::write(&input, payload).map_err(|e| Error::io("writing scratch input", e))?;

        debug!(program = %self.program, attempt = ctx.attempt, "running command");
        let mut child = self.spawn(&input, &stdout_path, &stderr_path)?;
        let status = wait_until(&mut child, ctx)?;
        if !status.success() {
            return Err(Error::transform(format!(
                "`{}` exited with {status}: {}",
                self.program,
                stderr_excerpt(&stderr_path)
            )));
        }
        self.collect_output(&input, &stdout_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn stdin_to_stdout() {
        let root = tempdir().unwrap();
        let cat = CommandTransform::new("cat", vec![], CommandOutput::Stdout)
            .with_scratch_root(root.path());
        let out = cat.apply(&AttemptContext::new(1, None), b"hello").unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn gzip_writes_suffixed_file() {
        let root = tempdir().unwrap();
        let gzip = CommandTransform::from_args(&argv(&[
            "--suffix",
            ".gz",
            "--scratch",
            root.path().to_str().unwrap(),
            "gzip",
            "{}",
        ]))
        .unwrap();
        let out = gzip
            .apply(&AttemptContext::new(1, None), &[b'x'; 4096])
            .unwrap();
        // gzip magic number
        assert_eq!(&out[..2], &[0x1f, 0x8b]);
        assert!(out.len() < 4096);
    }

    #[test]
    fn non_zero_exit_is_a_transform_error() {
        let root = tempdir().unwrap();
        let failing = CommandTransform::new("false", vec![], CommandOutput::Stdout)
            .with_scratch_root(root.path());
        let err = failing
            .apply(&AttemptContext::new(1, None), b"x")
            .unwrap_err();
        assert!(matches!(err, Error::Transform { .. }));
    }

    #[test]
    fn missing_output_file_is_a_transform_error() {
        let root = tempdir().unwrap();
        let t = CommandTransform::new(
            "true",
            argv(&["{}"]),
            CommandOutput::File {
                suffix: ".gz".into(),
            },
        )
        .with_scratch_root(root.path());
        let err = t.apply(&AttemptContext::new(1, None), b"x").unwrap_err();
        assert!(err.to_string().contains("did not produce"));
    }

    #[test]
    fn deadline_kills_the_child() {
        let root = tempdir().unwrap();
        let sleepy = CommandTransform::new("sleep", argv(&["5"]), CommandOutput::Stdout)
            .with_scratch_root(root.path());
        let ctx = AttemptContext::new(1, Some(Duration::from_millis(50)));
        let started = Instant::now();
        let err = sleepy.apply(&ctx, b"").unwrap_err();
        assert!(matches!(err, Error::Timeout(limit) if limit == Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn scratch_is_removed_on_success_and_failure() {
        let root = tempdir().unwrap();
        let ok = CommandTransform::new("cat", vec![], CommandOutput::Stdout)
            .with_scratch_root(root.path());
        let bad = CommandTransform::new("false", vec![], CommandOutput::Stdout)
            .with_scratch_root(root.path());
        ok.apply(&AttemptContext::new(1, None), b"a").unwrap();
        bad.apply(&AttemptContext::new(1, None), b"a").unwrap_err();
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
