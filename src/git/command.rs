use std::{
    ffi::OsStr,
    io::{self, Read},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;
use log::trace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Cannot run `{program}`: {source}")]
    Spawn {
        program: String,
        source: io::Error,
    },
    #[error("`git {args}` failed with exit code {code}: {stderr}")]
    Failed {
        args: String,
        code: i32,
        stderr: String,
    },
    #[error("`git {args}` was terminated by a signal")]
    Signalled { args: String },
    #[error("Unexpected output from `git {args}`: {output:?}")]
    UnexpectedOutput { args: String, output: String },
    #[error("Git error: {0}")]
    Repository(#[from] git2::Error),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// How a command that was allowed to fail terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Code(i32),
}

/// Runs the `git` binary. Every spawned process is counted, in total and
/// per subcommand.
#[derive(Debug)]
pub struct Git {
    program: String,
    invocations: AtomicUsize,
    per_subcommand: DashMap<String, usize>,
}

impl Git {
    pub fn new(program: impl Into<String>) -> Git {
        Git {
            program: program.into(),
            invocations: AtomicUsize::new(0),
            per_subcommand: DashMap::new(),
        }
    }

    /// Number of processes spawned so far.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Number of processes spawned so far for `subcommand` (e.g. `fetch`).
    pub fn invocations_of(&self, subcommand: &str) -> usize {
        self.per_subcommand
            .get(subcommand)
            .map(|count| *count)
            .unwrap_or_default()
    }

    pub fn cmd(&self) -> GitCommand<'_> {
        let mut command = Command::new(&self.program);
        command.env("LC_ALL", "C").stdin(Stdio::null());
        GitCommand {
            git: self,
            command,
            description: Vec::new(),
        }
    }
}

impl Default for Git {
    fn default() -> Self {
        Git::new("git")
    }
}

pub struct GitCommand<'a> {
    git: &'a Git,
    command: Command,
    description: Vec<String>,
}

impl GitCommand<'_> {
    /// Runs in `dir` (`git -C <dir>`).
    pub fn dir(self, dir: &Path) -> Self {
        self.arg("-C").arg(dir)
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.description
            .push(arg.as_ref().to_string_lossy().into_owned());
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        args.into_iter().fold(self, |command, arg| command.arg(arg))
    }

    fn describe(&self) -> String {
        self.description.join(" ")
    }

    /// The first argument that is not a global `-C`/`-c` option.
    fn subcommand(&self) -> Option<&str> {
        let mut args = self.description.iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-C" | "-c" => {
                    args.next();
                }
                other => return Some(other),
            }
        }
        None
    }

    fn spawned(&self) {
        self.git.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(subcommand) = self.subcommand() {
            *self
                .git
                .per_subcommand
                .entry(subcommand.to_owned())
                .or_default() += 1;
        }
        trace!("Running git {}", self.describe());
    }

    fn spawn_error(&self, source: io::Error) -> GitError {
        GitError::Spawn {
            program: self.git.program.clone(),
            source,
        }
    }

    /// Runs to completion and returns stdout. Any non-zero exit is an error.
    pub fn run(mut self) -> Result<String, GitError> {
        self.spawned();
        let output = self
            .command
            .output()
            .map_err(|e| self.spawn_error(e))?;
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(code) => Err(GitError::Failed {
                args: self.describe(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }),
            None => Err(GitError::Signalled {
                args: self.describe(),
            }),
        }
    }

    /// Runs to completion and trims the trailing newline from stdout.
    pub fn run_line(self) -> Result<String, GitError> {
        Ok(self.run()?.trim_end().to_owned())
    }

    /// Runs to completion and parses the single line of output.
    pub fn run_parsed<T: FromStr>(self) -> Result<T, GitError> {
        let args = self.describe();
        let line = self.run_line()?;
        line.parse()
            .map_err(|_| GitError::UnexpectedOutput { args, output: line })
    }

    /// Runs to completion; exit codes are returned rather than treated as
    /// errors. The second element is stdout followed by stderr.
    pub fn status(mut self) -> Result<(ExitOutcome, String), GitError> {
        self.spawned();
        let output = self
            .command
            .output()
            .map_err(|e| self.spawn_error(e))?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        match output.status.code() {
            Some(0) => Ok((ExitOutcome::Success, combined)),
            Some(code) => Ok((ExitOutcome::Code(code), combined)),
            None => Err(GitError::Signalled {
                args: self.describe(),
            }),
        }
    }

    /// Spawns the command with stdout available as a reader. Call
    /// [`GitStream::finish`] once the output has been consumed.
    pub fn stream(mut self) -> Result<GitStream, GitError> {
        self.spawned();
        let mut child = self
            .command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        let stdout = child.stdout.take();
        Ok(GitStream {
            args: self.describe(),
            child,
            stdout,
        })
    }
}

pub struct GitStream {
    args: String,
    child: Child,
    stdout: Option<ChildStdout>,
}

impl GitStream {
    pub fn finish(mut self) -> Result<(), GitError> {
        // Closing our end first lets a writer blocked on a full pipe exit.
        self.stdout.take();
        let output = self.child.wait_with_output()?;
        match output.status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(GitError::Failed {
                args: self.args,
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }),
            None => Err(GitError::Signalled { args: self.args }),
        }
    }
}

impl Read for GitStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }
}
