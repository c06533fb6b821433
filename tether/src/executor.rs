// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running guest OS commands
//!
//! Everything the tether does to the guest by shelling out (`hostname`,
//! `ip`, `mount`, `chpasswd`, `vmware-rpctool`, ...) goes through an
//! [`Executor`], so that tests can substitute a [`FakeExecutor`] and assert
//! on the commands issued.

use async_trait::async_trait;
use itertools::Itertools;
use slog::{debug, error, info, Logger};
use std::collections::VecDeque;
use std::fmt;
use std::process::{Command, ExitStatus, Stdio};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

const NOT_UTF8: &str = "<Not valid UTF-8>";

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error(
        "Command [{command}] executed and failed with status: {status}. \
         Stdout: {stdout}, Stderr: {stderr}"
    )]
    CommandFailure {
        command: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
}

/// A command as the executor saw it: program, arguments and environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Input {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl Input {
    /// Splits `input` on whitespace into a program and arguments.
    pub fn shell<S: AsRef<str>>(input: S) -> Self {
        let mut words = input.as_ref().split_whitespace().map(str::to_string);
        Input {
            program: words.next().unwrap_or_default(),
            args: words.collect(),
            envs: Vec::new(),
        }
    }
}

impl From<&Command> for Input {
    fn from(command: &Command) -> Self {
        Input {
            program: command.get_program().to_string_lossy().into(),
            args: command
                .get_args()
                .map(|s| s.to_string_lossy().into())
                .collect(),
            envs: command
                .get_envs()
                .filter_map(|(k, v)| {
                    Some((
                        k.to_string_lossy().into(),
                        v?.to_string_lossy().into(),
                    ))
                })
                .collect(),
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Output of a finished command
#[derive(Clone, Debug)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl From<std::process::Output> for Output {
    fn from(output: std::process::Output) -> Self {
        Output {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

impl Output {
    pub fn success() -> Self {
        Self::with_code(0)
    }

    pub fn failure() -> Self {
        Self::with_code(1)
    }

    pub fn with_code(code: i32) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn set_stdout<S: AsRef<str>>(mut self, stdout: S) -> Self {
        self.stdout = stdout.as_ref().as_bytes().to_vec();
        self
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

fn output_to_exec_error(command: &Input, output: &Output) -> ExecutionError {
    ExecutionError::CommandFailure {
        command: command.to_string(),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

fn log_start(log: &Logger, id: u64, input: &Input) {
    let envs = input.envs.iter().map(|(k, v)| format!("{k}={v}")).join(" ");
    info!(log, "guest command"; "id" => id, "command" => %input);
    if !envs.is_empty() {
        debug!(log, "guest command environment";
            "id" => id, "envs" => envs);
    }
}

fn log_exit(log: &Logger, id: u64, output: &Output) {
    let code = match output.status.code() {
        Some(code) => code.to_string(),
        None => "signalled".to_string(),
    };
    let outcome = if output.status.success() { "ok" } else { "failed" };
    info!(log, "guest command exited";
        "id" => id, "outcome" => outcome, "code" => code);
    let streams = [("stdout", &output.stdout), ("stderr", &output.stderr)];
    for (stream, bytes) in streams {
        if !bytes.is_empty() {
            let text = from_utf8(bytes).unwrap_or(NOT_UTF8);
            debug!(log, "guest command output";
                "id" => id, "stream" => stream, "text" => text);
        }
    }
}

pub type BoxedExecutor = Arc<dyn Executor>;

/// Runs guest OS commands to completion.
///
/// [`HostExecutor`] spawns real processes; [`FakeExecutor`] answers from a
/// [`CommandScript`] or a closure.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `command` with no input.  A non-zero exit is an error.
    async fn execute(
        &self,
        command: &mut Command,
    ) -> Result<Output, ExecutionError> {
        self.execute_with_input(command, &[]).await
    }

    /// As [`Executor::execute`], writing `stdin` to the command first.
    async fn execute_with_input(
        &self,
        command: &mut Command,
        stdin: &[u8],
    ) -> Result<Output, ExecutionError>;
}

/// Serializes command execution against the child reaper.
///
/// The reaper collects every exited child with `waitpid(-1)`, which would
/// steal the exit status of a command the executor is waiting on.  Commands
/// hold the guard shared while they run and the reaper takes it exclusively.
pub type ReapGuard = Arc<RwLock<()>>;

pub struct HostExecutor {
    log: Logger,
    next_id: AtomicU64,
    reap_guard: ReapGuard,
}

impl HostExecutor {
    pub fn new(log: Logger, reap_guard: ReapGuard) -> Arc<Self> {
        Arc::new(Self { log, next_id: AtomicU64::new(0), reap_guard })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute_with_input(
        &self,
        command: &mut Command,
        stdin: &[u8],
    ) -> Result<Output, ExecutionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let input = Input::from(&*command);
        log_start(&self.log, id, &input);

        let std_command =
            std::mem::replace(command, Command::new(&input.program));
        let mut child_command = tokio::process::Command::from(std_command);
        let stdin_cfg =
            if stdin.is_empty() { Stdio::null() } else { Stdio::piped() };
        child_command
            .stdin(stdin_cfg)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let _running = self.reap_guard.read().await;
        let start_err = |err| {
            error!(self.log, "guest command did not start";
                "id" => id, "command" => %input);
            ExecutionError::ExecutionStart { command: input.to_string(), err }
        };
        let mut child = child_command.spawn().map_err(start_err)?;
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin).await.map_err(start_err)?;
        }
        let output: Output =
            child.wait_with_output().await.map_err(start_err)?.into();

        log_exit(&self.log, id, &output);
        if !output.status.success() {
            return Err(output_to_exec_error(&input, &output));
        }
        Ok(output)
    }
}

/// Produces the result of a command run by a [`FakeExecutor`]
pub type Responder = Box<dyn FnMut(&Input, &[u8]) -> Output + Send + Sync>;

/// Records every command and answers it without running anything.  By
/// default each command succeeds with no output.
pub struct FakeExecutor {
    log: Logger,
    next_id: AtomicU64,
    responder: Mutex<Responder>,
    history: Mutex<Vec<Input>>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(FakeExecutor {
            log,
            next_id: AtomicU64::new(0),
            responder: Mutex::new(Box::new(|_: &Input, _: &[u8]| {
                Output::success()
            })),
            history: Mutex::new(Vec::new()),
        })
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock().unwrap() = responder;
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    /// Every command run so far, in order
    pub fn history(&self) -> Vec<Input> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute_with_input(
        &self,
        command: &mut Command,
        stdin: &[u8],
    ) -> Result<Output, ExecutionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let input = Input::from(&*command);
        log_start(&self.log, id, &input);
        self.history.lock().unwrap().push(input.clone());

        let output = {
            let mut responder = self.responder.lock().unwrap();
            (*responder)(&input, stdin)
        };
        log_exit(&self.log, id, &output);
        if output.status.success() {
            Ok(output)
        } else {
            Err(output_to_exec_error(&input, &output))
        }
    }
}

enum Step {
    Reply { expected: Input, output: Output },
    Call(Responder),
}

/// The exact sequence of commands a test expects the tether to run.
///
/// Each command must match the next step; running a command past the end
/// of the script, or dropping the script with steps left, fails the test.
#[derive(Default)]
pub struct CommandScript {
    steps: VecDeque<Step>,
    seen: usize,
}

impl CommandScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers the next command, which must be `expected`, with `output`.
    pub fn then(&mut self, expected: Input, output: Output) -> &mut Self {
        self.steps.push_back(Step::Reply { expected, output });
        self
    }

    pub fn then_ok<S: AsRef<str>>(&mut self, command: S) -> &mut Self {
        self.then(Input::shell(command), Output::success())
    }

    pub fn then_fail<S: AsRef<str>>(&mut self, command: S) -> &mut Self {
        self.then(Input::shell(command), Output::failure())
    }

    /// Hands the next command, whatever it is, to `responder`.
    pub fn then_call(&mut self, responder: Responder) -> &mut Self {
        self.steps.push_back(Step::Call(responder));
        self
    }

    /// Makes this script the responder of `executor`.
    pub fn install(mut self, executor: &FakeExecutor) {
        executor.set_responder(Box::new(
            move |input: &Input, stdin: &[u8]| self.respond(input, stdin),
        ));
    }

    fn respond(&mut self, observed: &Input, stdin: &[u8]) -> Output {
        self.seen += 1;
        match self.steps.pop_front() {
            Some(Step::Reply { expected, output }) => {
                assert_eq!(
                    (&observed.program, &observed.args),
                    (&expected.program, &expected.args),
                    "command {} of the script",
                    self.seen
                );
                output
            }
            Some(Step::Call(mut responder)) => responder(observed, stdin),
            None => panic!("command {observed} is not in the script"),
        }
    }
}

impl Drop for CommandScript {
    fn drop(&mut self) {
        let Some(next) = self.steps.front() else {
            return;
        };
        let next = match next {
            Step::Reply { expected, .. } => expected.to_string(),
            Step::Call(_) => "a command for a responder".to_string(),
        };
        let message = format!(
            "{} scripted commands never ran, starting with {next}",
            self.steps.len()
        );
        if std::thread::panicking() {
            eprintln!("{message}");
        } else {
            panic!("{message}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vch_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn host_executor_reports_failure() {
        let logctx = test_setup_log("host_executor_reports_failure");
        let executor =
            HostExecutor::new(logctx.log.clone(), ReapGuard::default());

        let output = executor
            .execute(Command::new("/bin/sh").args(["-c", "echo hello"]))
            .await
            .unwrap();
        assert_eq!(output.stdout_str(), "hello\n");

        let err = executor
            .execute(Command::new("/bin/sh").args(["-c", "exit 3"]))
            .await
            .unwrap_err();
        match err {
            ExecutionError::CommandFailure { status, .. } => {
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected error {other}"),
        }
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn host_executor_feeds_stdin() {
        let logctx = test_setup_log("host_executor_feeds_stdin");
        let executor =
            HostExecutor::new(logctx.log.clone(), ReapGuard::default());
        let output = executor
            .execute_with_input(&mut Command::new("/bin/cat"), b"root:pw\n")
            .await
            .unwrap();
        assert_eq!(output.stdout_str(), "root:pw\n");
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn script_checks_commands() {
        let logctx = test_setup_log("script_checks_commands");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut script = CommandScript::new();
        script.then_ok("hostname abcdef").then_fail("mount -L missing /mnt");
        script.install(&executor);

        executor
            .execute(Command::new("hostname").arg("abcdef"))
            .await
            .unwrap();
        assert!(executor
            .execute(Command::new("mount").args(["-L", "missing", "/mnt"]))
            .await
            .is_err());
        assert_eq!(executor.history().len(), 2);
        logctx.cleanup_successful();
    }
}
