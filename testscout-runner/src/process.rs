// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subprocess execution on top of the task engine.
//!
//! All invocations of one framework's tools go through a single named queue,
//! so the framework only ever sees one of its processes at a time. Two modes
//! are supported: capture (run to completion, return merged output) and
//! streamed (feed decoded lines to a callback as they arrive, polling a
//! [`StopEvent`] so a run can be cancelled mid-stream).
//!
//! stderr is always merged into stdout; test tools interleave diagnostics
//! across both and the decoders want the one stream the user would see in a
//! terminal.

use crate::{engine::TaskEngine, errors::JobError};
use camino::Utf8PathBuf;
use std::{
    collections::BTreeMap,
    io::{BufReader, Read},
    sync::{
        Arc, Mutex, mpsc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{debug, error, warn};

/// How often a streamed job polls the stop event and the process state.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a cancelled streamed job waits for its reader thread to drain.
///
/// Killing the subprocess does not reach grandchildren it spawned; an orphan
/// that inherited the output pipe keeps it open and the reader blocked. Past
/// this grace the reader is muted and abandoned so cancellation stays
/// bounded.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// A run-scoped cancellation signal shared between the coordinator and every
/// job spawned for a run.
///
/// Setting the event asks every streamed subprocess of the run to terminate;
/// decoders then synthesize outcomes for any still-open test when their
/// stream closes.
#[derive(Clone, Debug, Default)]
pub struct StopEvent(Arc<AtomicBool>);

impl StopEvent {
    /// Creates a new, unset stop event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event. Idempotent.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once the event has been set.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A subprocess invocation: what to run, where, and on which queue.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    /// The program to execute.
    pub program: String,

    /// Arguments to the program.
    pub args: Vec<String>,

    /// Working directory; inherited from the caller when `None`.
    pub cwd: Option<Utf8PathBuf>,

    /// Extra environment variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,

    /// The engine queue all invocations for this framework serialize on.
    pub queue: String,

    /// Exit codes treated as success by [`expect_success`].
    pub success_codes: Vec<i32>,

    /// Primary output encoding. `utf-8` is the only strict encoding
    /// supported.
    pub encoding: String,

    /// Encodings tried, in order, when the primary one fails. `utf-8-lossy`
    /// accepts any input by replacing invalid sequences.
    pub fallback_encodings: Vec<String>,
}

impl CommandSpec {
    /// Creates a spec for `program` on `queue` with default settings.
    pub fn new(program: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            queue: queue.into(),
            success_codes: vec![0],
            encoding: "utf-8".to_owned(),
            fallback_encodings: Vec::new(),
        }
    }

    /// Appends arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(|a| a.into()));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replaces the set of exit codes treated as success.
    pub fn success_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.success_codes = codes.into_iter().collect();
        self
    }

    /// The full encoding chain, primary first.
    fn encodings(&self) -> Vec<String> {
        let mut encodings = vec![self.encoding.clone()];
        encodings.extend(self.fallback_encodings.iter().cloned());
        encodings
    }

    /// The command line as displayed in errors and logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn expression(&self) -> duct::Expression {
        let mut expr = duct::cmd(&self.program, &self.args);
        if let Some(cwd) = &self.cwd {
            expr = expr.dir(cwd.as_std_path());
        }
        for (key, value) in &self.env {
            expr = expr.env(key, value);
        }
        // unchecked: a failing test process is a result, not an I/O error.
        expr.stderr_to_stdout().unchecked()
    }
}

/// The result of a captured subprocess run.
#[derive(Clone, Debug)]
pub struct CapturedOutput {
    /// The process exit code; `-1` if it was terminated by a signal.
    pub exit_code: i32,

    /// Merged stdout and stderr.
    pub output: String,
}

fn decode_bytes(bytes: &[u8], encodings: &[String]) -> Option<String> {
    for encoding in encodings {
        match encoding.as_str() {
            "utf-8" => {
                if let Ok(text) = std::str::from_utf8(bytes) {
                    return Some(text.to_owned());
                }
            }
            "utf-8-lossy" => return Some(String::from_utf8_lossy(bytes).into_owned()),
            other => {
                warn!(encoding = other, "unsupported encoding in fallback chain, skipping");
            }
        }
    }
    None
}

fn spawn_error(spec: &CommandSpec, error: std::io::Error) -> JobError {
    JobError::Spawn {
        program: spec.program.clone(),
        error,
    }
}

fn decode_error(spec: &CommandSpec) -> JobError {
    JobError::Decode {
        program: spec.program.clone(),
        encodings: spec.encodings(),
    }
}

/// Runs `spec` to completion on its queue and returns the exit code plus the
/// merged output.
///
/// Exit codes are not checked here; see [`expect_success`].
pub fn run_captured(
    engine: &TaskEngine,
    spec: &CommandSpec,
    timeout: Option<Duration>,
) -> Result<CapturedOutput, JobError> {
    let job_spec = spec.clone();
    engine.run_blocking(
        &spec.queue,
        &spec.command_line(),
        move || {
            debug!(command = %job_spec.command_line(), "running captured");
            let output = job_spec
                .expression()
                .stdout_capture()
                .run()
                .map_err(|error| spawn_error(&job_spec, error))?;
            let text = decode_bytes(&output.stdout, &job_spec.encodings())
                .ok_or_else(|| decode_error(&job_spec))?;
            Ok(CapturedOutput {
                exit_code: output.status.code().unwrap_or(-1),
                output: text,
            })
        },
        timeout,
    )
}

/// Checks a captured run against the spec's success codes, converting a
/// failure into [`JobError::ExitCode`] carrying the output for context.
pub fn expect_success(spec: &CommandSpec, out: CapturedOutput) -> Result<String, JobError> {
    if spec.success_codes.contains(&out.exit_code) {
        return Ok(out.output);
    }
    Err(JobError::ExitCode {
        command: spec.command_line(),
        code: out.exit_code,
        message: (!out.output.is_empty()).then(|| out.output.clone()),
    })
}

/// `Read` over a shared [`duct::ReaderHandle`], so one thread can read while
/// another kills the process.
struct SharedReader(Arc<duct::ReaderHandle>);

impl Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&*self.0).read(buf)
    }
}

/// Runs `spec` on its queue, feeding each decoded output line to
/// `stream_reader` as it arrives.
///
/// The job polls `stop` every [`STOP_POLL_INTERVAL`]; when the event is set
/// the subprocess is forcibly terminated and the stream ends within
/// [`KILL_DRAIN_GRACE`] even if orphaned grandchildren keep the output pipe
/// open. Returns the exit code (`-1` after a kill). Per-line decode failures under a lossy
/// fallback never abort the stream; an undecodable line with no fallback
/// terminates the process and fails the job.
pub fn run_streamed(
    engine: &TaskEngine,
    spec: &CommandSpec,
    mut stream_reader: impl FnMut(&str) + Send + 'static,
    stop: StopEvent,
) -> Result<i32, JobError> {
    let job_spec = spec.clone();
    engine.run_blocking(
        &spec.queue,
        &spec.command_line(),
        move || {
            debug!(command = %job_spec.command_line(), "running streamed");
            let handle = Arc::new(
                job_spec
                    .expression()
                    .reader()
                    .map_err(|error| spawn_error(&job_spec, error))?,
            );

            let encodings = job_spec.encodings();
            let undecodable = Arc::new(AtomicBool::new(false));
            // Set when the job abandons the reader; a muted reader stops
            // delivering lines even if the pipe stays open.
            let muted = Arc::new(AtomicBool::new(false));
            let (drained_tx, drained_rx) = mpsc::channel::<()>();
            let reader = {
                let handle = handle.clone();
                let undecodable = undecodable.clone();
                let muted = muted.clone();
                thread::Builder::new()
                    .name("testscout-stream-reader".to_owned())
                    .spawn(move || {
                        let mut lines = BufReader::new(SharedReader(handle.clone()));
                        let mut line = Vec::new();
                        loop {
                            line.clear();
                            use std::io::BufRead;
                            match lines.read_until(b'\n', &mut line) {
                                Ok(0) => break,
                                Ok(_) => {
                                    if muted.load(Ordering::SeqCst) {
                                        break;
                                    }
                                    match decode_bytes(&line, &encodings) {
                                        Some(text) => stream_reader(&text),
                                        None => {
                                            error!(
                                                "undecodable output line, terminating process"
                                            );
                                            undecodable.store(true, Ordering::SeqCst);
                                            let _ = handle.kill();
                                            break;
                                        }
                                    }
                                }
                                // Reading fails once the process is killed.
                                Err(_) => break,
                            }
                        }
                        let _ = drained_tx.send(());
                    })
                    .expect("failed to spawn stream reader thread")
            };

            let mut killed = false;
            loop {
                if stop.is_set() && !killed {
                    debug!(command = %job_spec.command_line(), "stop requested, killing");
                    let _ = handle.kill();
                    killed = true;
                }
                match handle.try_wait() {
                    Ok(Some(_)) | Err(_) => break,
                    Ok(None) => thread::sleep(STOP_POLL_INTERVAL),
                }
            }
            if killed {
                // The kill does not reach grandchildren; one that inherited
                // the pipe can keep the reader blocked indefinitely. Wait
                // briefly for the buffered remainder, then abandon the
                // reader muted.
                match drained_rx.recv_timeout(KILL_DRAIN_GRACE) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        muted.store(true, Ordering::SeqCst);
                        warn!(
                            command = %job_spec.command_line(),
                            "output pipe still open after kill, abandoning reader"
                        );
                    }
                    _ => {
                        let _ = reader.join();
                    }
                }
            } else {
                // Normal completion: let the reader drain whatever output is
                // still buffered.
                let _ = reader.join();
            }

            if undecodable.load(Ordering::SeqCst) {
                return Err(decode_error(&job_spec));
            }

            let exit_code = match handle.try_wait() {
                Ok(Some(output)) => output.status.code().unwrap_or(-1),
                _ => -1,
            };
            Ok(exit_code)
        },
        None,
    )
}
