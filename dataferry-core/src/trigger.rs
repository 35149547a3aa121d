//! Scheduled Trigger: runs the pipeline as an out-of-process job.
//!
//! A [`Schedule`] computes fire times from a cron expression evaluated in a
//! named timezone. [`ScheduledTrigger`] spawns the job command, relays every
//! output line through `tracing`, and turns a non-zero exit into a
//! [`TriggerError`] that names the last step the job reported.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ScheduleConfig;
use crate::error::{ScheduleError, TriggerError};

/// Output lines kept for failure reports.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// A named cron schedule in a fixed timezone.
#[derive(Debug, Clone)]
pub struct Schedule {
    name: String,
    expression: String,
    cron: cron::Schedule,
    timezone: Tz,
}

impl Schedule {
    /// Parse a cron expression. Five-field expressions get a leading `0` seconds field.
    pub fn new(name: &str, expression: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {}", expression.trim())
        } else {
            expression.trim().to_string()
        };
        let cron = cron::Schedule::from_str(&normalized).map_err(|e| {
            ScheduleError::InvalidCronExpression {
                expression: expression.to_string(),
                message: e.to_string(),
            }
        })?;
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|_| ScheduleError::InvalidTimezone {
                timezone: timezone.to_string(),
            })?;
        Ok(Self {
            name: name.to_string(),
            expression: normalized,
            cron,
            timezone,
        })
    }

    pub fn from_config(config: &ScheduleConfig) -> Result<Self, ScheduleError> {
        Self::new(&config.name, &config.cron, &config.timezone)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.cron
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| ScheduleError::NoUpcoming {
                expression: self.expression.clone(),
            })
    }

    /// The next `n` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        self.cron
            .after(&after.with_timezone(&self.timezone))
            .take(n)
            .map(|t| t.with_timezone(&Utc))
            .collect()
    }
}

/// The out-of-process unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Extra environment for the child only.
    pub envs: Vec<(OsString, OsString)>,
}

impl JobCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn display_program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Result of a job that exited with status 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub duration: Duration,
    pub lines: usize,
    /// The last step the job reported.
    pub step: Option<String>,
    pub last_lines: Vec<String>,
}

/// Tracks the current step and the tail of a job's output.
#[derive(Debug)]
struct OutputCapture {
    step: Option<String>,
    tail: VecDeque<String>,
    capacity: usize,
    lines: usize,
}

impl OutputCapture {
    fn new(capacity: usize) -> Self {
        Self {
            step: None,
            tail: VecDeque::with_capacity(capacity),
            capacity,
            lines: 0,
        }
    }

    /// Record one line and return it with color sequences removed.
    fn push(&mut self, line: &str) -> String {
        let plain = strip_ansi(line);
        if let Some(step) = step_token(&plain) {
            self.step = Some(step);
        }
        if self.capacity > 0 {
            if self.tail.len() == self.capacity {
                self.tail.pop_front();
            }
            self.tail.push_back(plain.clone());
        }
        self.lines += 1;
        plain
    }
}

/// Forward every line of `pipe` until EOF. Invalid UTF-8 is replaced, never
/// treated as the end of the stream.
async fn forward_lines<R>(
    pipe: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(stream = %stream, error = %e, "Failed to read job output");
                break;
            }
        }
    }
}

/// Remove terminal color sequences (`ESC [ ... letter`).
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// The value of the last `step=<name>` token in a line.
pub fn step_token(line: &str) -> Option<String> {
    line.match_indices("step=")
        .filter(|(idx, _)| {
            *idx == 0
                || !line[..*idx]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_')
        })
        .filter_map(|(idx, token)| {
            let value = line[idx + token.len()..].trim_start_matches('"');
            let name: String = value
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            (!name.is_empty()).then_some(name)
        })
        .last()
}

/// Runs a [`JobCommand`] once or on a [`Schedule`].
pub struct ScheduledTrigger {
    schedule: Schedule,
    command: JobCommand,
    tail_lines: usize,
}

impl ScheduledTrigger {
    pub fn new(schedule: Schedule, command: JobCommand) -> Self {
        Self {
            schedule,
            command,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_tail_lines(mut self, n: usize) -> Self {
        self.tail_lines = n;
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Spawn the job, relay its output, and wait for it to exit. Never retries.
    pub async fn run_once(&self) -> Result<TriggerOutcome, TriggerError> {
        let started = Instant::now();
        let program = self.command.display_program();
        info!(schedule = %self.schedule.name, program = %program, "Starting job");

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(self.command.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TriggerError::Spawn {
                program: program.clone(),
                message: e.to_string(),
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel::<(OutputStream, String)>();
        if let Some(pipe) = child.stdout.take() {
            tokio::spawn(forward_lines(pipe, OutputStream::Stdout, tx.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            tokio::spawn(forward_lines(pipe, OutputStream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut capture = OutputCapture::new(self.tail_lines);
        while let Some((stream, line)) = rx.recv().await {
            let text = capture.push(&line);
            info!(
                target: "dataferry::job",
                stream = %stream,
                step = capture.step.as_deref().unwrap_or("-"),
                "{}",
                text
            );
        }

        let status = child.wait().await.map_err(|e| TriggerError::Wait {
            message: e.to_string(),
        })?;
        let duration = started.elapsed();
        let last_lines: Vec<String> = capture.tail.into_iter().collect();

        if status.success() {
            info!(
                schedule = %self.schedule.name,
                duration_ms = duration.as_millis() as u64,
                lines = capture.lines,
                "Job succeeded"
            );
            Ok(TriggerOutcome {
                duration,
                lines: capture.lines,
                step: capture.step,
                last_lines,
            })
        } else {
            Err(TriggerError::RunFailed {
                exit_code: status.code(),
                step: capture.step,
                last_lines,
            })
        }
    }

    /// Fire on every scheduled time until `shutdown` becomes `true`.
    ///
    /// Runs are sequential, so a slow run delays the next fire time instead of
    /// overlapping with it.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ScheduleError> {
        info!(
            schedule = %self.schedule.name,
            cron = %self.schedule.expression,
            timezone = %self.schedule.timezone,
            "Scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = self.schedule.next_after(Utc::now())?;
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            info!(schedule = %self.schedule.name, next_run = %next, "Waiting for next run");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.run_once().await {
                Ok(outcome) => debug!(lines = outcome.lines, "Scheduled run complete"),
                Err(e @ TriggerError::RunFailed { .. }) => {
                    error!(schedule = %self.schedule.name, error = %e, "Scheduled run failed");
                }
                Err(e) => {
                    error!(schedule = %self.schedule.name, error = %e, "Scheduled run could not start");
                }
            }
        }
        warn!(schedule = %self.schedule.name, "Scheduler stopped");
        Ok(())
    }
}
