//! Spawns the assistant subprocess, line-parses its stdout into the [`Event`]
//! vocabulary, and retries transient crashes with exponential backoff.
//!
//! The spawning behavior sits behind the [`AssistantRunner`] trait so loop
//! instances and scenario tests can run against [`ScriptedRunner`] instead of
//! a real `claude` binary.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use crate::event::Event;
use crate::protocol::parse::{extract_story_marker, parse_line};
use crate::protocol::types::{AssistantContentBlock, InboundEvent, SystemEvent};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn assistant process: {0}")]
    Spawn(String),
    #[error("assistant crashed repeatedly; retries exhausted")]
    RetryExhausted,
    #[error("run was cancelled")]
    Cancelled,
    #[error("failed to wait for assistant process: {0}")]
    Wait(String),
}

/// Successful completion of one `Run` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    NormalExit,
}

/// Cooperative cancellation handle shared between the instance and a running
/// invocation of [`AssistantRunner::run`].
pub type Cancel = watch::Receiver<bool>;

#[async_trait]
pub trait AssistantRunner: Send + Sync {
    /// Run one iteration: spawn (or replay) the assistant, translating its
    /// output into `Event`s delivered synchronously to `on_event`, tagged
    /// with `iteration`.
    async fn run(
        &self,
        work_dir: &Path,
        prompt: &str,
        iteration: u32,
        cancel: Cancel,
        on_event: &mut (dyn FnMut(Event) + Send),
    ) -> Result<RunOutcome, RunnerError>;

    /// Globally enable or disable the runner's crash retry behavior. A no-op
    /// for runners with no retry concept.
    fn set_retry_enabled(&self, _enabled: bool) {}
}

/// Spawns the real `claude` binary non-interactively.
pub struct ClaudeRunner {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    retry_enabled: std::sync::atomic::AtomicBool,
}

impl Default for ClaudeRunner {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
            retry_enabled: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

impl ClaudeRunner {
    /// One subprocess attempt. A crash is a non-zero exit status *with* no
    /// terminal result line observed — either one alone is not a crash: a
    /// terminal result line means a clean session end regardless of exit
    /// code, and a zero exit with no result line is an early-but-clean exit.
    /// Returns `Ok(true)` on crash, `Ok(false)` otherwise, or `Err` if
    /// spawning, waiting, or cancellation failed.
    async fn attempt(
        &self,
        work_dir: &Path,
        prompt: &str,
        iteration: u32,
        cancel: &mut Cancel,
        on_event: &mut (dyn FnMut(Event) + Send),
    ) -> Result<bool, RunnerError> {
        let mut child = Command::new("claude")
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RunnerError::Spawn(e.to_string()))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RunnerError::Spawn("assistant process has no stdout".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let mut saw_terminal_result = false;
        let mut story_started = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Err(RunnerError::Cancelled);
                    }
                }
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    let Ok(Some(event)) = parse_line(&line) else { continue };
                    match event {
                        InboundEvent::System(SystemEvent::Init(_) | SystemEvent::Other) => {}
                        InboundEvent::Assistant(msg) => {
                            for block in msg.message.content {
                                match block {
                                    AssistantContentBlock::Text { text } => {
                                        if !story_started
                                            && let Some(story_id) = extract_story_marker(&text)
                                        {
                                            story_started = true;
                                            on_event(Event::StoryStarted { iteration, story_id });
                                        }
                                        on_event(Event::AssistantText { iteration, text });
                                    }
                                    AssistantContentBlock::ToolUse { name, input, .. } => {
                                        on_event(Event::ToolStart { iteration, tool: name, input });
                                    }
                                    AssistantContentBlock::Other => {}
                                }
                            }
                        }
                        InboundEvent::User(result) => {
                            for block in result.message.content {
                                on_event(Event::ToolResult { iteration, text: block.text });
                            }
                        }
                        InboundEvent::Result(_) => {
                            saw_terminal_result = true;
                        }
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|e| RunnerError::Wait(e.to_string()))?;
        Ok(!status.success() && !saw_terminal_result)
    }
}

#[async_trait]
impl AssistantRunner for ClaudeRunner {
    async fn run(
        &self,
        work_dir: &Path,
        prompt: &str,
        iteration: u32,
        mut cancel: Cancel,
        on_event: &mut (dyn FnMut(Event) + Send),
    ) -> Result<RunOutcome, RunnerError> {
        let mut attempt_num = 1u32;
        loop {
            match self.attempt(work_dir, prompt, iteration, &mut cancel, on_event).await {
                Ok(false) => return Ok(RunOutcome::NormalExit),
                Ok(true) => {
                    let retry_enabled = self.retry_enabled.load(std::sync::atomic::Ordering::SeqCst);
                    if !retry_enabled || attempt_num >= self.max_retries {
                        return Err(RunnerError::RetryExhausted);
                    }
                    let delay = std::cmp::min(
                        self.base_delay.saturating_mul(1 << (attempt_num - 1)),
                        self.max_delay,
                    );
                    on_event(Event::Retrying {
                        iteration,
                        text: format!("assistant crashed; retrying (attempt {})", attempt_num + 1),
                    });
                    tokio::time::sleep(delay).await;
                    attempt_num += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn set_retry_enabled(&self, enabled: bool) {
        self.retry_enabled.store(enabled, std::sync::atomic::Ordering::SeqCst);
    }
}

/// One programmed step of a [`ScriptedRunner`] attempt queue.
pub enum ScriptStep {
    /// Emit these events in order, then report a clean terminal result.
    Events(Vec<Event>),
    /// Simulate a crash: no events, no terminal result.
    Crash,
}

/// A scripted stand-in for [`AssistantRunner`], replaying a fixed sequence of
/// attempts. Each call to `run` pops the next queued step; `Crash` steps
/// drive the same retry/backoff bookkeeping a real runner would.
pub struct ScriptedRunner {
    steps: Mutex<VecDeque<ScriptStep>>,
    max_retries: u32,
}

impl ScriptedRunner {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            max_retries: 5,
        }
    }

    pub fn with_max_retries(steps: Vec<ScriptStep>, max_retries: u32) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            max_retries,
        }
    }

    fn pop(&self) -> Option<ScriptStep> {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }
}

#[async_trait]
impl AssistantRunner for ScriptedRunner {
    async fn run(
        &self,
        _work_dir: &Path,
        _prompt: &str,
        iteration: u32,
        mut cancel: Cancel,
        on_event: &mut (dyn FnMut(Event) + Send),
    ) -> Result<RunOutcome, RunnerError> {
        let mut attempt_num = 1u32;
        loop {
            if *cancel.borrow() {
                return Err(RunnerError::Cancelled);
            }
            match self.pop() {
                Some(ScriptStep::Events(events)) => {
                    for event in events {
                        if *cancel.borrow_and_update() {
                            return Err(RunnerError::Cancelled);
                        }
                        on_event(event);
                    }
                    return Ok(RunOutcome::NormalExit);
                }
                Some(ScriptStep::Crash) => {
                    if attempt_num >= self.max_retries {
                        return Err(RunnerError::RetryExhausted);
                    }
                    on_event(Event::Retrying {
                        iteration,
                        text: format!("assistant crashed; retrying (attempt {})", attempt_num + 1),
                    });
                    attempt_num += 1;
                }
                None => return Err(RunnerError::RetryExhausted),
            }
        }
    }
}
