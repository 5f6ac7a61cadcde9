//! One PRD's state machine: iteration budget, pause/stop flags, next-story
//! selection, event forwarding, and completion detection.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::event::{Event, TaggedEvent};
use crate::prd;
use crate::prompt;
use crate::runner::{AssistantRunner, Cancel, RunOutcome, RunnerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Ready,
    Running,
    Paused,
    Stopped,
    Complete,
    Error,
}

/// A point-in-time snapshot of an instance's externally visible fields.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: InstanceState,
    pub iteration: u32,
    pub last_error: Option<String>,
    pub worktree_dir: Option<PathBuf>,
    pub branch: Option<String>,
    pub start_time: Option<SystemTime>,
}

struct Shared {
    state: InstanceState,
    iteration: u32,
    max_iterations: u32,
    last_error: Option<String>,
    worktree_dir: Option<PathBuf>,
    branch: Option<String>,
    start_time: Option<SystemTime>,
}

/// A single PRD's execution loop. Cheaply cloneable; clones share the same
/// underlying state and control flags.
#[derive(Clone)]
pub struct LoopInstance {
    pub name: String,
    prd_path: PathBuf,
    global_context_dir: PathBuf,
    project_context_dir: PathBuf,
    runner: Arc<dyn AssistantRunner>,
    shared: Arc<Mutex<Shared>>,
    pause_requested: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: Cancel,
}

impl LoopInstance {
    pub fn new(
        name: impl Into<String>,
        prd_path: PathBuf,
        global_context_dir: PathBuf,
        project_context_dir: PathBuf,
        runner: Arc<dyn AssistantRunner>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            name: name.into(),
            prd_path,
            global_context_dir,
            project_context_dir,
            runner,
            shared: Arc::new(Mutex::new(Shared {
                state: InstanceState::Ready,
                iteration: 0,
                max_iterations: 50,
                last_error: None,
                worktree_dir: None,
                branch: None,
                start_time: None,
            })),
            pause_requested: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        Snapshot {
            state: shared.state,
            iteration: shared.iteration,
            last_error: shared.last_error.clone(),
            worktree_dir: shared.worktree_dir.clone(),
            branch: shared.branch.clone(),
            start_time: shared.start_time,
        }
    }

    pub fn set_max_iterations(&self, n: u32) {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).max_iterations = n;
    }

    pub fn update_worktree_info(&self, dir: PathBuf, branch: String) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.worktree_dir = Some(dir);
        shared.branch = Some(branch);
    }

    pub fn clear_worktree_info(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.worktree_dir = None;
        shared.branch = None;
    }

    fn work_dir(&self) -> PathBuf {
        let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.worktree_dir.clone().unwrap_or_else(|| {
            self.prd_path
                .parent()
                .map(std::path::Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    /// Request a pause; observed at the next iteration boundary.
    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Request a stop; observed at the next iteration boundary and, if a
    /// subprocess is currently running, cancels it immediately.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.send(true);
    }

    /// Enter `Running` (resetting cancellation state and, if coming from a
    /// terminal state, the iteration counter) and spawn the background task
    /// that drives iterations until a terminal state is reached.
    pub fn start(
        &self,
        events_tx: mpsc::UnboundedSender<TaggedEvent>,
        completion_cb: Arc<dyn Fn(&str) + Send + Sync>,
    ) {
        {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(shared.state, InstanceState::Paused) {
                shared.iteration = 0;
            }
            shared.state = InstanceState::Running;
            shared.start_time.get_or_insert_with(SystemTime::now);
            shared.last_error = None;
        }
        self.pause_requested.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        let _ = self.cancel_tx.send(false);

        let instance = self.clone();
        tokio::spawn(async move {
            instance.drive(events_tx, completion_cb).await;
        });
    }

    async fn drive(
        &self,
        events_tx: mpsc::UnboundedSender<TaggedEvent>,
        completion_cb: Arc<dyn Fn(&str) + Send + Sync>,
    ) {
        loop {
            match self.run_one_iteration(&events_tx).await {
                Outcome::Continue => {}
                Outcome::Terminal(InstanceState::Complete) => {
                    self.set_state(InstanceState::Complete);
                    self.emit(&events_tx, Event::Complete { iteration: self.snapshot().iteration });
                    completion_cb(&self.name);
                    return;
                }
                Outcome::Terminal(state) => {
                    self.set_state(state);
                    return;
                }
            }
        }
    }

    fn set_state(&self, state: InstanceState) {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).state = state;
    }

    fn set_error(&self, message: String) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.state = InstanceState::Error;
        shared.last_error = Some(message);
    }

    fn emit(&self, tx: &mpsc::UnboundedSender<TaggedEvent>, event: Event) {
        let _ = tx.send(TaggedEvent { prd_name: self.name.clone(), event });
    }

    /// Re-read the PRD and clear every `inProgress` flag still set, so a
    /// terminal transition never leaves the two-writer invariant (`passes ⇒
    /// ¬inProgress`) violated because the assistant set `passes` without
    /// touching `inProgress` itself.
    fn clear_in_progress_on_exit(&self) {
        let Ok(mut prd) = prd::load(&self.prd_path) else { return };
        if prd.user_stories.iter().any(|s| s.in_progress) {
            prd.clear_in_progress();
            if let Err(e) = prd::save(&self.prd_path, &prd) {
                warn!(prd = %self.name, error = %e, "failed to clear inProgress flags on terminal transition");
            }
        }
    }

    fn finish(&self, state: InstanceState) -> Outcome {
        self.clear_in_progress_on_exit();
        Outcome::Terminal(state)
    }

    async fn run_one_iteration(&self, events_tx: &mpsc::UnboundedSender<TaggedEvent>) -> Outcome {
        let loaded = match prd::load(&self.prd_path) {
            Ok(p) => p,
            Err(e) => {
                warn!(prd = %self.name, error = %e, "failed to load PRD");
                self.set_error(e.to_string());
                return Outcome::Terminal(InstanceState::Error);
            }
        };

        if loaded.all_pass() {
            return self.finish(InstanceState::Complete);
        }

        if self.stop_requested.load(Ordering::SeqCst) {
            return self.finish(InstanceState::Stopped);
        }
        if self.pause_requested.load(Ordering::SeqCst) {
            return self.finish(InstanceState::Paused);
        }

        let (iteration, max_iterations) = {
            let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            (shared.iteration, shared.max_iterations)
        };
        if iteration >= max_iterations {
            self.emit(events_tx, Event::MaxIterationsReached { iteration });
            return self.finish(InstanceState::Paused);
        }

        let iteration = iteration + 1;
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).iteration = iteration;
        self.emit(events_tx, Event::IterationStart { iteration });
        info!(prd = %self.name, iteration, "starting iteration");

        let prompt_text = prompt::build(
            &self.prd_path,
            iteration,
            &self.global_context_dir,
            &self.project_context_dir,
        );

        let work_dir = self.work_dir();
        let prd_path = self.prd_path.clone();
        let name = self.name.clone();
        let events_tx_clone = events_tx.clone();
        let mut on_event = move |event: Event| {
            if let Event::StoryStarted { story_id, .. } = &event
                && let Ok(mut prd) = prd::load(&prd_path)
            {
                prd.set_in_progress(story_id);
                if let Err(e) = prd::save(&prd_path, &prd) {
                    warn!(prd = %name, error = %e, "failed to persist inProgress flag");
                }
            }
            let _ = events_tx_clone.send(TaggedEvent { prd_name: name.clone(), event });
        };

        let result = self
            .runner
            .run(&work_dir, &prompt_text, iteration, self.cancel_rx.clone(), &mut on_event)
            .await;

        match result {
            Ok(RunOutcome::NormalExit) => {
                debug!(prd = %self.name, iteration, "iteration finished normally");
                Outcome::Continue
            }
            Err(RunnerError::Cancelled) => {
                if self.stop_requested.load(Ordering::SeqCst) {
                    self.finish(InstanceState::Stopped)
                } else {
                    self.finish(InstanceState::Paused)
                }
            }
            Err(e @ (RunnerError::RetryExhausted | RunnerError::Spawn(_) | RunnerError::Wait(_))) => {
                self.emit(events_tx, Event::Error { iteration, err: e.to_string() });
                self.set_error(e.to_string());
                self.finish(InstanceState::Error)
            }
        }
    }
}

enum Outcome {
    Continue,
    Terminal(InstanceState),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::prd::{Prd, UserStory};
    use crate::runner::{ScriptStep, ScriptedRunner};
    use std::time::Duration;
    use tempfile::TempDir;

    fn sample_prd(passes: bool) -> Prd {
        Prd {
            project: "Demo".to_string(),
            description: String::new(),
            user_stories: vec![UserStory {
                id: "US-001".to_string(),
                title: "Login".to_string(),
                description: String::new(),
                steps: vec![],
                acceptance_criteria: vec![],
                priority: 1,
                passes,
                in_progress: false,
            }],
        }
    }

    async fn recv_events(
        rx: &mut mpsc::UnboundedReceiver<TaggedEvent>,
        n: usize,
    ) -> Vec<TaggedEvent> {
        let mut out = Vec::new();
        for _ in 0..n {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn scenario_a_single_story_completes() {
        let dir = TempDir::new().unwrap();
        let prd_path = dir.path().join("prd.json");
        prd::save(&prd_path, &sample_prd(false)).unwrap();

        let runner = Arc::new(ScriptedRunner::new(vec![ScriptStep::Events(vec![
            Event::StoryStarted {
                iteration: 1,
                story_id: "US-001".to_string(),
            },
        ])]));

        let instance = LoopInstance::new(
            "demo",
            prd_path.clone(),
            dir.path().join("no-global"),
            dir.path().join("no-project"),
            runner,
        );

        // Simulate the assistant marking the story as passing once it starts work.
        let prd_path_for_completion = prd_path.clone();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let completed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let completed_clone = completed.clone();
        instance.start(tx, Arc::new(move |_name: &str| {
            completed_clone.store(true, Ordering::SeqCst);
        }));

        let events = recv_events(&mut rx, 3).await;
        assert!(matches!(events[0].event, Event::IterationStart { iteration: 1 }));
        assert!(matches!(events[1].event, Event::StoryStarted { .. }));

        // Flip passes=true the way the assistant would, then let the loop notice.
        let mut prd = prd::load(&prd_path_for_completion).unwrap();
        prd.user_stories[0].passes = true;
        prd::save(&prd_path_for_completion, &prd).unwrap();

        let complete_event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(complete_event.event, Event::Complete { .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(completed.load(Ordering::SeqCst));
        assert_eq!(instance.snapshot().state, InstanceState::Complete);

        // The assistant set `passes` without clearing `inProgress` itself;
        // the terminal transition must have cleared it anyway.
        let final_prd = prd::load(&prd_path).unwrap();
        assert!(!final_prd.user_stories[0].in_progress);
    }

    #[tokio::test]
    async fn scenario_b_budget_exhausted_pauses() {
        let dir = TempDir::new().unwrap();
        let prd_path = dir.path().join("prd.json");
        prd::save(&prd_path, &sample_prd(false)).unwrap();

        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptStep::Events(vec![]),
            ScriptStep::Events(vec![]),
        ]));

        let instance = LoopInstance::new(
            "demo",
            prd_path,
            dir.path().join("no-global"),
            dir.path().join("no-project"),
            runner,
        );
        instance.set_max_iterations(2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        instance.start(tx, Arc::new(|_: &str| {}));

        let events = recv_events(&mut rx, 3).await;
        assert!(matches!(events[0].event, Event::IterationStart { iteration: 1 }));
        assert!(matches!(events[1].event, Event::IterationStart { iteration: 2 }));
        assert!(matches!(events[2].event, Event::MaxIterationsReached { iteration: 2 }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(instance.snapshot().state, InstanceState::Paused);
    }

    #[tokio::test]
    async fn terminal_transition_clears_in_progress_even_when_budget_exhausted() {
        let dir = TempDir::new().unwrap();
        let prd_path = dir.path().join("prd.json");
        let mut prd = sample_prd(false);
        prd.user_stories[0].in_progress = true;
        prd::save(&prd_path, &prd).unwrap();

        let runner = Arc::new(ScriptedRunner::new(vec![ScriptStep::Events(vec![])]));
        let instance = LoopInstance::new(
            "demo",
            prd_path.clone(),
            dir.path().join("no-global"),
            dir.path().join("no-project"),
            runner,
        );
        instance.set_max_iterations(1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        instance.start(tx, Arc::new(|_: &str| {}));

        let events = recv_events(&mut rx, 2).await;
        assert!(matches!(events[1].event, Event::MaxIterationsReached { iteration: 1 }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(instance.snapshot().state, InstanceState::Paused);
        assert!(!prd::load(&prd_path).unwrap().user_stories[0].in_progress);
    }

    #[tokio::test]
    async fn scenario_c_stop_mid_run_reaches_stopped() {
        let dir = TempDir::new().unwrap();
        let prd_path = dir.path().join("prd.json");
        prd::save(&prd_path, &sample_prd(false)).unwrap();

        // A runner that never returns on its own until cancelled.
        struct HangingRunner;
        #[async_trait::async_trait]
        impl AssistantRunner for HangingRunner {
            async fn run(
                &self,
                _work_dir: &std::path::Path,
                _prompt: &str,
                _iteration: u32,
                mut cancel: Cancel,
                _on_event: &mut (dyn FnMut(Event) + Send),
            ) -> Result<RunOutcome, RunnerError> {
                loop {
                    cancel.changed().await.ok();
                    if *cancel.borrow() {
                        return Err(RunnerError::Cancelled);
                    }
                }
            }
        }

        let instance = LoopInstance::new(
            "demo",
            prd_path,
            dir.path().join("no-global"),
            dir.path().join("no-project"),
            Arc::new(HangingRunner),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        instance.start(tx, Arc::new(|_: &str| {}));

        let _ = recv_events(&mut rx, 1).await;
        instance.stop();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if instance.snapshot().state == InstanceState::Stopped {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
