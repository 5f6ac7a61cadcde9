//! Registry of loop instances keyed by PRD name, with fan-in of all instance
//! events onto one consumer channel and post-completion push/PR hooks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::event::{Event, PostCompletionResult, TaggedEvent};
use crate::git;
use crate::instance::{InstanceState, LoopInstance, Snapshot};
use crate::paths::Paths;
use crate::progress;
use crate::runner::AssistantRunner;

/// Debounce window for the progress-log watcher, coalescing bursts of
/// `progress.md` writes into one reconciliation read.
const PROGRESS_WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Registry of [`LoopInstance`]s plus the event/result channels every
/// instance forwards onto.
pub struct Manager {
    paths: Paths,
    repo_dir: PathBuf,
    config: Config,
    instances: Mutex<HashMap<String, LoopInstance>>,
    runner: Arc<dyn AssistantRunner>,
    default_max_iterations: Mutex<u32>,
    retry_disabled: Mutex<bool>,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TaggedEvent>>>,
    results_tx: mpsc::UnboundedSender<PostCompletionResult>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<PostCompletionResult>>>,
    completion_callback: Mutex<Option<Arc<dyn Fn(&str) + Send + Sync>>>,
}

impl Manager {
    pub fn new(paths: Paths, repo_dir: PathBuf, config: Config, runner: Arc<dyn AssistantRunner>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            paths,
            repo_dir,
            config,
            instances: Mutex::new(HashMap::new()),
            runner,
            default_max_iterations: Mutex::new(50),
            retry_disabled: Mutex::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            completion_callback: Mutex::new(None),
        }
    }

    /// Take ownership of the shared event stream. Callable once; subsequent
    /// calls return `None`.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<TaggedEvent>> {
        self.events_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Take ownership of the out-of-band post-completion result stream.
    pub fn results(&self) -> Option<mpsc::UnboundedReceiver<PostCompletionResult>> {
        self.results_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn set_completion_callback(&self, cb: Arc<dyn Fn(&str) + Send + Sync>) {
        *self.completion_callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(cb);
    }

    pub fn set_max_iterations(&self, n: u32) {
        *self.default_max_iterations.lock().unwrap_or_else(|e| e.into_inner()) = n;
        for instance in self.instances.lock().unwrap_or_else(|e| e.into_inner()).values() {
            instance.set_max_iterations(n);
        }
    }

    pub fn set_max_iterations_for_instance(&self, name: &str, n: u32) {
        if let Some(instance) = self.instances.lock().unwrap_or_else(|e| e.into_inner()).get(name) {
            instance.set_max_iterations(n);
        }
    }

    pub fn disable_retry(&self) {
        *self.retry_disabled.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.runner.set_retry_enabled(false);
    }

    /// Idempotently create a `Ready` instance running in the repository root.
    pub fn register(&self, name: &str) {
        self.register_instance(name, None, None);
    }

    /// Idempotently create a `Ready` instance running in its own worktree.
    pub fn register_with_worktree(&self, name: &str, worktree_dir: PathBuf, branch: String) {
        self.register_instance(name, Some(worktree_dir), Some(branch));
    }

    fn register_instance(&self, name: &str, worktree_dir: Option<PathBuf>, branch: Option<String>) {
        let instance = {
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            if instances.contains_key(name) {
                return;
            }
            let prd_path = self.paths.prd_json(name);
            let instance = LoopInstance::new(
                name.to_string(),
                prd_path,
                self.paths.global_context_dir(),
                self.paths.project_context_dir(),
                self.runner.clone(),
            );
            instance.set_max_iterations(*self.default_max_iterations.lock().unwrap_or_else(|e| e.into_inner()));
            if let (Some(dir), Some(branch)) = (worktree_dir, branch) {
                instance.update_worktree_info(dir, branch);
            }
            instances.insert(name.to_string(), instance.clone());
            instance
        };
        self.spawn_progress_watcher(name, instance);
    }

    /// Watch `progress.md` for this PRD for the lifetime of the manager,
    /// forwarding reconciled reads onto the shared event channel so external
    /// edits to the progress log (not just the runner's own stream) reach
    /// consumers of [`Manager::events`].
    fn spawn_progress_watcher(&self, name: &str, instance: LoopInstance) {
        let progress_path = self.paths.progress_md(name);
        let events_tx = self.events_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut watcher = match progress::watch(&progress_path, PROGRESS_WATCH_DEBOUNCE) {
                Ok(w) => w,
                Err(e) => {
                    warn!(prd = %name, error = %e, "failed to start progress watcher");
                    return;
                }
            };
            while let Some(event) = watcher.events.recv().await {
                match event {
                    progress::WatchEvent::Progress(blocks) => {
                        let iteration = instance.snapshot().iteration;
                        let _ = events_tx.send(TaggedEvent {
                            prd_name: name.clone(),
                            event: Event::ProgressUpdated { iteration, blocks },
                        });
                    }
                    progress::WatchEvent::Error(e) => {
                        warn!(prd = %name, error = %e, "failed to reload progress log");
                    }
                }
            }
        });
    }

    pub fn update_worktree_info(&self, name: &str, dir: PathBuf, branch: String) {
        if let Some(instance) = self.instances.lock().unwrap_or_else(|e| e.into_inner()).get(name) {
            instance.update_worktree_info(dir, branch);
        }
    }

    pub fn clear_worktree_info(&self, name: &str, also_delete_branch: bool) {
        let (branch, repo_dir) = {
            let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            let Some(instance) = instances.get(name) else { return };
            let snapshot = instance.snapshot();
            instance.clear_worktree_info();
            (snapshot.branch, self.repo_dir.clone())
        };
        if also_delete_branch
            && let Some(branch) = branch
            && let Err(e) = git::delete_branch(&repo_dir, &branch, false)
        {
            warn!(prd = name, error = %e, "failed to delete branch after clearing worktree info");
        }
    }

    pub fn get_instance(&self, name: &str) -> Option<Snapshot> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(LoopInstance::snapshot)
    }

    pub fn get_all_instances(&self) -> Vec<(String, Snapshot)> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, instance)| (name.clone(), instance.snapshot()))
            .collect()
    }

    pub fn get_state(&self, name: &str) -> Option<(InstanceState, u32, Option<String>)> {
        self.get_instance(name).map(|s| (s.state, s.iteration, s.last_error))
    }

    pub fn start(&self, name: &str) {
        let instance = self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned();
        let Some(instance) = instance else {
            warn!(prd = name, "start requested for unregistered PRD");
            return;
        };

        let events_tx = self.events_tx.clone();
        let results_tx = self.results_tx.clone();
        let config = self.config.clone();
        let repo_dir = self.repo_dir.clone();
        let paths = self.paths.clone();
        let name_owned = name.to_string();
        let user_callback = self.completion_callback.lock().unwrap_or_else(|e| e.into_inner()).clone();

        let instance_for_completion = instance.clone();
        let completion_cb: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(move |prd_name: &str| {
            if let Some(cb) = &user_callback {
                cb(prd_name);
            }
            let snapshot = instance_for_completion.snapshot();
            let config = config.clone();
            let repo_dir = repo_dir.clone();
            let results_tx = results_tx.clone();
            let paths = paths.clone();
            let name_owned = name_owned.clone();
            tokio::spawn(async move {
                run_post_completion(&name_owned, &snapshot, &config, &repo_dir, &paths, &results_tx);
            });
        });

        info!(prd = name, "starting loop instance");
        instance.start(events_tx, completion_cb);
    }

    pub fn pause(&self, name: &str) {
        if let Some(instance) = self.instances.lock().unwrap_or_else(|e| e.into_inner()).get(name) {
            instance.pause();
        }
    }

    pub fn stop(&self, name: &str) {
        if let Some(instance) = self.instances.lock().unwrap_or_else(|e| e.into_inner()).get(name) {
            instance.stop();
        }
    }

    pub fn stop_all(&self) {
        for instance in self.instances.lock().unwrap_or_else(|e| e.into_inner()).values() {
            instance.stop();
        }
    }
}

fn run_post_completion(
    name: &str,
    snapshot: &Snapshot,
    config: &Config,
    repo_dir: &std::path::Path,
    paths: &Paths,
    results_tx: &mpsc::UnboundedSender<PostCompletionResult>,
) {
    let Some(branch) = &snapshot.branch else { return };
    if !config.on_complete.push {
        return;
    }
    let dir = snapshot.worktree_dir.as_deref().unwrap_or(repo_dir);
    match git::push_branch(dir, branch) {
        Ok(()) => {
            let _ = results_tx.send(PostCompletionResult::Pushed {
                prd_name: name.to_string(),
                branch: branch.clone(),
            });
        }
        Err(e) => {
            let _ = results_tx.send(PostCompletionResult::PushFailed {
                prd_name: name.to_string(),
                err: e.to_string(),
            });
            return;
        }
    }

    if !config.on_complete.create_pr {
        return;
    }
    let title = match crate::prd::load(&paths.prd_json(name)) {
        Ok(prd) => format!("{}: {}", name, prd.project),
        Err(_) => name.to_string(),
    };
    match git::create_pr(dir, branch, &title, "Automated PRD completion.") {
        Ok(url) => {
            let _ = results_tx.send(PostCompletionResult::PullRequestCreated {
                prd_name: name.to_string(),
                url,
            });
        }
        Err(e) => {
            let _ = results_tx.send(PostCompletionResult::PullRequestFailed {
                prd_name: name.to_string(),
                err: e.to_string(),
            });
        }
    }
}
