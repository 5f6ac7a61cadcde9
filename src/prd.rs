//! PRD document model, load/save with atomic writes, and a file watcher that
//! reconciles external edits (the assistant rewriting `prd.json`, or an
//! editor renaming it in and out of existence).

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// The root PRD document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prd {
    pub project: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "userStories")]
    pub user_stories: Vec<UserStory>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(rename = "acceptanceCriteria", default)]
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
    #[serde(default)]
    pub passes: bool,
    #[serde(rename = "inProgress", default)]
    pub in_progress: bool,
}

impl Prd {
    /// True iff every story passes.
    pub fn all_pass(&self) -> bool {
        self.user_stories.iter().all(|s| s.passes)
    }

    /// The lowest-priority (numerically smallest) story with `passes == false`,
    /// ties broken by position in `user_stories`.
    pub fn next_failing_story(&self) -> Option<&UserStory> {
        self.user_stories
            .iter()
            .filter(|s| !s.passes)
            .min_by_key(|s| s.priority)
    }

    /// Set `inProgress` on `story_id` and clear it everywhere else. No-op if
    /// `story_id` is not present (the engine still clears every flag).
    pub fn set_in_progress(&mut self, story_id: &str) {
        for story in &mut self.user_stories {
            story.in_progress = story.id == story_id;
        }
    }

    /// Clear `inProgress` on every story.
    pub fn clear_in_progress(&mut self) {
        for story in &mut self.user_stories {
            story.in_progress = false;
        }
    }
}

#[derive(Debug, Error)]
pub enum PrdError {
    #[error("PRD not found at {0}")]
    NotFound(PathBuf),
    #[error("PRD at {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Load the PRD at `path`.
pub fn load(path: &Path) -> Result<Prd, PrdError> {
    if !path.exists() {
        return Err(PrdError::NotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path).map_err(|source| PrdError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| PrdError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Save `prd` to `path` via temp-file-then-rename, so readers never observe a
/// half-written document. Pretty-printed. Creates parent directories.
pub fn save(path: &Path, prd: &Prd) -> Result<(), PrdError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|source| PrdError::Io {
        path: parent.to_path_buf(),
        source,
    })?;
    let pretty = serde_json::to_string_pretty(prd).map_err(|source| PrdError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("prd.json")
    ));
    std::fs::write(&tmp_path, pretty).map_err(|source| PrdError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| PrdError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// One reconciliation tick from the watcher: either the freshly re-read PRD,
/// or an error (I/O or malformed) that does not terminate the watcher.
#[derive(Debug)]
pub enum WatchEvent {
    Prd(Prd),
    Error(PrdError),
}

/// A restartable watcher over a single `prd.json` path. Coalesces bursts of
/// writes within `debounce` into one reconciliation read, and tolerates the
/// file disappearing and reappearing (editors rename-over-write).
pub struct Watcher_ {
    _inner: RecommendedWatcher,
    pub events: mpsc::UnboundedReceiver<WatchEvent>,
}

/// Start watching `path`. The returned receiver yields a `WatchEvent` after
/// every coalesced burst of filesystem activity on `path`.
pub fn watch(path: &Path, debounce: Duration) -> notify::Result<Watcher_> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
    let watch_path = path.to_path_buf();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
        if let Ok(event) = res
            && matches!(
                event.kind,
                EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
            )
        {
            let _ = raw_tx.send(());
        }
    })?;

    // Watch the parent directory rather than the file itself: editors that
    // rename-over-write would otherwise leave us watching a stale inode.
    let watch_dir = watch_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&watch_dir).ok();
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Some(()) = raw_rx.recv().await else {
                return;
            };
            // Coalesce a burst: drain anything else that arrived within the
            // debounce window before doing the (possibly expensive) re-read.
            tokio::time::sleep(debounce).await;
            while raw_rx.try_recv().is_ok() {}

            let event = match load(&watch_path) {
                Ok(prd) => WatchEvent::Prd(prd),
                Err(err) => WatchEvent::Error(err),
            };
            if out_tx.send(event).is_err() {
                return;
            }
        }
    });

    Ok(Watcher_ {
        _inner: watcher,
        events: out_rx,
    })
}
