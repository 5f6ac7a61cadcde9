//! Append-only per-story Markdown log, read as a map keyed by story ID.
//!
//! Format: headers of the form `## <storyId>` delimit blocks; lines until
//! the next such header belong to that block.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Parse `progress_path` into a map from story id to the ordered sequence of
/// Markdown blocks recorded for it. Missing file yields an empty map.
pub fn parse(progress_path: &Path) -> Result<HashMap<String, Vec<String>>> {
    if !progress_path.exists() {
        return Ok(HashMap::new());
    }
    let contents = std::fs::read_to_string(progress_path)
        .with_context(|| format!("failed to read {}", progress_path.display()))?;
    Ok(parse_str(&contents))
}

fn parse_str(contents: &str) -> HashMap<String, Vec<String>> {
    let mut blocks: HashMap<String, Vec<String>> = HashMap::new();
    let mut current_id: Option<String> = None;
    let mut current_lines: Vec<String> = Vec::new();

    for line in contents.lines() {
        if let Some(id) = line.strip_prefix("## ") {
            if let Some(prev_id) = current_id.take() {
                blocks.entry(prev_id).or_default().push(current_lines.join("\n"));
            }
            current_lines = Vec::new();
            current_id = Some(id.trim().to_string());
        } else if current_id.is_some() {
            current_lines.push(line.to_string());
        }
    }
    if let Some(id) = current_id {
        blocks.entry(id).or_default().push(current_lines.join("\n"));
    }

    blocks
}

/// One reconciliation tick from the watcher: either the freshly re-read
/// progress map, or an error (tolerated, not fatal to the watcher).
#[derive(Debug)]
pub enum WatchEvent {
    Progress(HashMap<String, Vec<String>>),
    Error(anyhow::Error),
}

/// A restartable watcher over a single `progress.md` path, mirroring
/// [`crate::prd::watch`]: coalesces bursts of writes within `debounce` into
/// one reconciliation read, and tolerates the file disappearing and
/// reappearing.
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
            tokio::time::sleep(debounce).await;
            while raw_rx.try_recv().is_ok() {}

            let event = match parse(&watch_path) {
                Ok(blocks) => WatchEvent::Progress(blocks),
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_empty_map() {
        let dir = TempDir::new().unwrap();
        let map = parse(&dir.path().join("progress.md")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn single_story_single_block() {
        let map = parse_str("## US-001\nStarted working on login.\nFinished.\n");
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get("US-001").unwrap(),
            &vec!["Started working on login.\nFinished.".to_string()]
        );
    }

    #[test]
    fn repeated_story_id_accumulates_in_order() {
        let map = parse_str("## US-001\nAttempt one.\n## US-001\nAttempt two.\n");
        let entries = map.get("US-001").unwrap();
        assert_eq!(entries, &vec!["Attempt one.".to_string(), "Attempt two.".to_string()]);
    }

    #[test]
    fn multiple_stories_are_independent() {
        let map = parse_str("## US-001\nLogin work.\n## US-002\nLogout work.\n");
        assert_eq!(map.get("US-001").unwrap(), &vec!["Login work.".to_string()]);
        assert_eq!(map.get("US-002").unwrap(), &vec!["Logout work.".to_string()]);
    }

    #[test]
    fn content_before_first_header_is_ignored() {
        let map = parse_str("preamble with no header\n## US-001\nreal content\n");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("US-001").unwrap(), &vec!["real content".to_string()]);
    }

    #[tokio::test]
    async fn watcher_reports_reload_after_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.md");
        std::fs::write(&path, "## US-001\nstarted\n").unwrap();

        let mut watcher = watch(&path, std::time::Duration::from_millis(20)).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        std::fs::write(&path, "## US-001\nstarted\n## US-001\nfinished\n").unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), watcher.events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            WatchEvent::Progress(blocks) => {
                assert_eq!(blocks.get("US-001").unwrap().len(), 2);
            }
            WatchEvent::Error(err) => panic!("unexpected error: {err}"),
        }
    }
}
