//! Assembles the per-iteration instruction text handed to the assistant.
//!
//! Side-effect free: reading context directories can fail (missing, unreadable
//! file) without failing prompt assembly — a missing context file just
//! contributes nothing.

use std::path::Path;

const MISSION: &str = "\
You are working autonomously on a single PRD. Pick the next failing user \
story in priority order, implement it, and update the PRD document so its \
`passes` field reflects reality. When you begin a story, say so verbatim as \
\"Working on <id>: <title>\" so the engine can track progress. Do not stop \
until every story in the PRD passes or you run out of productive next steps \
for this iteration.";

/// Build the prompt for one iteration: mission statement, PRD path,
/// iteration counter, then concatenated context (`global_context_dir` before
/// `project_context_dir`, `.md` files only, sorted by filename).
pub fn build(prd_path: &Path, iteration: u32, global_context_dir: &Path, project_context_dir: &Path) -> String {
    let mut sections = vec![
        MISSION.to_string(),
        format!("PRD document: {}", prd_path.display()),
        format!("Iteration: {iteration}"),
    ];

    let context = load_context(global_context_dir, project_context_dir);
    if !context.is_empty() {
        sections.push(context);
    }

    sections.join("\n\n")
}

/// Concatenate `.md` files from `global_dir` then `project_dir`, each
/// directory's files sorted by filename, joined by a horizontal rule.
/// Unreadable directories or files contribute nothing rather than failing.
fn load_context(global_dir: &Path, project_dir: &Path) -> String {
    let mut blocks = Vec::new();
    blocks.extend(read_markdown_files(global_dir));
    blocks.extend(read_markdown_files(project_dir));
    blocks.join("\n\n---\n\n")
}

fn read_markdown_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut paths: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|p| std::fs::read_to_string(&p).ok())
        .collect()
}
