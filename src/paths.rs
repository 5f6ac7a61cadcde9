//! Deterministic mapping from a working directory to per-project state paths.
//!
//! All other components resolve paths through [`Paths`] rather than joining
//! strings themselves, so the on-disk layout lives in exactly one place.

use std::path::{Path, PathBuf};

/// Resolves the on-disk layout rooted at `<home>/.chief/projects/<project-dir-name>/`.
///
/// `home` is injected rather than read from the environment directly so tests
/// can point it at a [`tempfile::TempDir`] instead of the real user home.
#[derive(Debug, Clone)]
pub struct Paths {
    home: PathBuf,
    project_dir_name: String,
}

impl Paths {
    /// Resolve paths for the project rooted at `working_dir`, using `home` as
    /// the home-directory source. Production code should pass the real home
    /// (e.g. from `$HOME`); tests pass a temporary directory.
    pub fn new(working_dir: &Path, home: PathBuf) -> Self {
        let project_dir_name = working_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        Self {
            home,
            project_dir_name,
        }
    }

    /// Same as [`Paths::new`] but with an explicit project name, bypassing
    /// derivation from a working directory's base name.
    pub fn with_project_name(home: PathBuf, project_dir_name: impl Into<String>) -> Self {
        Self {
            home,
            project_dir_name: project_dir_name.into(),
        }
    }

    /// `<home>/.chief/projects/<project-dir-name>/`
    pub fn state_root(&self) -> PathBuf {
        self.home
            .join(".chief")
            .join("projects")
            .join(&self.project_dir_name)
    }

    /// `<state-root>/prds/`
    pub fn prds_dir(&self) -> PathBuf {
        self.state_root().join("prds")
    }

    /// `<state-root>/prds/<name>/`
    pub fn prd_dir(&self, name: &str) -> PathBuf {
        self.prds_dir().join(name)
    }

    /// `<state-root>/prds/<name>/prd.json`
    pub fn prd_json(&self, name: &str) -> PathBuf {
        self.prd_dir(name).join("prd.json")
    }

    /// `<state-root>/prds/<name>/progress.md`
    pub fn progress_md(&self, name: &str) -> PathBuf {
        self.prd_dir(name).join("progress.md")
    }

    /// `<state-root>/config.yaml`
    pub fn config_yaml(&self) -> PathBuf {
        self.state_root().join("config.yaml")
    }

    /// `<state-root>/worktrees/`
    pub fn worktrees_dir(&self) -> PathBuf {
        self.state_root().join("worktrees")
    }

    /// `<state-root>/worktrees/<name>/`
    pub fn worktree_dir(&self, name: &str) -> PathBuf {
        self.worktrees_dir().join(name)
    }

    /// Per-project context directory: `<state-root>/context/`.
    pub fn project_context_dir(&self) -> PathBuf {
        self.state_root().join("context")
    }

    /// Global context directory: `<home>/.claude/context/`, shared across projects.
    pub fn global_context_dir(&self) -> PathBuf {
        self.home.join(".claude").join("context")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn state_root_keyed_by_working_dir_basename() {
        let home = TempDir::new().unwrap();
        let working_dir = Path::new("/some/path/my-project");
        let paths = Paths::new(working_dir, home.path().to_path_buf());
        assert_eq!(
            paths.state_root(),
            home.path().join(".chief/projects/my-project")
        );
    }

    #[test]
    fn prd_paths_nest_under_prds_dir() {
        let home = TempDir::new().unwrap();
        let paths = Paths::with_project_name(home.path().to_path_buf(), "demo");
        assert_eq!(
            paths.prd_json("auth"),
            paths.state_root().join("prds/auth/prd.json")
        );
        assert_eq!(
            paths.progress_md("auth"),
            paths.state_root().join("prds/auth/progress.md")
        );
    }

    #[test]
    fn context_dirs_are_global_then_per_project() {
        let home = TempDir::new().unwrap();
        let paths = Paths::with_project_name(home.path().to_path_buf(), "demo");
        assert_eq!(
            paths.global_context_dir(),
            home.path().join(".claude/context")
        );
        assert_eq!(
            paths.project_context_dir(),
            paths.state_root().join("context")
        );
    }

    #[test]
    fn worktree_dir_nests_under_worktrees() {
        let home = TempDir::new().unwrap();
        let paths = Paths::with_project_name(home.path().to_path_buf(), "demo");
        assert_eq!(
            paths.worktree_dir("auth"),
            paths.state_root().join("worktrees/auth")
        );
    }
}
