//! Resolves where a project keeps its specs, plans and task worktrees.

use std::fs;
use std::path::{Path, PathBuf};

pub const WARDEN_DIR: &str = ".warden";
pub const PLAN_FILE_NAME: &str = "implementation_plan.json";

/// Plan locations for one spec: the primary checkout and, when the task has
/// a worktree, the copy inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPaths {
    pub primary: PathBuf,
    pub worktree: Option<PathBuf>,
}

impl PlanPaths {
    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.primary).chain(self.worktree.iter())
    }
}

#[derive(Debug, Clone)]
pub struct SpecLocator {
    project_dir: PathBuf,
}

impl SpecLocator {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.project_dir.join(WARDEN_DIR).join("specs")
    }

    pub fn spec_dir(&self, spec_id: &str) -> PathBuf {
        self.specs_dir().join(spec_id)
    }

    pub fn worktrees_root(&self) -> PathBuf {
        self.project_dir
            .join(WARDEN_DIR)
            .join("worktrees")
            .join("tasks")
    }

    pub fn worktree_dir(&self, spec_id: &str) -> PathBuf {
        self.worktrees_root().join(spec_id)
    }

    pub fn numbering_lock_path(&self) -> PathBuf {
        self.project_dir
            .join(WARDEN_DIR)
            .join(".locks")
            .join("spec-numbering.lock")
    }

    pub fn plan_paths(&self, spec_id: &str) -> PlanPaths {
        let worktree_dir = self.worktree_dir(spec_id);
        let worktree = worktree_dir.is_dir().then(|| {
            worktree_dir
                .join(WARDEN_DIR)
                .join("specs")
                .join(spec_id)
                .join(PLAN_FILE_NAME)
        });
        PlanPaths {
            primary: self.spec_dir(spec_id).join(PLAN_FILE_NAME),
            worktree,
        }
    }

    /// The primary specs directory followed by every worktree's.
    pub fn all_specs_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.specs_dir()];
        if let Ok(entries) = fs::read_dir(self.worktrees_root()) {
            let mut worktrees: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .map(|p| p.join(WARDEN_DIR).join("specs"))
                .collect();
            worktrees.sort();
            dirs.extend(worktrees);
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_paths_without_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let loc = SpecLocator::new(dir.path());
        let paths = loc.plan_paths("001-init");
        assert!(paths
            .primary
            .ends_with(".warden/specs/001-init/implementation_plan.json"));
        assert!(paths.worktree.is_none());
        assert_eq!(paths.iter().count(), 1);
    }

    #[test]
    fn test_plan_paths_with_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let loc = SpecLocator::new(dir.path());
        fs::create_dir_all(loc.worktree_dir("002-x")).unwrap();
        let paths = loc.plan_paths("002-x");
        let worktree = paths.worktree.clone().unwrap();
        assert!(worktree.starts_with(loc.worktree_dir("002-x")));
        assert_eq!(paths.iter().count(), 2);
    }

    #[test]
    fn test_all_specs_dirs_lists_worktrees() {
        let dir = tempfile::tempdir().unwrap();
        let loc = SpecLocator::new(dir.path());
        fs::create_dir_all(loc.worktree_dir("b")).unwrap();
        fs::create_dir_all(loc.worktree_dir("a")).unwrap();
        let dirs = loc.all_specs_dirs();
        assert_eq!(dirs.len(), 3);
        assert_eq!(dirs[0], loc.specs_dir());
        assert!(dirs[1].starts_with(loc.worktree_dir("a")));
    }
}
