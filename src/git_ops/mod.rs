//! Version control for the self-evolving working tree.
//!
//! The evolution workspace is a git repo. Every accepted change is one
//! labeled commit, and the supervisor rolls back by resetting to the
//! previous commit.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, info, warn};

/// What the evolution pipeline and the supervisor need from a VCS.
pub trait VersionControl: Send + Sync {
    /// Stage `paths` and commit them. `Ok(None)` when nothing changed.
    fn commit(&self, paths: &[PathBuf], message: &str) -> Result<Option<String>>;

    /// Discard the latest evolution commit and its working-tree changes.
    /// Returns the new HEAD. When there is nothing to discard the tree is
    /// left alone and the current HEAD is returned.
    fn revert_to_previous(&self) -> Result<String>;

    /// Current HEAD, if any commit exists.
    fn head(&self) -> Result<Option<String>>;
}

pub struct GitRepo {
    dir: PathBuf,
    author_name: String,
    author_email: String,
    /// Subject prefix of commits a rollback may discard.
    evolution_prefix: Option<String>,
}

impl GitRepo {
    pub fn new(dir: &Path, author_name: &str, author_email: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
            evolution_prefix: None,
        }
    }

    /// Only roll back commits whose subject starts with `prefix`.
    pub fn with_evolution_prefix(mut self, prefix: &str) -> Self {
        self.evolution_prefix = Some(prefix.to_string()).filter(|p| !p.is_empty());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn git(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .env("GIT_AUTHOR_NAME", &self.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.author_email)
            .env("GIT_COMMITTER_NAME", &self.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.author_email)
            .current_dir(&self.dir)
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Initialize the workspace as a git repo with a baseline commit, if
    /// it is not one already.
    pub fn init(&self) -> Result<()> {
        if self.dir.join(".git").exists() {
            debug!("Evolution repo already initialized at {:?}", self.dir);
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        self.git_ok(&["init"])?;

        let gitignore = self.dir.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "data/\n*.db\n*.db-wal\n*.db-shm\n")?;
        }
        self.git_ok(&["add", "-A"])?;
        self.git_ok(&["commit", "--allow-empty", "-m", "Initial state"])?;

        info!("Initialized evolution repo at {:?}", self.dir);
        Ok(())
    }
}

impl VersionControl for GitRepo {
    fn commit(&self, paths: &[PathBuf], message: &str) -> Result<Option<String>> {
        let rel: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();

        let mut add: Vec<&str> = vec!["add", "--"];
        add.extend(rel.iter().map(String::as_str));
        self.git_ok(&add)?;

        // Exit status 0 means the index matches HEAD for these paths.
        let mut diff: Vec<&str> = vec!["diff", "--cached", "--quiet", "--"];
        diff.extend(rel.iter().map(String::as_str));
        let staged = self.git(&diff)?;
        if staged.status.success() {
            debug!("No changes to commit");
            return Ok(None);
        }

        let mut commit: Vec<&str> = vec!["commit", "-m", message, "--"];
        commit.extend(rel.iter().map(String::as_str));
        let output = self.git(&commit)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // "nothing to commit" is not an error
            if stderr.contains("nothing to commit") {
                return Ok(None);
            }
            bail!("git commit failed: {}", stderr.trim());
        }

        let id = self.git_ok(&["rev-parse", "HEAD"])?;
        debug!("Committed {}: {}", id, message);
        Ok(Some(id))
    }

    fn revert_to_previous(&self) -> Result<String> {
        let head = self.git_ok(&["rev-parse", "HEAD"])?;
        if !self
            .git(&["rev-parse", "--verify", "--quiet", "HEAD~1"])?
            .status
            .success()
        {
            warn!("Nothing to roll back: {} is the baseline commit", head);
            return Ok(head);
        }
        if let Some(prefix) = &self.evolution_prefix {
            let subject = self.git_ok(&["log", "-1", "--format=%s", "HEAD"])?;
            if !subject.starts_with(prefix.as_str()) {
                warn!("Nothing to roll back: HEAD {} is not an evolution commit", head);
                return Ok(head);
            }
        }

        self.git_ok(&["reset", "--hard", "HEAD~1"])?;
        let head = self.git_ok(&["rev-parse", "HEAD"])?;
        warn!("Rolled back evolution repo to {}", head);
        Ok(head)
    }

    fn head(&self) -> Result<Option<String>> {
        let output = self.git(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, GitRepo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::new(dir.path(), "warden", "warden@localhost");
        repo.init().unwrap();
        (dir, repo)
    }

    #[test]
    fn commit_returns_id_and_none_when_unchanged() {
        let (dir, repo) = repo();
        std::fs::write(dir.path().join("prompt.md"), "v1").unwrap();

        let first = repo
            .commit(&[PathBuf::from("prompt.md")], "[auto-evolve] v1")
            .unwrap();
        assert!(first.is_some());
        assert_eq!(repo.head().unwrap(), first);

        let again = repo
            .commit(&[PathBuf::from("prompt.md")], "[auto-evolve] v1 again")
            .unwrap();
        assert_eq!(again, None);
    }

    #[test]
    fn revert_restores_previous_content() {
        let (dir, repo) = repo();
        let file = dir.path().join("prompt.md");
        std::fs::write(&file, "good").unwrap();
        let good = repo.commit(&[PathBuf::from("prompt.md")], "good").unwrap().unwrap();
        std::fs::write(&file, "bad").unwrap();
        repo.commit(&[PathBuf::from("prompt.md")], "bad").unwrap();

        let head = repo.revert_to_previous().unwrap();
        assert_eq!(head, good);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "good");
    }

    #[test]
    fn revert_on_baseline_keeps_head() {
        let (_dir, repo) = repo();
        let baseline = repo.head().unwrap().unwrap();
        assert_eq!(repo.revert_to_previous().unwrap(), baseline);
        assert_eq!(repo.revert_to_previous().unwrap(), baseline);
    }

    #[test]
    fn revert_only_discards_evolution_commits() {
        let (dir, repo) = repo();
        let repo = repo.with_evolution_prefix("[auto-evolve]");
        let file = dir.path().join("notes.md");
        std::fs::write(&file, "hand edit").unwrap();
        let manual = repo
            .commit(&[PathBuf::from("notes.md")], "operator notes")
            .unwrap()
            .unwrap();
        assert_eq!(repo.revert_to_previous().unwrap(), manual);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "hand edit");

        std::fs::write(&file, "evolved").unwrap();
        repo.commit(&[PathBuf::from("notes.md")], "[auto-evolve] tidy notes")
            .unwrap();
        assert_eq!(repo.revert_to_previous().unwrap(), manual);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "hand edit");
    }

    #[test]
    fn revert_outside_a_repo_fails() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::new(dir.path(), "warden", "warden@localhost");
        assert!(repo.revert_to_previous().is_err());
    }
}
