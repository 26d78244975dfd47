//! Git-backed changeset store.
//!
//! Snapshots are written as detached commits built from a throwaway index, so
//! recording one never moves `HEAD`, the branch, or the user's staging area.
//! Each snapshot is kept alive by a ref under `refs/changesets/`; abandoning
//! deletes that ref.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::FileDelta;
use crate::io::process::CommandOutput;
use crate::io::vcs::{Changeset, ChangesetStore, WorkingCopyStatus, run_vcs};

const CHANGESET_REF_PREFIX: &str = "refs/changesets/";
const FIELD_SEP: char = '\u{1f}';
const SHOW_FORMAT: &str = "--format=%H%x1f%h%x1f%s%x1f%ae%x1f%cI%x1f%P";
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
const SNAPSHOT_INDEX: &str = "conductor-snapshot.index";

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    fn is_conflict(&self) -> bool {
        matches!(
            self.code.as_str(),
            "DD" | "AU" | "UD" | "UA" | "DU" | "AA" | "UU"
        )
    }
}

/// Changeset store over the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitStore {
    workdir: PathBuf,
}

impl GitStore {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Current `HEAD` sha, or `None` in a repository without commits.
    pub fn head(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "-q", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    fn git_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    fn resolve_commit(&self, id: &str) -> Result<Option<String>> {
        let revspec = format!("{id}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "-q", &revspec])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    fn tree_of(&self, rev: &str) -> Result<String> {
        let revspec = format!("{rev}^{{tree}}");
        Ok(self.run_capture(&["rev-parse", &revspec])?.trim().to_string())
    }

    fn bookmarks_at(&self, sha: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&[
            "for-each-ref",
            "--points-at",
            sha,
            "--format=%(refname:short)",
            "refs/heads",
        ])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn read_changeset(&self, sha: &str) -> Result<Changeset> {
        let out = self.run_capture(&["show", "-s", SHOW_FORMAT, sha])?;
        let mut changeset = parse_show_line(out.trim_end())?;
        let parent_tree = match changeset.parent_ids.first() {
            Some(parent) => self.tree_of(parent)?,
            None => EMPTY_TREE.to_string(),
        };
        changeset.is_empty = self.tree_of(sha)? == parent_tree;
        changeset.bookmarks = self.bookmarks_at(sha)?;
        Ok(changeset)
    }

    fn snapshot_tree(&self) -> Result<String> {
        let index = self.git_dir()?.join(SNAPSHOT_INDEX);
        if index.exists() {
            fs::remove_file(&index)
                .with_context(|| format!("remove stale {}", index.display()))?;
        }
        let result = (|| -> Result<String> {
            let env = [("GIT_INDEX_FILE", index.as_path())];
            self.run_checked_env(&["add", "-A"], &env)?;
            let out = self.run_checked_env(&["write-tree"], &env)?;
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
        })();
        if let Err(err) = fs::remove_file(&index) {
            warn!(err = %err, "failed to remove snapshot index");
        }
        result
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        self.run_checked_env(args, &[])
    }

    fn run_checked_env(&self, args: &[&str], env: &[(&str, &Path)]) -> Result<CommandOutput> {
        let output = self.run_env(args, env)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        self.run_env(args, &[])
    }

    fn run_env(&self, args: &[&str], env: &[(&str, &Path)]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        for (key, value) in env {
            cmd.env(key, value);
        }
        run_vcs(cmd, &format!("git {}", args.join(" ")))
    }
}

impl ChangesetStore for GitStore {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    #[instrument(skip_all, fields(description))]
    fn create_changeset(&self, description: &str) -> Result<Changeset> {
        let tree = self.snapshot_tree()?;
        let mut args = vec!["commit-tree", tree.as_str(), "-m", description];
        let head = self.head()?;
        if let Some(head) = head.as_deref() {
            args.extend(["-p", head]);
        }
        let sha = self.run_capture(&args)?.trim().to_string();
        let ref_name = format!("{CHANGESET_REF_PREFIX}{sha}");
        self.run_checked(&["update-ref", &ref_name, &sha])?;
        debug!(sha = %sha, "created changeset");
        self.read_changeset(&sha)
    }

    fn get_changeset(&self, id: &str) -> Result<Option<Changeset>> {
        match self.resolve_commit(id)? {
            Some(sha) => Ok(Some(self.read_changeset(&sha)?)),
            None => Ok(None),
        }
    }

    fn list_changesets(&self, limit: usize) -> Result<Vec<Changeset>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let count = format!("--count={}", limit.min(i32::MAX as usize));
        let out = self.run_capture(&[
            "for-each-ref",
            "--sort=-committerdate",
            &count,
            "--format=%(objectname)",
            CHANGESET_REF_PREFIX,
        ])?;
        out.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|sha| self.read_changeset(sha))
            .collect()
    }

    fn show_file_delta(&self, id: &str) -> Result<FileDelta> {
        let out = self.run_capture(&[
            "diff-tree",
            "-r",
            "--no-commit-id",
            "--name-status",
            "--root",
            id,
        ])?;
        parse_name_status(&out)
    }

    fn create_bookmark(&self, name: &str, id: &str) -> Result<()> {
        self.run_checked(&["branch", "-f", name, id])?;
        Ok(())
    }

    fn delete_bookmark(&self, name: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", name])?;
        Ok(())
    }

    #[instrument(skip_all, fields(id))]
    fn abandon_changeset(&self, id: &str) -> Result<()> {
        let Some(sha) = self.resolve_commit(id)? else {
            debug!("changeset already gone");
            return Ok(());
        };
        let ref_name = format!("{CHANGESET_REF_PREFIX}{sha}");
        let exists = self
            .run(&["show-ref", "--verify", "--quiet", &ref_name])?
            .status
            .success();
        if !exists {
            debug!("no changeset ref, nothing to abandon");
            return Ok(());
        }
        self.run_checked(&["update-ref", "-d", &ref_name])?;
        Ok(())
    }

    fn working_copy_status(&self) -> Result<WorkingCopyStatus> {
        let entries = self.status_porcelain()?;
        let has_conflicts = entries.iter().any(StatusEntry::is_conflict);
        let delta = delta_from_status(&entries);

        let (change_id, description) = match self.head()? {
            Some(head) => {
                let out = self.run_capture(&["show", "-s", "--format=%h%x1f%s", &head])?;
                let (short, subject) = out
                    .trim_end()
                    .split_once(FIELD_SEP)
                    .ok_or_else(|| anyhow!("unexpected git show output '{}'", out.trim()))?;
                (short.to_string(), subject.to_string())
            }
            None => (String::new(), String::new()),
        };
        let branch = self.run(&["symbolic-ref", "--short", "-q", "HEAD"])?;
        let bookmarks = if branch.status.success() {
            vec![String::from_utf8_lossy(&branch.stdout).trim().to_string()]
        } else {
            Vec::new()
        };

        Ok(WorkingCopyStatus {
            change_id,
            description,
            bookmarks,
            delta,
            has_conflicts,
        })
    }

    #[instrument(skip_all, fields(id))]
    fn restore(&self, id: &str) -> Result<()> {
        let sha = self
            .resolve_commit(id)?
            .ok_or_else(|| anyhow!("unknown changeset {id}"))?;
        self.run_checked(&["read-tree", "-u", "--reset", &sha])?;
        self.run_checked(&["clean", "-f", "-d", "-q"])?;
        // Put the real index back on HEAD; the worktree keeps the snapshot.
        if self.head()?.is_some() {
            self.run_checked(&["reset", "-q"])?;
        } else {
            self.run_checked(&["read-tree", "--empty"])?;
        }
        debug!(sha = %sha, "restored working copy");
        Ok(())
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn delta_from_status(entries: &[StatusEntry]) -> FileDelta {
    let mut delta = FileDelta::default();
    for entry in entries {
        let code = entry.code.as_str();
        if code == "??" || (code.starts_with('A') && !entry.is_conflict()) {
            delta.added.push(entry.path.clone());
        } else if code.contains('D') && !entry.is_conflict() {
            delta.deleted.push(entry.path.clone());
        } else {
            delta.modified.push(entry.path.clone());
        }
    }
    delta.sort();
    delta
}

fn parse_show_line(line: &str) -> Result<Changeset> {
    let fields: Vec<&str> = line.split(FIELD_SEP).collect();
    if fields.len() != 6 {
        return Err(anyhow!("unexpected git show output: '{line}'"));
    }
    Ok(Changeset {
        id: fields[0].to_string(),
        change_id: fields[1].to_string(),
        description: fields[2].to_string(),
        author: fields[3].to_string(),
        timestamp: fields[4].to_string(),
        parent_ids: fields[5].split_whitespace().map(str::to_string).collect(),
        bookmarks: Vec::new(),
        is_empty: false,
        has_conflicts: false,
    })
}

fn parse_name_status(out: &str) -> Result<FileDelta> {
    let mut delta = FileDelta::default();
    for line in out.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.split('\t');
        let status = parts.next().unwrap_or_default();
        let path = parts
            .next_back()
            .ok_or_else(|| anyhow!("unexpected name-status line: '{line}'"))?
            .to_string();
        match status.chars().next() {
            Some('A') | Some('C') => delta.added.push(path),
            Some('D') => delta.deleted.push(path),
            Some('M') | Some('T') | Some('R') => delta.modified.push(path),
            _ => return Err(anyhow!("unexpected name-status line: '{line}'")),
        }
    }
    delta.sort();
    Ok(delta)
}
