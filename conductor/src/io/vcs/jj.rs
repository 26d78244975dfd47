//! jj-backed changeset store.
//!
//! jj snapshots the working copy on every command, so creating a changeset is
//! `describe` on `@` followed by `new`; the described change becomes the
//! snapshot and work continues in a fresh child.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::core::types::FileDelta;
use crate::io::process::CommandOutput;
use crate::io::vcs::{Changeset, ChangesetStore, WorkingCopyStatus, run_vcs};

const FIELD_SEP: char = '\t';
const CHANGESET_TEMPLATE: &str = concat!(
    r#"commit_id ++ "\t" ++ change_id.short(12) ++ "\t" ++ description.first_line() ++ "\t" ++ "#,
    r#"author.email() ++ "\t" ++ committer.timestamp().utc().format("%Y-%m-%dT%H:%M:%SZ") ++ "\t" ++ "#,
    r#"parents.map(|p| p.commit_id()).join(",") ++ "\t" ++ bookmarks.map(|b| b.name()).join(",") ++ "\t" ++ "#,
    r#"if(empty, "1", "0") ++ "\t" ++ if(conflict, "1", "0") ++ "\n""#
);

/// Changeset store over the `jj` CLI.
#[derive(Debug, Clone)]
pub struct JjStore {
    workdir: PathBuf,
}

impl JjStore {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn log(&self, revset: &str, limit: Option<usize>) -> Result<Vec<Changeset>> {
        let mut args = vec![
            "log".to_string(),
            "--no-graph".to_string(),
            "-r".to_string(),
            revset.to_string(),
            "-T".to_string(),
            CHANGESET_TEMPLATE.to_string(),
        ];
        if let Some(limit) = limit {
            args.push("-n".to_string());
            args.push(limit.to_string());
        }
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run_capture(&refs)?;
        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_changeset_line)
            .collect()
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("jj {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("jj");
        cmd.args(args).arg("--color=never").current_dir(&self.workdir);
        run_vcs(cmd, &format!("jj {}", args.join(" ")))
    }
}

impl ChangesetStore for JjStore {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    #[instrument(skip_all, fields(description))]
    fn create_changeset(&self, description: &str) -> Result<Changeset> {
        self.run_checked(&["describe", "-r", "@", "-m", description])?;
        self.run_checked(&["new"])?;
        let changeset = self
            .log("@-", Some(1))?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("jj log returned no parent of @"))?;
        debug!(change_id = %changeset.change_id, "created changeset");
        Ok(changeset)
    }

    fn get_changeset(&self, id: &str) -> Result<Option<Changeset>> {
        let output = self.run(&["log", "--no-graph", "-r", id, "-T", CHANGESET_TEMPLATE])?;
        if !output.status.success() {
            return Ok(None);
        }
        let out = String::from_utf8_lossy(&output.stdout);
        match out.lines().find(|l| !l.trim().is_empty()) {
            Some(line) => Ok(Some(parse_changeset_line(line)?)),
            None => Ok(None),
        }
    }

    fn list_changesets(&self, limit: usize) -> Result<Vec<Changeset>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.log("mutable()", Some(limit))
    }

    fn show_file_delta(&self, id: &str) -> Result<FileDelta> {
        let out = self.run_capture(&["diff", "--summary", "-r", id])?;
        parse_summary(&out)
    }

    fn create_bookmark(&self, name: &str, id: &str) -> Result<()> {
        self.run_checked(&["bookmark", "set", name, "-r", id, "--allow-backwards"])?;
        Ok(())
    }

    fn delete_bookmark(&self, name: &str) -> Result<()> {
        self.run_checked(&["bookmark", "delete", name])?;
        Ok(())
    }

    #[instrument(skip_all, fields(id))]
    fn abandon_changeset(&self, id: &str) -> Result<()> {
        if self.get_changeset(id)?.is_none() {
            debug!("changeset already gone");
            return Ok(());
        }
        self.run_checked(&["abandon", id])?;
        Ok(())
    }

    fn working_copy_status(&self) -> Result<WorkingCopyStatus> {
        let current = self
            .log("@", Some(1))?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("jj log returned no working-copy change"))?;
        let delta = self.show_file_delta("@")?;
        Ok(WorkingCopyStatus {
            change_id: current.change_id,
            description: current.description,
            bookmarks: current.bookmarks,
            delta,
            has_conflicts: current.has_conflicts,
        })
    }

    #[instrument(skip_all, fields(id))]
    fn restore(&self, id: &str) -> Result<()> {
        self.run_checked(&["restore", "--from", id])?;
        Ok(())
    }
}

fn parse_changeset_line(line: &str) -> Result<Changeset> {
    let fields: Vec<&str> = line.split(FIELD_SEP).collect();
    if fields.len() != 9 {
        return Err(anyhow!("unexpected jj log line: '{line}'"));
    }
    let list = |raw: &str| -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };
    Ok(Changeset {
        id: fields[0].to_string(),
        change_id: fields[1].to_string(),
        description: fields[2].to_string(),
        author: fields[3].to_string(),
        timestamp: fields[4].to_string(),
        parent_ids: list(fields[5]),
        bookmarks: list(fields[6]),
        is_empty: fields[7] == "1",
        has_conflicts: fields[8].trim() == "1",
    })
}

fn parse_summary(out: &str) -> Result<FileDelta> {
    let mut delta = FileDelta::default();
    for line in out.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (status, path) = line
            .split_once(' ')
            .ok_or_else(|| anyhow!("unexpected jj diff summary line: '{line}'"))?;
        let path = path.trim().to_string();
        match status {
            "A" | "C" => delta.added.push(path),
            "D" => delta.deleted.push(path),
            "M" | "R" => delta.modified.push(path),
            other => return Err(anyhow!("unknown jj diff status '{other}' in '{line}'")),
        }
    }
    delta.sort();
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_changeset_line() {
        let line = "abc123\tqpvuntsm\tsnapshot: before Write\tdev@example.com\t2026-01-01T00:00:00Z\tp1,p2\tmain\t0\t1";
        let cs = parse_changeset_line(line).expect("parse");
        assert_eq!(cs.id, "abc123");
        assert_eq!(cs.change_id, "qpvuntsm");
        assert_eq!(cs.parent_ids, vec!["p1", "p2"]);
        assert_eq!(cs.bookmarks, vec!["main"]);
        assert!(!cs.is_empty);
        assert!(cs.has_conflicts);
        assert!(cs.created_at().is_ok());
    }

    #[test]
    fn empty_lists_parse_as_empty() {
        let line = "abc\tdef\t\t\t2026-01-01T00:00:00Z\t\t\t1\t0";
        let cs = parse_changeset_line(line).expect("parse");
        assert!(cs.parent_ids.is_empty());
        assert!(cs.bookmarks.is_empty());
        assert!(cs.is_empty);
    }

    #[test]
    fn rejects_short_lines() {
        assert!(parse_changeset_line("abc\tdef").is_err());
    }

    #[test]
    fn parses_diff_summary() {
        let delta = parse_summary("M src/lib.rs\nA notes.md\nD old.txt\n").expect("parse");
        assert_eq!(delta.modified, vec!["src/lib.rs"]);
        assert_eq!(delta.added, vec!["notes.md"]);
        assert_eq!(delta.deleted, vec!["old.txt"]);
        assert!(parse_summary("? weird").is_err());
    }
}
