//! Test-only fixtures: a scratch git repository, a scripted agent backend, an
//! in-memory changeset store, and small renderer/tool helpers.

use std::collections::VecDeque;
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::plan::Node;
use crate::core::stop::millis;
use crate::core::types::FileDelta;
use crate::errors::ConductorError;
use crate::io::agent_backend::{AgentBackend, AgentInvocation, AgentProgress, BackendOutput};
use crate::io::vcs::{Changeset, ChangesetStore, WorkingCopyStatus};
use crate::scheduler::{Render, RenderContext, ToolFn, tool_fn};

/// Scratch git repository with one commit containing `README.md`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo dir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.path().join("README.md"), "hello\n").context("write README")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repository, failing on a non-zero exit.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// One scripted backend response, consumed in order.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Complete immediately with this output.
    Output(String),
    /// Deliver chunks one at a time, reporting progress after each.
    Stream {
        chunks: Vec<String>,
        tokens_per_chunk: u64,
    },
    /// Fail like a crashed process.
    Fail(String),
    /// Report empty progress until stopped, or time out after the duration.
    Hang(Duration),
}

const SCRIPTED_SESSION: &str = "scripted-session";

/// [`AgentBackend`] that replays [`ScriptedReply`] values and records every invocation.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<ScriptedReply>>,
    invocations: Mutex<Vec<AgentInvocation>>,
    chunks: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            invocations: Mutex::new(Vec::new()),
            chunks: AtomicUsize::new(0),
        }
    }

    /// Queue more replies after construction.
    pub fn push(&self, reply: ScriptedReply) {
        lock(&self.replies).push_back(reply);
    }

    pub fn invocations(&self) -> Vec<AgentInvocation> {
        lock(&self.invocations).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.invocations)
            .iter()
            .map(|inv| inv.prompt.clone())
            .collect()
    }

    /// Stream chunks handed to the progress observer so far.
    pub fn chunks_delivered(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }
}

impl AgentBackend for ScriptedBackend {
    fn run(
        &self,
        invocation: &AgentInvocation,
        on_progress: &mut dyn FnMut(&AgentProgress<'_>) -> ControlFlow<()>,
    ) -> Result<BackendOutput> {
        lock(&self.invocations).push(invocation.clone());
        let reply = lock(&self.replies)
            .pop_front()
            .ok_or_else(|| anyhow!("scripted backend has no replies left"))?;
        let session_id = Some(SCRIPTED_SESSION.to_string());

        match reply {
            ScriptedReply::Output(output) => Ok(BackendOutput {
                output,
                tokens_input: 10,
                tokens_output: 5,
                turns_used: 1,
                session_id,
                stopped: false,
            }),
            ScriptedReply::Fail(message) => Err(ConductorError::Execution(message).into()),
            ScriptedReply::Stream {
                chunks,
                tokens_per_chunk,
            } => {
                let mut output = String::new();
                let mut delivered = 0u32;
                let mut stopped = false;
                for chunk in chunks {
                    output.push_str(&chunk);
                    delivered += 1;
                    self.chunks.fetch_add(1, Ordering::SeqCst);
                    let progress = AgentProgress {
                        output: &output,
                        tokens_used: tokens_per_chunk * u64::from(delivered),
                        turns_used: delivered,
                    };
                    if on_progress(&progress).is_break() {
                        stopped = true;
                        break;
                    }
                }
                Ok(BackendOutput {
                    output,
                    tokens_input: 0,
                    tokens_output: tokens_per_chunk * u64::from(delivered),
                    turns_used: delivered,
                    session_id,
                    stopped,
                })
            }
            ScriptedReply::Hang(limit) => {
                let started = Instant::now();
                while started.elapsed() < limit {
                    let progress = AgentProgress {
                        output: "",
                        tokens_used: 0,
                        turns_used: 0,
                    };
                    if on_progress(&progress).is_break() {
                        return Ok(BackendOutput {
                            session_id,
                            stopped: true,
                            ..BackendOutput::default()
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(ConductorError::Timeout {
                    what: "scripted agent".to_string(),
                    elapsed_ms: millis(started.elapsed()),
                }
                .into())
            }
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    /// Oldest first.
    changesets: Vec<Changeset>,
    dirty: Vec<String>,
    fail_create: bool,
    fail_create_after: Option<usize>,
    creates: usize,
    fail_restore: bool,
    restored: Vec<String>,
    abandoned: Vec<String>,
    next_id: usize,
}

/// In-memory [`ChangesetStore`] with failure toggles.
#[derive(Debug)]
pub struct FakeChangesets {
    workdir: PathBuf,
    state: Mutex<FakeState>,
}

impl Default for FakeChangesets {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChangesets {
    pub fn new() -> Self {
        Self {
            workdir: PathBuf::from("/nonexistent/fake-changesets"),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Report these paths as pending working-copy changes.
    pub fn set_dirty(&self, paths: &[&str]) {
        self.state().dirty = paths.iter().map(|p| (*p).to_string()).collect();
    }

    pub fn fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    /// Let `n` creations succeed, then fail every later one.
    pub fn fail_create_after(&self, n: usize) {
        self.state().fail_create_after = Some(n);
    }

    pub fn fail_restore(&self, fail: bool) {
        self.state().fail_restore = fail;
    }

    /// Insert a changeset with an explicit creation time.
    pub fn push_changeset(&self, id: &str, description: &str, at: DateTime<Utc>, is_empty: bool) {
        self.state().changesets.push(Changeset {
            id: id.to_string(),
            change_id: id.to_string(),
            description: description.to_string(),
            author: "test@example.com".to_string(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            parent_ids: Vec::new(),
            bookmarks: Vec::new(),
            is_empty,
            has_conflicts: false,
        });
    }

    /// Changesets created through the trait, oldest first.
    pub fn created(&self) -> Vec<Changeset> {
        self.state().changesets.clone()
    }

    pub fn restored(&self) -> Vec<String> {
        self.state().restored.clone()
    }

    pub fn abandoned(&self) -> Vec<String> {
        self.state().abandoned.clone()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        lock(&self.state)
    }
}

impl ChangesetStore for FakeChangesets {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn create_changeset(&self, description: &str) -> Result<Changeset> {
        let mut state = self.state();
        let over_limit = state
            .fail_create_after
            .is_some_and(|limit| state.creates >= limit);
        if state.fail_create || over_limit {
            return Err(anyhow!("fake changeset creation failed"));
        }
        state.creates += 1;
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let changeset = Changeset {
            id: id.clone(),
            change_id: id,
            description: description.to_string(),
            author: "test@example.com".to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            parent_ids: Vec::new(),
            bookmarks: Vec::new(),
            is_empty: state.dirty.is_empty(),
            has_conflicts: false,
        };
        state.changesets.push(changeset.clone());
        Ok(changeset)
    }

    fn get_changeset(&self, id: &str) -> Result<Option<Changeset>> {
        Ok(self.state().changesets.iter().find(|cs| cs.id == id).cloned())
    }

    fn list_changesets(&self, limit: usize) -> Result<Vec<Changeset>> {
        Ok(self
            .state()
            .changesets
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    fn show_file_delta(&self, _id: &str) -> Result<FileDelta> {
        Ok(FileDelta {
            modified: self.state().dirty.clone(),
            ..FileDelta::default()
        })
    }

    fn create_bookmark(&self, name: &str, id: &str) -> Result<()> {
        let mut state = self.state();
        let changeset = state
            .changesets
            .iter_mut()
            .find(|cs| cs.id == id)
            .ok_or_else(|| anyhow!("no changeset {id}"))?;
        changeset.bookmarks.push(name.to_string());
        Ok(())
    }

    fn delete_bookmark(&self, name: &str) -> Result<()> {
        for changeset in &mut self.state().changesets {
            changeset.bookmarks.retain(|b| b != name);
        }
        Ok(())
    }

    fn abandon_changeset(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        let before = state.changesets.len();
        state.changesets.retain(|cs| cs.id != id);
        if state.changesets.len() < before {
            state.abandoned.push(id.to_string());
        }
        Ok(())
    }

    fn working_copy_status(&self) -> Result<WorkingCopyStatus> {
        Ok(WorkingCopyStatus {
            change_id: "fake-wc".to_string(),
            description: String::new(),
            bookmarks: Vec::new(),
            delta: FileDelta {
                modified: self.state().dirty.clone(),
                ..FileDelta::default()
            },
            has_conflicts: false,
        })
    }

    fn restore(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_restore {
            return Err(anyhow!("fake restore of {id} failed"));
        }
        state.restored.push(id.to_string());
        Ok(())
    }
}

/// Renderer that returns the same tree every iteration.
pub fn fixed_render(tree: Node) -> impl Render {
    move |_: &RenderContext<'_>| -> Result<Node> { Ok(tree.clone()) }
}

/// Tool that counts its invocations and echoes its input.
pub fn counting_tool() -> (ToolFn, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let tool = tool_fn(move |input: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(input.clone())
    });
    (tool, calls)
}

/// Tool that sleeps for `delay` and then returns its input.
pub fn sleeping_tool(delay: Duration) -> ToolFn {
    tool_fn(move |input: &Value| {
        thread::sleep(delay);
        Ok(input.clone())
    })
}

/// Tool that always fails with `message`.
pub fn failing_tool(message: &str) -> ToolFn {
    let message = message.to_string();
    tool_fn(move |_: &Value| Err(anyhow!("{message}")))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
