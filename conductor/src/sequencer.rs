//! Phase/step sequencing.
//!
//! A [`Sequencer`] is an ordered registry of named units plus a persisted
//! cursor. Units get a stable index on first registration, so re-rendering the
//! same declarations maps them back to the same positions. In sequential mode
//! only the unit at `current_index` is active; in parallel mode every
//! registered unit that has not finished is active.
//!
//! State lives in one store entry per scope (`<execution>/seq/<scope>`), so a
//! resumed execution picks up the cursor, the halt and the fired flag.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::io::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceMode {
    #[default]
    Sequential,
    Parallel,
}

/// Persisted sequencer state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceState {
    pub units: Vec<String>,
    pub current_index: usize,
    /// Finished indices (parallel mode).
    pub done: BTreeSet<usize>,
    pub halted: Option<Halt>,
    /// The all-complete callback has fired.
    pub fired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Halt {
    pub index: usize,
    pub error: String,
}

type CompleteCallback = Box<dyn FnMut(&str) + Send>;
type ErrorCallback = Box<dyn FnMut(&str, &str, &str) + Send>;

/// Ordered unit registry for one scope of one execution.
pub struct Sequencer {
    store: Store,
    key: String,
    scope: String,
    mode: SequenceMode,
    state: SequenceState,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Store key holding the state for `scope`.
pub fn sequence_key(execution_id: &str, scope: &str) -> String {
    format!("{execution_id}/seq/{scope}")
}

impl Sequencer {
    /// Load the persisted state for `scope`, or start empty.
    pub fn load(store: Store, execution_id: &str, scope: &str, mode: SequenceMode) -> Result<Self> {
        let key = sequence_key(execution_id, scope);
        let state = match store.get_state(&key)? {
            Some(value) => serde_json::from_value(value)
                .with_context(|| format!("parse sequencer state {key}"))?,
            None => SequenceState::default(),
        };
        Ok(Self {
            store,
            key,
            scope: scope.to_string(),
            mode,
            state,
            on_complete: None,
            on_error: None,
        })
    }

    /// Called with the scope once, when every registered unit has finished.
    pub fn on_complete(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Called with `(scope, unit, error)` when a unit fails.
    pub fn on_error(mut self, callback: impl FnMut(&str, &str, &str) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn set_mode(&mut self, mode: SequenceMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> SequenceMode {
        self.mode
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn state(&self) -> &SequenceState {
        &self.state
    }

    pub fn len(&self) -> usize {
        self.state.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.units.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.state.current_index
    }

    pub fn unit_name(&self, index: usize) -> Option<&str> {
        self.state.units.get(index).map(String::as_str)
    }

    /// Stable index for `name`, registering it on first sight.
    pub fn register(&mut self, name: &str) -> Result<usize> {
        if let Some(index) = self.state.units.iter().position(|unit| unit == name) {
            return Ok(index);
        }
        self.state.units.push(name.to_string());
        let index = self.state.units.len() - 1;
        debug!(scope = %self.scope, name, index, "registered unit");
        self.persist("register")?;
        Ok(index)
    }

    pub fn is_active(&self, index: usize) -> bool {
        if self.state.halted.is_some() || index >= self.state.units.len() {
            return false;
        }
        match self.mode {
            SequenceMode::Sequential => index == self.state.current_index,
            SequenceMode::Parallel => !self.state.done.contains(&index),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.halted.is_none() && self.state.current_index >= self.state.units.len()
    }

    pub fn halted(&self) -> Option<&Halt> {
        self.state.halted.as_ref()
    }

    /// Finish the active unit `index`. Returns `false` when refused.
    pub fn advance(&mut self, index: usize) -> Result<bool> {
        self.finish(index, "advance")
    }

    /// Skip the active unit `index`. Returns `false` when refused.
    pub fn skip(&mut self, index: usize) -> Result<bool> {
        self.finish(index, "skip")
    }

    /// Halt the sequence at `index`. Returns `false` when `index` is not active.
    pub fn fail(&mut self, index: usize, error: &str) -> Result<bool> {
        if !self.is_active(index) {
            warn!(scope = %self.scope, index, "fail refused: unit not active");
            return Ok(false);
        }
        self.state.halted = Some(Halt {
            index,
            error: error.to_string(),
        });
        self.persist("fail")?;
        let unit = self.state.units[index].clone();
        info!(scope = %self.scope, unit = %unit, error, "sequence halted");
        if let Some(callback) = self.on_error.as_mut() {
            callback(&self.scope, &unit, error);
        }
        Ok(true)
    }

    /// Clear a halt so the failed unit becomes active again.
    pub fn resolve(&mut self) -> Result<()> {
        if self.state.halted.take().is_some() {
            self.persist("resolve")?;
        }
        Ok(())
    }

    fn finish(&mut self, index: usize, action: &str) -> Result<bool> {
        if !self.is_active(index) {
            debug!(scope = %self.scope, index, action, "refused: unit not active");
            return Ok(false);
        }
        match self.mode {
            SequenceMode::Sequential => self.state.current_index += 1,
            SequenceMode::Parallel => {
                self.state.done.insert(index);
                while self.state.done.contains(&self.state.current_index) {
                    self.state.current_index += 1;
                }
            }
        }
        let completes = !self.state.fired && self.state.current_index >= self.state.units.len();
        if completes {
            self.state.fired = true;
        }
        self.persist(action)?;
        debug!(
            scope = %self.scope,
            index,
            current_index = self.state.current_index,
            action,
            "unit finished"
        );
        if completes {
            info!(scope = %self.scope, units = self.state.units.len(), "sequence complete");
            if let Some(callback) = self.on_complete.as_mut() {
                callback(&self.scope);
            }
        }
        Ok(true)
    }

    fn persist(&self, action: &str) -> Result<()> {
        let value = serde_json::to_value(&self.state).context("serialize sequencer state")?;
        self.store
            .set_state(&self.key, &value, &format!("sequencer:{action}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn store() -> (tempfile::TempDir, Store) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("store");
        (temp, store)
    }

    #[test]
    fn registration_is_stable_across_reloads() {
        let (_temp, store) = store();
        let mut seq = Sequencer::load(store.clone(), "e1", "phase", SequenceMode::Sequential)
            .expect("load");
        assert_eq!(seq.register("build").expect("reg"), 0);
        assert_eq!(seq.register("test").expect("reg"), 1);
        assert_eq!(seq.register("build").expect("reg"), 0);

        let mut again =
            Sequencer::load(store, "e1", "phase", SequenceMode::Sequential).expect("reload");
        assert_eq!(again.register("test").expect("reg"), 1);
        assert_eq!(again.len(), 2);
    }

    /// Exactly one unit is active in sequential mode until the sequence ends.
    #[test]
    fn sequential_mode_has_one_active_unit() {
        let (_temp, store) = store();
        let mut seq =
            Sequencer::load(store, "e1", "step", SequenceMode::Sequential).expect("load");
        for name in ["a", "b", "c"] {
            seq.register(name).expect("reg");
        }
        for expected in 0..3 {
            let active: Vec<usize> = (0..3).filter(|&i| seq.is_active(i)).collect();
            assert_eq!(active, vec![expected]);
            assert!(!seq.advance(expected + 1).expect("advance wrong unit"));
            assert!(seq.advance(expected).expect("advance"));
        }
        assert!((0..3).all(|i| !seq.is_active(i)));
        assert!(seq.is_complete());
    }

    #[test]
    fn completion_fires_exactly_once_even_after_reload() {
        let (_temp, store) = store();
        let fired = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&fired);
        let mut seq = Sequencer::load(store.clone(), "e1", "step", SequenceMode::Sequential)
            .expect("load")
            .on_complete(move |_| *counter.lock().expect("lock") += 1);
        seq.register("a").expect("reg");
        seq.register("b").expect("reg");
        assert!(seq.advance(0).expect("a"));
        assert_eq!(*fired.lock().expect("lock"), 0);
        assert!(seq.skip(1).expect("b"));
        assert_eq!(*fired.lock().expect("lock"), 1);
        assert!(!seq.advance(1).expect("again"));

        let counter = Arc::clone(&fired);
        let mut resumed = Sequencer::load(store, "e1", "step", SequenceMode::Sequential)
            .expect("reload")
            .on_complete(move |_| *counter.lock().expect("lock") += 1);
        resumed.register("c").expect("reg");
        assert!(resumed.advance(2).expect("c"));
        assert_eq!(*fired.lock().expect("lock"), 1);
    }

    #[test]
    fn failure_halts_until_resolved() {
        let (_temp, store) = store();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let mut seq = Sequencer::load(store, "e1", "phase", SequenceMode::Sequential)
            .expect("load")
            .on_error(move |_, unit, err| {
                sink.lock().expect("lock").push(format!("{unit}: {err}"));
            });
        seq.register("a").expect("reg");
        seq.register("b").expect("reg");

        assert!(seq.fail(0, "boom").expect("fail"));
        assert!(!seq.is_active(0));
        assert!(!seq.advance(0).expect("advance while halted"));
        assert!(!seq.skip(0).expect("skip while halted"));
        assert_eq!(*errors.lock().expect("lock"), vec!["a: boom".to_string()]);
        assert_eq!(seq.halted().expect("halt").index, 0);

        seq.resolve().expect("resolve");
        assert!(seq.is_active(0));
        assert!(seq.advance(0).expect("advance"));
        assert_eq!(seq.current_index(), 1);
    }

    #[test]
    fn parallel_mode_activates_every_unfinished_unit() {
        let (_temp, store) = store();
        let mut seq =
            Sequencer::load(store, "e1", "step:build", SequenceMode::Parallel).expect("load");
        for name in ["a", "b", "c"] {
            seq.register(name).expect("reg");
        }
        assert!((0..3).all(|i| seq.is_active(i)));
        assert!(seq.advance(2).expect("c"));
        assert_eq!(seq.current_index(), 0);
        assert!(seq.advance(0).expect("a"));
        assert_eq!(seq.current_index(), 1);
        assert!(!seq.is_active(2));
        assert!(seq.advance(1).expect("b"));
        assert_eq!(seq.current_index(), 3);
        assert!(seq.is_complete());
    }

    #[test]
    fn current_index_is_persisted_under_scope_key() {
        let (_temp, store) = store();
        let mut seq =
            Sequencer::load(store.clone(), "e9", "step", SequenceMode::Sequential).expect("load");
        seq.register("only").expect("reg");
        seq.advance(0).expect("advance");
        let raw = store
            .get_state(&sequence_key("e9", "step"))
            .expect("get")
            .expect("persisted");
        assert_eq!(raw["current_index"], 1);
        assert_eq!(raw["fired"], true);
    }
}
