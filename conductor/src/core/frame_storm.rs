//! Runaway-loop detection for the scheduler.
//!
//! Every finished frame is summarized as a `(plan hash, state hash)`
//! signature. A frame storm is a signature that keeps coming back without the
//! run converging, or a frame rate above the configured limits.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::plan::Node;

const SIGNATURE_HISTORY: usize = 20;
const HASH_HEX_LEN: usize = 12;
const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_frames_per_second: Option<u32>,
    pub max_frames_per_minute: Option<u32>,
    /// A signature already seen this many times in the recent history is a storm.
    pub repeat_limit: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frames_per_second: None,
            max_frames_per_minute: None,
            repeat_limit: 5,
        }
    }
}

/// Hashes of one finished frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSignature {
    pub plan: String,
    pub state: String,
}

impl FrameSignature {
    /// Hash node identity, type, props and status. Timings are left out.
    pub fn of(tree: &Node, state: &BTreeMap<String, Value>) -> Self {
        let mut plan = Sha256::new();
        tree.walk(&mut |node| {
            plan.update(node.id.as_bytes());
            plan.update([0]);
            plan.update(node.node_type.as_bytes());
            plan.update([0]);
            plan.update(node.exec.status.as_str().as_bytes());
            for (name, value) in &node.props {
                plan.update(name.as_bytes());
                plan.update(value.to_string().as_bytes());
            }
            plan.update([1]);
        });
        let mut vars = Sha256::new();
        for (name, value) in state {
            vars.update(name.as_bytes());
            vars.update([0]);
            vars.update(value.to_string().as_bytes());
            vars.update([1]);
        }
        Self {
            plan: short_hex(plan.finalize().as_slice()),
            state: short_hex(vars.finalize().as_slice()),
        }
    }
}

fn short_hex(digest: &[u8]) -> String {
    let mut out = hex::encode(digest);
    out.truncate(HASH_HEX_LEN);
    out
}

/// Which limit a frame broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStorm {
    Rate { frames: usize, limit: u32 },
    Burst { frames: usize, limit: u32 },
    Repeated { occurrences: usize },
}

impl fmt::Display for FrameStorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rate { frames, limit } => {
                write!(f, "frame rate exceeded ({frames}/s > {limit}/s)")
            }
            Self::Burst { frames, limit } => {
                write!(f, "frame burst limit exceeded ({frames}/min > {limit}/min)")
            }
            Self::Repeated { occurrences } => write!(
                f,
                "same plan and state repeated {occurrences} times without converging"
            ),
        }
    }
}

#[derive(Debug)]
pub struct FrameStormGuard {
    limits: FrameLimits,
    frames: u64,
    recent: VecDeque<FrameSignature>,
    timestamps: VecDeque<Instant>,
}

impl FrameStormGuard {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            limits,
            frames: 0,
            recent: VecDeque::with_capacity(SIGNATURE_HISTORY),
            timestamps: VecDeque::new(),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Record a finished frame; returns the broken limit, if any.
    pub fn check(&mut self, signature: FrameSignature, now: Instant) -> Option<FrameStorm> {
        self.frames += 1;
        self.timestamps.push_back(now);
        while self
            .timestamps
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= MINUTE)
        {
            self.timestamps.pop_front();
        }

        if let Some(limit) = self.limits.max_frames_per_second {
            let frames = self
                .timestamps
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < SECOND)
                .count();
            if frames > limit as usize {
                return Some(FrameStorm::Rate { frames, limit });
            }
        }
        if let Some(limit) = self.limits.max_frames_per_minute {
            let frames = self.timestamps.len();
            if frames > limit as usize {
                return Some(FrameStorm::Burst { frames, limit });
            }
        }

        let seen = self.recent.iter().filter(|s| **s == signature).count();
        if self.recent.len() == SIGNATURE_HISTORY {
            self.recent.pop_front();
        }
        self.recent.push_back(signature);
        if seen >= self.limits.repeat_limit {
            return Some(FrameStorm::Repeated {
                occurrences: seen + 1,
            });
        }
        None
    }
}
