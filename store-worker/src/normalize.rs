//! Event normalization.
//!
//! The process stage re-runs the normalizer when an enrichment step changed
//! the payload. In renormalize mode only hard bounds are enforced, so running
//! it again on its own output changes nothing.
use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use crate::payload::Payload;
use crate::stacktraces::stacktraces_mut;
use crate::storage::ProcessingIssue;

/// How far in the future a timestamp may be before it is treated as clock drift.
const MAX_FUTURE_SECONDS: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Maximum frames kept per stack trace. Zero disables trimming.
    pub max_frames: usize,
    /// Events older than this are re-dated to the reference time.
    pub retention: Duration,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_frames: 250,
            retention: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub payload: Payload,
    pub issues: Vec<ProcessingIssue>,
}

pub struct Normalizer {
    config: NormalizerConfig,
    /// Reference time in epoch seconds, fixed for the normalizer's lifetime.
    now: f64,
    is_renormalize: bool,
}

impl Normalizer {
    /// A normalizer for events that already went through normalization once.
    pub fn renormalize(config: NormalizerConfig, now: f64) -> Self {
        Self {
            config,
            now,
            is_renormalize: true,
        }
    }

    /// A normalizer for freshly ingested events, which also fills defaults.
    pub fn first_time(config: NormalizerConfig, now: f64) -> Self {
        Self {
            config,
            now,
            is_renormalize: false,
        }
    }

    pub fn normalize(&self, mut payload: Payload) -> Normalized {
        if !self.is_renormalize {
            self.apply_defaults(&mut payload);
        }
        self.clamp_timestamp(&mut payload);
        self.trim_frames(&mut payload);

        let issues = processing_issues(&payload);
        Normalized { payload, issues }
    }

    fn apply_defaults(&self, payload: &mut Payload) {
        if !payload.get("platform").is_some_and(Value::is_string) {
            payload.insert("platform", json!("other"));
        }
        if payload.timestamp().is_none() {
            payload.insert("timestamp", json!(self.now));
        }
        if !payload.contains_key("level") {
            payload.insert("level", json!("error"));
        }
    }

    fn clamp_timestamp(&self, payload: &mut Payload) {
        let Some(timestamp) = payload.timestamp() else {
            return;
        };

        let error_type = if timestamp < self.now - self.config.retention.as_secs_f64() {
            "past_timestamp"
        } else if timestamp > self.now + MAX_FUTURE_SECONDS {
            "future_timestamp"
        } else {
            return;
        };

        payload.insert("timestamp", json!(self.now));
        push_error(
            payload,
            json!({"type": error_type, "name": "timestamp", "value": timestamp}),
        );
    }

    fn trim_frames(&self, payload: &mut Payload) {
        let max_frames = self.config.max_frames;
        if max_frames == 0 {
            return;
        }

        for stacktrace in stacktraces_mut(payload) {
            let Some(Value::Array(frames)) = stacktrace.get_mut("frames") else {
                continue;
            };
            let total = frames.len();
            if total <= max_frames {
                continue;
            }

            let head = max_frames / 2;
            let tail = max_frames - head;
            let omitted_end = total - tail;
            drop(frames.drain(head..omitted_end));

            if let Value::Object(fields) = stacktrace {
                fields.insert("frames_omitted".to_owned(), json!([head, omitted_end]));
            }
        }
    }
}

fn push_error(payload: &mut Payload, error: Value) {
    match payload.get_mut("errors") {
        Some(Value::Array(errors)) => errors.push(error),
        Some(_) => warn!("payload errors is not a list, dropping normalization error"),
        None => {
            payload.insert("errors", json!([error]));
        }
    }
}

/// Processing issues reported by enrichment steps, as a map keyed by issue
/// or as a list.
fn processing_issues(payload: &Payload) -> Vec<ProcessingIssue> {
    let entries: Vec<&Value> = match payload.get("processing_issues") {
        Some(Value::Object(issues)) => issues.values().collect(),
        Some(Value::Array(issues)) => issues.iter().collect(),
        _ => return Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(
            |entry| match serde_json::from_value::<ProcessingIssue>(entry.clone()) {
                Ok(issue) => Some(issue),
                Err(err) => {
                    warn!("dropping malformed processing issue: {err}");
                    None
                }
            },
        )
        .collect()
}
