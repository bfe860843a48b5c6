//! Completion-marker polling.
//!
//! The framework signals the end of an attempt by writing
//! `<scratch>/<instance-id>/result`, which may happen before or after the
//! launched process exits. The poller runs on its own thread and reports
//! what it sees over a channel until its deadline passes or it is stopped.
use super::scratch::numeric_instances;
use crate::paths::FirmaePaths;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// The instance this run belongs to has been identified.
    Instance(String),
    /// The marker exists and has content.
    Marker { instance_id: String, content: String },
    /// Something the caller should surface, e.g. an ambiguous discovery.
    Warning(String),
}

/// Semantic result recorded in the marker file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerVerdict {
    Success,
    Failure,
}

impl MarkerVerdict {
    /// Interpret marker content. Unrecognised text counts as failure.
    pub fn parse(content: &str) -> Self {
        let value = content.trim().to_ascii_lowercase();
        const TRUTHY: [&str; 9] = ["1", "true", "yes", "y", "ok", "success", "on", "reachable", "up"];
        const FALSY: [&str; 9] = ["0", "false", "no", "n", "fail", "failed", "off", "unreachable", "down"];
        if TRUTHY.contains(&value.as_str()) {
            return MarkerVerdict::Success;
        }
        if FALSY.contains(&value.as_str()) {
            return MarkerVerdict::Failure;
        }
        match value.parse::<f64>() {
            Ok(number) if number != 0.0 && number.is_finite() => MarkerVerdict::Success,
            _ => MarkerVerdict::Failure,
        }
    }
}

pub struct PollConfig {
    pub firmae: FirmaePaths,
    /// Instance fixed by the caller; otherwise discovered.
    pub pinned: Option<String>,
    /// Instance ids that existed before launch.
    pub known: BTreeSet<u64>,
    pub interval: Duration,
    pub deadline: Instant,
}

pub struct MarkerPoller {
    pub events: Receiver<PollEvent>,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl MarkerPoller {
    pub fn spawn(config: PollConfig) -> Self {
        let (event_tx, events) = bounded(4);
        let (stop, stop_rx) = bounded(1);
        let handle = thread::spawn(move || poll_loop(config, event_tx, stop_rx));
        Self {
            events,
            stop,
            handle,
        }
    }

    /// Stop polling and wait for the thread; bounded by one interval.
    pub fn shutdown(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            tracing::warn!("marker poller thread panicked");
        }
    }
}

fn poll_loop(config: PollConfig, events: Sender<PollEvent>, stop: Receiver<()>) {
    let mut instance = config.pinned.clone();
    if let Some(id) = &instance {
        if events.send(PollEvent::Instance(id.clone())).is_err() {
            return;
        }
    }

    loop {
        if instance.is_none() {
            let fresh: Vec<u64> = numeric_instances(&config.firmae.scratch_dir())
                .into_iter()
                .filter(|id| !config.known.contains(id))
                .collect();
            instance = fresh.first().map(|id| id.to_string());
            if fresh.len() > 1 {
                let others: Vec<String> = fresh[1..].iter().map(u64::to_string).collect();
                let message = format!(
                    "several new scratch instances appeared ({} and {}); watching the lowest, \
                     pass --instance when emulations run concurrently",
                    fresh[0],
                    others.join(", ")
                );
                if events.send(PollEvent::Warning(message)).is_err() {
                    return;
                }
            }
            if let Some(id) = &instance {
                tracing::debug!(instance_id = %id, "instance discovered");
                if events.send(PollEvent::Instance(id.clone())).is_err() {
                    return;
                }
            }
        }

        if let Some(id) = &instance {
            let marker = config.firmae.marker_path(id);
            // An empty marker is still being written.
            if let Ok(content) = fs::read_to_string(&marker) {
                if !content.trim().is_empty() {
                    let _ = events.send(PollEvent::Marker {
                        instance_id: id.clone(),
                        content,
                    });
                    return;
                }
            }
        }

        let now = Instant::now();
        if now >= config.deadline {
            return;
        }
        let nap = config.interval.min(config.deadline - now);
        match stop.recv_timeout(nap) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return,
        }
    }
}
