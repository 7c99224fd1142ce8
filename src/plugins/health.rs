use crate::core::error;
use crate::plugins::compose::{HealthProbe, ServiceStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProbeState {
    Starting,
    Healthy,
    Unhealthy,
    /// Service declares no probe (or the runtime reports none).
    Unprobed,
}

impl ProbeState {
    /// Maps the runtime's health column (`healthy`, `unhealthy`, `starting`,
    /// empty) and container state onto a probe state.
    pub fn from_docker_status(health: &str, state: &str) -> Self {
        match health.trim().to_ascii_lowercase().as_str() {
            "healthy" => ProbeState::Healthy,
            "unhealthy" => ProbeState::Unhealthy,
            "starting" => ProbeState::Starting,
            _ => {
                if state == "exited" || state == "dead" {
                    ProbeState::Unhealthy
                } else {
                    ProbeState::Unprobed
                }
            }
        }
    }
}

impl std::fmt::Display for ProbeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProbeState::Starting => "starting",
            ProbeState::Healthy => "healthy",
            ProbeState::Unhealthy => "unhealthy",
            ProbeState::Unprobed => "unprobed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProbeObservation {
    /// Offset from container start.
    pub at: Duration,
    pub passed: bool,
}

/// Replays probe results the way the container runtime evaluates them.
///
/// Failures inside the start period do not count toward `retries` until the
/// first success; any success makes the service healthy and resets the
/// failing streak; `retries` consecutive counted failures make it unhealthy.
/// A service that is still starting past its deadline is unhealthy.
pub fn compute_probe_state(
    probe: &HealthProbe,
    observations: &[ProbeObservation],
    elapsed: Duration,
) -> Result<(ProbeState, String), error::BoardstackError> {
    let start_period = probe.start_period()?;
    let deadline = probe.deadline()?;

    let mut sorted = observations.to_vec();
    sorted.sort_by_key(|o| o.at);

    let mut state = ProbeState::Starting;
    let mut started = false;
    let mut streak = 0u32;
    let mut reason = "No probe results recorded".to_string();

    for obs in &sorted {
        if obs.passed {
            started = true;
            streak = 0;
            state = ProbeState::Healthy;
            reason = format!("Probe passed at {}s", obs.at.as_secs());
            continue;
        }
        if !started && obs.at < start_period {
            continue;
        }
        streak += 1;
        if streak >= probe.retries {
            state = ProbeState::Unhealthy;
            reason = format!(
                "{} consecutive probe failures (last at {}s)",
                streak,
                obs.at.as_secs()
            );
        }
    }

    if state == ProbeState::Starting && elapsed > deadline {
        return Ok((
            ProbeState::Unhealthy,
            format!(
                "No healthy result within {}s (start_period + retries x interval)",
                deadline.as_secs()
            ),
        ));
    }

    Ok((state, reason))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn offset(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

/// Reads probe history out of one `inspect` record: every `State.Health.Log`
/// entry as an observation relative to `State.StartedAt`, plus the time the
/// container has been up at `now`. Log entries with unreadable timestamps are
/// skipped; the runtime only keeps the most recent few.
pub fn observations_from_inspect(
    container: &JsonValue,
    now: DateTime<Utc>,
) -> Result<(Vec<ProbeObservation>, Duration), error::BoardstackError> {
    let state = &container["State"];
    let started_raw = state["StartedAt"].as_str().unwrap_or("");
    let started = parse_timestamp(started_raw).ok_or_else(|| {
        error::BoardstackError::ValidationError(format!(
            "container start time '{}' is not RFC 3339",
            started_raw
        ))
    })?;

    let mut observations = Vec::new();
    if let Some(log) = state["Health"]["Log"].as_array() {
        for entry in log {
            let Some(at) = entry["Start"].as_str().and_then(parse_timestamp) else {
                continue;
            };
            observations.push(ProbeObservation {
                at: offset(started, at),
                passed: entry["ExitCode"].as_i64() == Some(0),
            });
        }
    }
    Ok((observations, offset(started, now)))
}

/// Re-judges a service the runtime still calls `starting` against its own
/// probe settings, so one stuck past its deadline reads as unhealthy.
/// Services in any other state are left as reported.
pub fn judge_starting(
    status: &mut ServiceStatus,
    probe: &HealthProbe,
    container: &JsonValue,
    now: DateTime<Utc>,
) -> Result<(), error::BoardstackError> {
    if status.health != ProbeState::Starting {
        return Ok(());
    }
    let (observations, elapsed) = observations_from_inspect(container, now)?;
    let (state, reason) = compute_probe_state(probe, &observations, elapsed)?;
    status.health = state;
    status.reason = Some(reason);
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub healthy: usize,
    pub starting: usize,
    pub unhealthy: usize,
    pub unprobed: usize,
}

pub fn summarize(services: &[ServiceStatus]) -> HealthSummary {
    let mut summary = HealthSummary::default();
    for svc in services {
        match svc.health {
            ProbeState::Healthy => summary.healthy += 1,
            ProbeState::Starting => summary.starting += 1,
            ProbeState::Unhealthy => summary.unhealthy += 1,
            ProbeState::Unprobed => summary.unprobed += 1,
        }
    }
    summary
}
