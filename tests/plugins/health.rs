use boardstack::plugins::compose::{HealthProbe, ServiceStatus};
use boardstack::plugins::health::{
    HealthSummary, ProbeObservation, ProbeState, compute_probe_state, judge_starting,
    observations_from_inspect, summarize,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::time::Duration;

fn probe() -> HealthProbe {
    HealthProbe {
        test: vec!["CMD".into(), "true".into()],
        interval: "10s".into(),
        timeout: "5s".into(),
        retries: 3,
        start_period: "30s".into(),
    }
}

fn obs(secs: u64, passed: bool) -> ProbeObservation {
    ProbeObservation {
        at: Duration::from_secs(secs),
        passed,
    }
}

#[test]
fn test_probe_state_display() {
    assert_eq!(ProbeState::Starting.to_string(), "starting");
    assert_eq!(ProbeState::Healthy.to_string(), "healthy");
    assert_eq!(ProbeState::Unhealthy.to_string(), "unhealthy");
    assert_eq!(ProbeState::Unprobed.to_string(), "unprobed");
}

#[test]
fn test_no_observations_is_starting_until_deadline() {
    let (state, msg) = compute_probe_state(&probe(), &[], Duration::from_secs(5)).unwrap();
    assert_eq!(state, ProbeState::Starting);
    assert!(msg.contains("No probe results"));

    // deadline = 30s + 3 x 10s
    let (state, msg) = compute_probe_state(&probe(), &[], Duration::from_secs(61)).unwrap();
    assert_eq!(state, ProbeState::Unhealthy);
    assert!(msg.contains("60s"));
}

#[test]
fn test_failures_inside_start_period_do_not_count() {
    let observations = [obs(10, false), obs(20, false), obs(25, false), obs(40, false)];
    let (state, _) = compute_probe_state(&probe(), &observations, Duration::from_secs(41)).unwrap();
    assert_eq!(state, ProbeState::Starting);
}

#[test]
fn test_any_success_is_healthy_and_resets_streak() {
    let observations = [obs(10, false), obs(20, true), obs(30, false), obs(40, false)];
    let (state, msg) =
        compute_probe_state(&probe(), &observations, Duration::from_secs(45)).unwrap();
    assert_eq!(state, ProbeState::Healthy);
    assert!(msg.contains("20s"));
}

#[test]
fn test_retries_consecutive_failures_make_unhealthy() {
    let observations = [obs(20, true), obs(30, false), obs(40, false), obs(50, false)];
    let (state, msg) =
        compute_probe_state(&probe(), &observations, Duration::from_secs(55)).unwrap();
    assert_eq!(state, ProbeState::Unhealthy);
    assert!(msg.contains("3 consecutive"));
}

#[test]
fn test_recovery_after_unhealthy() {
    let observations = [obs(31, false), obs(41, false), obs(51, false), obs(61, true)];
    let (state, _) = compute_probe_state(&probe(), &observations, Duration::from_secs(62)).unwrap();
    assert_eq!(state, ProbeState::Healthy);
}

#[test]
fn test_runtime_status_mapping() {
    assert_eq!(ProbeState::from_docker_status("healthy", "running"), ProbeState::Healthy);
    assert_eq!(ProbeState::from_docker_status(" Starting ", "running"), ProbeState::Starting);
    assert_eq!(ProbeState::from_docker_status("", "running"), ProbeState::Unprobed);
    assert_eq!(ProbeState::from_docker_status("", "exited"), ProbeState::Unhealthy);
}

#[test]
fn test_summarize_counts_each_state() {
    let status = |service: &str, health| ServiceStatus {
        service: service.to_string(),
        container: String::new(),
        state: "running".to_string(),
        health,
        reason: None,
    };
    let summary = summarize(&[
        status("postgres", ProbeState::Healthy),
        status("redis", ProbeState::Healthy),
        status("qdrant", ProbeState::Starting),
        status("nginx", ProbeState::Unprobed),
    ]);
    assert_eq!(
        summary,
        HealthSummary {
            healthy: 2,
            starting: 1,
            unhealthy: 0,
            unprobed: 1,
        }
    );
}

#[test]
fn test_invalid_durations_surface_as_errors() {
    let mut bad = probe();
    bad.interval = "ten seconds".into();
    assert!(compute_probe_state(&bad, &[], Duration::ZERO).is_err());
}

fn at(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
}

fn inspect_record(log: &[(&str, i64)]) -> serde_json::Value {
    let entries: Vec<_> = log
        .iter()
        .map(|(start, code)| json!({ "Start": start, "ExitCode": code, "Output": "" }))
        .collect();
    json!({
        "Id": "abc123",
        "State": {
            "Status": "running",
            "StartedAt": "2026-01-01T00:00:00.000000000Z",
            "Health": { "Status": "starting", "FailingStreak": 0, "Log": entries }
        }
    })
}

fn starting(service: &str) -> ServiceStatus {
    ServiceStatus {
        service: service.to_string(),
        container: "abc123".to_string(),
        state: "running".to_string(),
        health: ProbeState::Starting,
        reason: None,
    }
}

#[test]
fn test_inspect_log_becomes_observations() {
    let record = inspect_record(&[
        ("2026-01-01T00:00:10.5Z", 1),
        ("2026-01-01T00:00:20.000000001Z", 0),
        ("not a time", 0),
    ]);
    let (observations, elapsed) =
        observations_from_inspect(&record, at("2026-01-01T00:01:00Z")).unwrap();
    assert_eq!(elapsed, Duration::from_secs(60));
    assert_eq!(observations.len(), 2);
    assert_eq!(observations[0].at, Duration::from_millis(10_500));
    assert!(!observations[0].passed);
    assert!(observations[1].passed);

    let broken = json!({ "State": { "StartedAt": "yesterday" } });
    assert!(observations_from_inspect(&broken, Utc::now()).is_err());
}

#[test]
fn test_starting_service_past_deadline_is_unhealthy() {
    // deadline = 30s + 3 x 10s; no result logged in 90s of uptime.
    let mut svc = starting("postgres");
    let now = at("2026-01-01T00:01:30Z");
    judge_starting(&mut svc, &probe(), &inspect_record(&[]), now).unwrap();
    assert_eq!(svc.health, ProbeState::Unhealthy);
    assert!(svc.reason.as_deref().unwrap_or("").contains("60s"));

    // Still inside the deadline, failures within the start period ignored.
    let mut svc = starting("postgres");
    let record = inspect_record(&[("2026-01-01T00:00:10Z", 1), ("2026-01-01T00:00:20Z", 1)]);
    judge_starting(&mut svc, &probe(), &record, at("2026-01-01T00:00:25Z")).unwrap();
    assert_eq!(svc.health, ProbeState::Starting);
}

#[test]
fn test_only_starting_services_are_rejudged() {
    let mut svc = starting("redis");
    svc.health = ProbeState::Healthy;
    judge_starting(&mut svc, &probe(), &json!({}), Utc::now()).unwrap();
    assert_eq!(svc.health, ProbeState::Healthy);
    assert!(svc.reason.is_none());
}
