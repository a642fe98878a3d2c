use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::{ContainerAction, ContainerEvent, HealthRecord, HealthStatus};

/// Where a health observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// The runtime event feed. Its timestamps win over polled ones.
    EventFeed,
    Poller,
}

/// Identity of one observation, used to make replays idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ObservationKey {
    source: SignalSource,
    action: ContainerAction,
    status: Option<HealthStatus>,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HealthSources {
    starting: Option<SignalSource>,
    healthy: Option<SignalSource>,
    unhealthy: Option<SignalSource>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HealthCounts {
    observations: u32,
    failures: u32,
}

/// Timing record of one container within one iteration.
///
/// All durations are seconds and only set once both endpoints were seen.
/// A negative duration means events arrived out of order: it is left unset
/// and reported in `data_quality_errors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub container_name: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub image: String,

    pub create_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub health_starting_time: Option<DateTime<Utc>>,
    pub health_healthy_time: Option<DateTime<Utc>>,
    pub health_unhealthy_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub kill_time: Option<DateTime<Utc>>,
    pub die_time: Option<DateTime<Utc>>,
    pub destroy_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,

    /// healthy - start
    pub startup_duration: Option<f64>,
    /// healthy - health check starting
    pub health_check_duration: Option<f64>,
    /// healthy - create, or start - create without any health check
    pub total_startup_time: Option<f64>,
    /// destroy - stop
    pub shutdown_duration: Option<f64>,

    pub health_check_failures: u32,
    pub health_observations: u32,
    pub restart_count: u32,
    #[serde(default)]
    pub data_quality_errors: Vec<String>,

    /// How often each observation was applied so far.
    #[serde(skip)]
    seen: HashMap<ObservationKey, u32>,
    /// How often each observation occurred in the replay in progress.
    #[serde(skip)]
    replayed: HashMap<ObservationKey, u32>,
    #[serde(skip)]
    health_sources: HealthSources,
    #[serde(skip)]
    event_health: HealthCounts,
    #[serde(skip)]
    poll_health: HealthCounts,
}

fn set_earliest(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) {
    if slot.is_none_or(|current| at < current) {
        *slot = Some(at);
    }
}

/// Event feed beats poller; within one source the earliest timestamp wins.
fn merge_health_time(
    slot: &mut Option<DateTime<Utc>>,
    slot_source: &mut Option<SignalSource>,
    at: DateTime<Utc>,
    source: SignalSource,
) {
    let replace = match (*slot, *slot_source) {
        (None, _) => true,
        (Some(_), Some(SignalSource::Poller)) if source == SignalSource::EventFeed => true,
        (Some(current), Some(current_source)) if current_source == source => at < current,
        _ => false,
    };
    if replace {
        *slot = Some(at);
        *slot_source = Some(source);
    }
}

pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_nanoseconds() {
        Some(nanos) => nanos as f64 / 1e9,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

impl ContainerMetrics {
    pub fn new(container_name: &str) -> Self {
        Self {
            container_name: container_name.to_string(),
            ..Default::default()
        }
    }

    /// Starts a replay of the complete history. Within a replay the n-th
    /// occurrence of an observation is only applied if fewer than n were
    /// applied before, so identical events in one history all count while
    /// replaying it again counts nothing.
    pub fn begin_replay(&mut self) {
        self.replayed.clear();
    }

    fn is_new(&mut self, key: ObservationKey) -> bool {
        let occurrence = self.replayed.entry(key).or_default();
        *occurrence += 1;
        let applied = self.seen.entry(key).or_default();
        if *occurrence <= *applied {
            return false;
        }
        *applied = *occurrence;
        true
    }

    /// Folds one event feed observation in. Returns false if this
    /// occurrence was already applied by an earlier replay.
    pub fn apply_event(&mut self, event: &ContainerEvent) -> bool {
        let key = ObservationKey {
            source: SignalSource::EventFeed,
            action: event.action,
            status: event.health_status,
            at: event.timestamp,
        };
        if !self.is_new(key) {
            return false;
        }

        if self.image.is_empty() && !event.image.is_empty() {
            self.image = event.image.clone();
        }
        if self.container_id.is_empty() && !event.container_id.is_empty() {
            self.container_id = event.container_id.clone();
        }

        let at = event.timestamp;
        match event.action {
            ContainerAction::Create => set_earliest(&mut self.create_time, at),
            ContainerAction::Start => set_earliest(&mut self.start_time, at),
            ContainerAction::Restart => self.restart_count += 1,
            ContainerAction::Stop => set_earliest(&mut self.stop_time, at),
            ContainerAction::Kill => set_earliest(&mut self.kill_time, at),
            ContainerAction::Die => {
                set_earliest(&mut self.die_time, at);
                if event.exit_code.is_some() {
                    self.exit_code = event.exit_code;
                }
            }
            ContainerAction::Destroy => set_earliest(&mut self.destroy_time, at),
            ContainerAction::HealthStatus => {
                if let Some(status) = event.health_status {
                    self.apply_health(status, at, SignalSource::EventFeed);
                }
            }
        }
        self.compute_derived();
        true
    }

    /// Folds one polled health transition in. Returns false if this
    /// occurrence was already applied by an earlier replay.
    pub fn apply_health_record(&mut self, record: &HealthRecord) -> bool {
        let key = ObservationKey {
            source: SignalSource::Poller,
            action: ContainerAction::HealthStatus,
            status: Some(record.status),
            at: record.timestamp,
        };
        if !self.is_new(key) {
            return false;
        }
        self.apply_health(record.status, record.timestamp, SignalSource::Poller);
        self.compute_derived();
        true
    }

    fn apply_health(&mut self, status: HealthStatus, at: DateTime<Utc>, source: SignalSource) {
        let counts = match source {
            SignalSource::EventFeed => &mut self.event_health,
            SignalSource::Poller => &mut self.poll_health,
        };
        if status != HealthStatus::None {
            counts.observations += 1;
        }
        if status == HealthStatus::Unhealthy {
            counts.failures += 1;
        }

        let sources = &mut self.health_sources;
        match status {
            HealthStatus::Starting => {
                merge_health_time(&mut self.health_starting_time, &mut sources.starting, at, source)
            }
            HealthStatus::Healthy => {
                merge_health_time(&mut self.health_healthy_time, &mut sources.healthy, at, source)
            }
            HealthStatus::Unhealthy => merge_health_time(
                &mut self.health_unhealthy_time,
                &mut sources.unhealthy,
                at,
                source,
            ),
            HealthStatus::None => {}
        }

        // Both signals usually see the same transitions, counting them twice
        // would inflate the failure rate.
        self.health_check_failures = self.event_health.failures.max(self.poll_health.failures);
        self.health_observations = self
            .event_health
            .observations
            .max(self.poll_health.observations);
    }

    fn has_health_check(&self) -> bool {
        self.health_starting_time.is_some()
            || self.health_healthy_time.is_some()
            || self.health_unhealthy_time.is_some()
    }

    fn span(
        &self,
        label: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        errors: &mut Vec<String>,
    ) -> Option<f64> {
        let (from, to) = (from?, to?);
        let secs = seconds_between(from, to);
        if secs < 0.0 {
            errors.push(format!(
                "{label} of {} is negative ({secs:.3}s), events are out of order",
                self.container_name
            ));
            return None;
        }
        Some(secs)
    }

    pub fn compute_derived(&mut self) {
        let mut errors = Vec::new();

        self.startup_duration = self.span(
            "startup_duration",
            self.start_time,
            self.health_healthy_time,
            &mut errors,
        );
        self.health_check_duration = self.span(
            "health_check_duration",
            self.health_starting_time,
            self.health_healthy_time,
            &mut errors,
        );
        self.total_startup_time = if self.health_healthy_time.is_some() {
            self.span(
                "total_startup_time",
                self.create_time,
                self.health_healthy_time,
                &mut errors,
            )
        } else if !self.has_health_check() {
            self.span(
                "total_startup_time",
                self.create_time,
                self.start_time,
                &mut errors,
            )
        } else {
            None
        };
        self.shutdown_duration = self.span(
            "shutdown_duration",
            self.stop_time,
            self.destroy_time,
            &mut errors,
        );

        for error in errors.iter().filter(|e| !self.data_quality_errors.contains(e)) {
            log::warn!("Data quality: {error}");
        }
        self.data_quality_errors = errors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use quickcheck_macros::quickcheck;

    fn at(secs: f64) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(1_700_000_000_000_000_000 + (secs * 1e9) as i64)
    }

    fn event(action: ContainerAction, ts: DateTime<Utc>) -> ContainerEvent {
        ContainerEvent {
            action,
            container_name: "db".to_string(),
            container_id: "id-db".to_string(),
            image: "postgres:16".to_string(),
            timestamp: ts,
            health_status: None,
            exit_code: None,
        }
    }

    fn health(status: HealthStatus, ts: DateTime<Utc>) -> ContainerEvent {
        ContainerEvent {
            health_status: Some(status),
            ..event(ContainerAction::HealthStatus, ts)
        }
    }

    fn record(status: HealthStatus, ts: DateTime<Utc>) -> HealthRecord {
        HealthRecord {
            container_name: "db".to_string(),
            status,
            timestamp: ts,
        }
    }

    #[test]
    fn test_well_ordered_lifecycle() {
        let mut metrics = ContainerMetrics::new("db");
        for e in [
            event(ContainerAction::Create, at(0.0)),
            event(ContainerAction::Start, at(0.5)),
            health(HealthStatus::Starting, at(1.0)),
            health(HealthStatus::Healthy, at(4.0)),
            event(ContainerAction::Kill, at(10.0)),
            event(ContainerAction::Die, at(10.2)),
            event(ContainerAction::Stop, at(10.5)),
            event(ContainerAction::Destroy, at(11.0)),
        ] {
            assert!(metrics.apply_event(&e));
        }

        assert_eq!(metrics.startup_duration, Some(3.5));
        assert_eq!(metrics.health_check_duration, Some(3.0));
        assert_eq!(metrics.total_startup_time, Some(4.0));
        assert_eq!(metrics.shutdown_duration, Some(0.5));
        assert_eq!(metrics.image, "postgres:16");
        assert_eq!(metrics.health_observations, 2);
        assert!(metrics.data_quality_errors.is_empty());
    }

    #[test]
    fn test_no_health_check_falls_back_to_start() {
        let mut metrics = ContainerMetrics::new("db");
        metrics.apply_event(&event(ContainerAction::Create, at(0.0)));
        metrics.apply_event(&event(ContainerAction::Start, at(1.25)));

        assert_eq!(metrics.startup_duration, None);
        assert_eq!(metrics.health_check_duration, None);
        assert_eq!(metrics.total_startup_time, Some(1.25));
    }

    #[test]
    fn test_missing_create_leaves_total_undefined() {
        let mut metrics = ContainerMetrics::new("db");
        metrics.apply_event(&event(ContainerAction::Start, at(1.0)));
        metrics.apply_event(&health(HealthStatus::Healthy, at(2.0)));
        assert_eq!(metrics.startup_duration, Some(1.0));
        assert_eq!(metrics.total_startup_time, None);
    }

    #[test]
    fn test_health_in_progress_has_no_total() {
        let mut metrics = ContainerMetrics::new("db");
        metrics.apply_event(&event(ContainerAction::Create, at(0.0)));
        metrics.apply_event(&event(ContainerAction::Start, at(1.0)));
        metrics.apply_event(&health(HealthStatus::Starting, at(1.5)));
        assert_eq!(metrics.total_startup_time, None);
    }

    #[test]
    fn test_negative_duration_is_a_data_quality_error() {
        let mut metrics = ContainerMetrics::new("db");
        metrics.apply_event(&event(ContainerAction::Start, at(5.0)));
        metrics.apply_event(&health(HealthStatus::Healthy, at(2.0)));

        assert_eq!(metrics.startup_duration, None);
        assert_eq!(metrics.data_quality_errors.len(), 1);
        assert!(metrics.data_quality_errors[0].contains("startup_duration"));
    }

    #[test]
    fn test_event_feed_wins_over_poller() {
        let mut metrics = ContainerMetrics::new("db");
        metrics.apply_event(&event(ContainerAction::Start, at(0.0)));
        metrics.apply_health_record(&record(HealthStatus::Healthy, at(3.0)));
        assert_eq!(metrics.startup_duration, Some(3.0));

        metrics.apply_event(&health(HealthStatus::Healthy, at(2.5)));
        assert_eq!(metrics.startup_duration, Some(2.5));

        // a later poll never overrides the event feed
        metrics.apply_health_record(&record(HealthStatus::Healthy, at(1.0)));
        assert_eq!(metrics.health_healthy_time, Some(at(2.5)));
    }

    #[test]
    fn test_failures_not_double_counted_across_sources() {
        let mut metrics = ContainerMetrics::new("db");
        metrics.apply_event(&health(HealthStatus::Unhealthy, at(1.0)));
        metrics.apply_health_record(&record(HealthStatus::Unhealthy, at(1.1)));
        assert_eq!(metrics.health_check_failures, 1);

        metrics.apply_event(&health(HealthStatus::Healthy, at(2.0)));
        metrics.apply_event(&health(HealthStatus::Unhealthy, at(3.0)));
        assert_eq!(metrics.health_check_failures, 2);
        assert_eq!(metrics.health_observations, 3);
    }

    #[test]
    fn test_restart_and_exit_code() {
        let mut metrics = ContainerMetrics::new("db");
        metrics.apply_event(&event(ContainerAction::Restart, at(1.0)));
        metrics.apply_event(&event(ContainerAction::Restart, at(2.0)));
        metrics.apply_event(&ContainerEvent {
            exit_code: Some(1),
            ..event(ContainerAction::Die, at(3.0))
        });
        assert_eq!(metrics.restart_count, 2);
        assert_eq!(metrics.exit_code, Some(1));
    }

    #[test]
    fn test_replay_is_ignored() {
        let mut metrics = ContainerMetrics::new("db");
        let restart = event(ContainerAction::Restart, at(1.0));
        metrics.begin_replay();
        assert!(metrics.apply_event(&restart));
        metrics.begin_replay();
        assert!(!metrics.apply_event(&restart));
        assert_eq!(metrics.restart_count, 1);

        let unhealthy = record(HealthStatus::Unhealthy, at(2.0));
        metrics.begin_replay();
        assert!(metrics.apply_health_record(&unhealthy));
        metrics.begin_replay();
        assert!(!metrics.apply_health_record(&unhealthy));
        assert_eq!(metrics.health_check_failures, 1);
    }

    #[test]
    fn test_same_second_restarts_all_count() {
        let line = r#"{"status":"restart","id":"abc","from":"postgres:16","time":1700000000}"#;
        let restart = crate::monitor::events::decode_event(line).unwrap().unwrap();
        let history = vec![restart.clone(), restart];

        let mut metrics = ContainerMetrics::new("db");
        for _ in 0..2 {
            metrics.begin_replay();
            for e in &history {
                metrics.apply_event(e);
            }
            assert_eq!(metrics.restart_count, 2);
        }

        // a longer history only adds the new occurrence
        let mut longer = history.clone();
        longer.push(history[0].clone());
        metrics.begin_replay();
        let applied = longer.iter().filter(|e| metrics.apply_event(e)).count();
        assert_eq!(applied, 1);
        assert_eq!(metrics.restart_count, 3);
    }

    #[quickcheck]
    fn prop_startup_duration_exact_and_non_negative(gaps: (u32, u32, u32)) -> bool {
        let create = at(0.0);
        let start = create + TimeDelta::microseconds(gaps.0 as i64);
        let starting = start + TimeDelta::microseconds(gaps.1 as i64);
        let healthy = starting + TimeDelta::microseconds(gaps.2 as i64);

        let mut metrics = ContainerMetrics::new("db");
        metrics.apply_event(&event(ContainerAction::Create, create));
        metrics.apply_event(&event(ContainerAction::Start, start));
        metrics.apply_event(&health(HealthStatus::Starting, starting));
        metrics.apply_event(&health(HealthStatus::Healthy, healthy));

        metrics.startup_duration == Some(seconds_between(start, healthy))
            && metrics.startup_duration.is_some_and(|d| d >= 0.0)
            && metrics.data_quality_errors.is_empty()
    }

    #[quickcheck]
    fn prop_replaying_events_is_idempotent(actions: Vec<(u8, u16)>) -> bool {
        let events: Vec<ContainerEvent> = actions
            .iter()
            .map(|(kind, offset)| {
                let ts = at(0.0) + TimeDelta::milliseconds(*offset as i64);
                match kind % 6 {
                    0 => event(ContainerAction::Create, ts),
                    1 => event(ContainerAction::Start, ts),
                    2 => event(ContainerAction::Restart, ts),
                    3 => health(HealthStatus::Healthy, ts),
                    4 => health(HealthStatus::Unhealthy, ts),
                    _ => event(ContainerAction::Destroy, ts),
                }
            })
            .collect();

        let mut once = ContainerMetrics::new("db");
        once.begin_replay();
        events.iter().for_each(|e| {
            once.apply_event(e);
        });
        let mut twice = once.clone();
        twice.begin_replay();
        events.iter().for_each(|e| {
            twice.apply_event(e);
        });
        once == twice
    }
}
