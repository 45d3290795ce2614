use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerMode {
    Stopped,
    Running,
    Sleeping,
    Paused,
    Error,
}

impl RunnerMode {
    /// Modes in which the scheduling loop is alive
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunnerMode::Running | RunnerMode::Sleeping | RunnerMode::Paused
        )
    }
}

impl fmt::Display for RunnerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunnerMode::Stopped => "STOPPED",
            RunnerMode::Running => "RUNNING",
            RunnerMode::Sleeping => "SLEEPING",
            RunnerMode::Paused => "PAUSED",
            RunnerMode::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

/// Singleton runner telemetry and continuity record.
///
/// Mutated only by the scheduling loop and by explicit start/stop calls.
/// `sleep_since` is set if and only if `mode == Sleeping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerState {
    pub mode: RunnerMode,
    pub tick_interval_seconds: f64,
    pub poll_success_count: u64,
    pub poll_error_count: u64,
    pub last_poll_error: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_successful_poll_at: Option<DateTime<Utc>>,
    pub sleep_since: Option<DateTime<Utc>>,
    pub next_market_open_at: Option<DateTime<Utc>>,
    pub last_resume_at: Option<DateTime<Utc>>,
    pub resume_count: u64,
    pub last_state_persisted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub orders_submitted: u64,
    #[serde(default)]
    pub signals_skipped: u64,
    #[serde(default)]
    pub last_skip_reason: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl RunnerState {
    pub fn new(tick_interval_seconds: f64) -> Self {
        Self {
            mode: RunnerMode::Stopped,
            tick_interval_seconds,
            poll_success_count: 0,
            poll_error_count: 0,
            last_poll_error: None,
            last_poll_at: None,
            last_successful_poll_at: None,
            sleep_since: None,
            next_market_open_at: None,
            last_resume_at: None,
            resume_count: 0,
            last_state_persisted_at: None,
            orders_submitted: 0,
            signals_skipped: 0,
            last_skip_reason: None,
            last_error: None,
        }
    }

    /// RUNNING -> SLEEPING. Returns false (and changes nothing) from any other mode.
    pub fn enter_sleep(
        &mut self,
        now: DateTime<Utc>,
        next_market_open_at: Option<DateTime<Utc>>,
    ) -> bool {
        if self.mode != RunnerMode::Running {
            return false;
        }
        self.mode = RunnerMode::Sleeping;
        self.sleep_since = Some(now);
        self.next_market_open_at = next_market_open_at;
        true
    }

    /// SLEEPING -> RUNNING. Clears the sleep marker and counts the resume.
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if self.mode != RunnerMode::Sleeping {
            return false;
        }
        self.mode = RunnerMode::Running;
        self.sleep_since = None;
        self.next_market_open_at = None;
        self.last_resume_at = Some(now);
        self.resume_count += 1;
        true
    }

    pub fn record_poll_success(&mut self, now: DateTime<Utc>) {
        self.poll_success_count += 1;
        self.last_poll_at = Some(now);
        self.last_successful_poll_at = Some(now);
    }

    pub fn record_poll_error(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.poll_error_count += 1;
        self.last_poll_at = Some(now);
        self.last_poll_error = Some(error.into());
    }

    pub fn record_skip(&mut self, reason: impl Into<String>) {
        self.signals_skipped += 1;
        self.last_skip_reason = Some(reason.into());
    }

    /// Leave whatever mode we are in for STOPPED
    pub fn mark_stopped(&mut self) {
        self.mode = RunnerMode::Stopped;
        self.sleep_since = None;
    }

    pub fn mark_error(&mut self, reason: impl Into<String>) {
        self.mode = RunnerMode::Error;
        self.sleep_since = None;
        self.last_error = Some(reason.into());
    }

    /// Carry sleep/resume continuity over from a persisted record.
    ///
    /// A persisted SLEEPING record is restored as SLEEPING with its original
    /// `sleep_since`, so the first tick after a restart does not repeat the
    /// sleep transition. A persisted ERROR stays ERROR with its reason until
    /// an explicit reset. Any other persisted mode starts as RUNNING.
    pub fn restore_from(&mut self, persisted: &RunnerState) {
        self.resume_count = persisted.resume_count;
        self.last_resume_at = persisted.last_resume_at;
        if persisted.mode == RunnerMode::Error {
            self.mode = RunnerMode::Error;
            self.sleep_since = None;
            self.next_market_open_at = None;
            self.last_error = persisted.last_error.clone();
        } else if persisted.mode == RunnerMode::Sleeping {
            self.mode = RunnerMode::Sleeping;
            self.sleep_since = persisted.sleep_since;
            self.next_market_open_at = persisted.next_market_open_at;
        } else {
            self.mode = RunnerMode::Running;
            self.sleep_since = None;
            self.next_market_open_at = None;
        }
    }

    /// Structural check applied to records loaded from storage
    pub fn validate(&self) -> Result<(), String> {
        if self.mode == RunnerMode::Sleeping && self.sleep_since.is_none() {
            return Err("mode is SLEEPING but sleep_since is missing".to_string());
        }
        if self.mode != RunnerMode::Sleeping && self.sleep_since.is_some() {
            return Err(format!("mode is {} but sleep_since is set", self.mode));
        }
        if !self.tick_interval_seconds.is_finite() || self.tick_interval_seconds <= 0.0 {
            return Err(format!(
                "tick_interval_seconds must be positive, got {}",
                self.tick_interval_seconds
            ));
        }
        Ok(())
    }
}

/// Outcome of a start/stop/pause command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerCommandResult {
    pub success: bool,
    pub message: String,
    pub status: RunnerState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn running() -> RunnerState {
        let mut state = RunnerState::new(60.0);
        state.mode = RunnerMode::Running;
        state
    }

    #[test]
    fn test_enter_sleep_only_once() {
        let mut state = running();
        let t0 = Utc::now();
        assert!(state.enter_sleep(t0, None));
        assert!(!state.enter_sleep(t0 + Duration::seconds(60), None));
        assert_eq!(state.sleep_since, Some(t0));
        assert_eq!(state.mode, RunnerMode::Sleeping);
    }

    #[test]
    fn test_resume_clears_sleep_and_counts() {
        let mut state = running();
        let t0 = Utc::now();
        state.enter_sleep(t0, Some(t0 + Duration::hours(12)));
        assert!(state.resume(t0 + Duration::hours(12)));
        assert_eq!(state.mode, RunnerMode::Running);
        assert!(state.sleep_since.is_none());
        assert!(state.next_market_open_at.is_none());
        assert_eq!(state.resume_count, 1);
        assert!(!state.resume(t0));
        assert_eq!(state.resume_count, 1);
    }

    #[test]
    fn test_restore_keeps_sleep_continuity() {
        let mut persisted = running();
        let t0 = Utc::now() - Duration::hours(3);
        persisted.enter_sleep(t0, None);
        persisted.resume_count = 4;

        let mut fresh = RunnerState::new(60.0);
        fresh.restore_from(&persisted);
        assert_eq!(fresh.mode, RunnerMode::Sleeping);
        assert_eq!(fresh.sleep_since, Some(t0));
        assert_eq!(fresh.resume_count, 4);
    }

    #[test]
    fn test_restore_from_running_starts_running() {
        let persisted = running();
        let mut fresh = RunnerState::new(60.0);
        fresh.restore_from(&persisted);
        assert_eq!(fresh.mode, RunnerMode::Running);
        assert!(fresh.sleep_since.is_none());
    }

    #[test]
    fn test_restore_from_error_stays_in_error() {
        let mut persisted = running();
        persisted.mark_error("strategy panicked");
        let mut fresh = RunnerState::new(60.0);
        fresh.restore_from(&persisted);
        assert_eq!(fresh.mode, RunnerMode::Error);
        assert_eq!(fresh.last_error.as_deref(), Some("strategy panicked"));
        assert!(fresh.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_sleep_without_timestamp() {
        let mut state = running();
        state.mode = RunnerMode::Sleeping;
        assert!(state.validate().is_err());
        state.sleep_since = Some(Utc::now());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_mode_serializes_uppercase() {
        let json = serde_json::to_string(&RunnerMode::Sleeping).unwrap();
        assert_eq!(json, "\"SLEEPING\"");
    }
}
