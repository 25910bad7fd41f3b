//! Next-run computation for the scheduler.
//!
//! [`Schedule`] is pure: given "now" in any time zone it returns the next trigger strictly after
//! it. The binary's `schedule` command sleeps until that instant, runs the pipeline to completion
//! and only then asks for the next trigger, so runs never overlap.
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use digester::{config::SchedulerConfig, schedule::Schedule};
//!
//! let schedule = Schedule::from_config(&SchedulerConfig::default()).unwrap();
//! let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
//! assert_eq!(schedule.next_after(&now), Utc.with_ymd_and_hms(2024, 1, 16, 9, 0, 0).unwrap());
//! ```

use chrono::{Datelike, NaiveTime, TimeZone, Weekday};

use super::*;
use crate::config::SchedulerConfig;

/// How often the pipeline runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
  /// Every day at `run_time`
  #[default]
  Daily,
  /// Once a week on `weekday` at `run_time`
  Weekly,
  /// Every `interval_minutes`
  Interval,
}

impl Display for ScheduleMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Daily => write!(f, "daily"),
      Self::Weekly => write!(f, "weekly"),
      Self::Interval => write!(f, "interval"),
    }
  }
}

/// Longest accepted gap between interval runs.
const MAX_INTERVAL_DAYS: i64 = 366;

/// A parsed, validated trigger rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
  /// Trigger rule
  pub mode:     ScheduleMode,
  /// Wall-clock time for daily and weekly runs
  pub at:       NaiveTime,
  /// Day for weekly runs
  pub weekday:  Weekday,
  /// Gap between interval runs
  pub interval: chrono::Duration,
}

impl Schedule {
  /// Builds a schedule from the `[scheduler]` section.
  pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
    let weekday = match config.mode {
      ScheduleMode::Weekly => config.day_of_week()?,
      _ => config.day_of_week().unwrap_or(Weekday::Mon),
    };
    let interval = i64::try_from(config.interval_minutes.max(1))
      .ok()
      .and_then(chrono::Duration::try_minutes)
      .filter(|interval| *interval <= chrono::Duration::days(MAX_INTERVAL_DAYS))
      .ok_or_else(|| {
        DigestError::Config(format!(
          "scheduler.interval_minutes must be at most {} ({MAX_INTERVAL_DAYS} days)",
          MAX_INTERVAL_DAYS * 24 * 60
        ))
      })?;
    Ok(Self { mode: config.mode, at: config.time_of_day()?, weekday, interval })
  }

  /// The first trigger strictly after `now`.
  pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
    if self.mode == ScheduleMode::Interval {
      return now.clone() + self.interval;
    }

    let tz = now.timezone();
    let today = now.date_naive();
    // Eight days always contain a matching weekday that lies in the future.
    for offset in 0..=8 {
      let Some(day) = today.checked_add_days(chrono::Days::new(offset)) else { break };
      if self.mode == ScheduleMode::Weekly && day.weekday() != self.weekday {
        continue;
      }
      // Nonexistent local times (DST gaps) have no mapping and are skipped.
      if let Some(candidate) = tz.from_local_datetime(&day.and_time(self.at)).earliest() {
        if candidate > *now {
          return candidate;
        }
      }
    }
    now.clone() + chrono::Duration::days(1)
  }

  /// How long to wait from `now` until the next trigger.
  pub fn wait_from<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
    (self.next_after(now) - now.clone()).to_std().unwrap_or(Duration::ZERO)
  }
}

impl Display for Schedule {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.mode {
      ScheduleMode::Daily => write!(f, "daily at {}", self.at.format("%H:%M")),
      ScheduleMode::Weekly => write!(f, "every {} at {}", self.weekday, self.at.format("%H:%M")),
      ScheduleMode::Interval => write!(f, "every {} minutes", self.interval.num_minutes()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
  }

  #[test]
  fn test_daily_later_today_or_tomorrow() {
    let schedule = Schedule::from_config(&SchedulerConfig::default()).unwrap();
    assert_eq!(schedule.next_after(&at(2024, 1, 15, 8, 30)), at(2024, 1, 15, 9, 0));
    assert_eq!(schedule.next_after(&at(2024, 1, 15, 9, 0)), at(2024, 1, 16, 9, 0));
    assert_eq!(schedule.next_after(&at(2024, 12, 31, 23, 0)), at(2025, 1, 1, 9, 0));
  }

  #[test]
  fn test_weekly() {
    let config = SchedulerConfig {
      mode: ScheduleMode::Weekly,
      weekday: "Wed".into(),
      run_time: "07:15".into(),
      ..SchedulerConfig::default()
    };
    let schedule = Schedule::from_config(&config).unwrap();
    // 2024-01-15 is a Monday.
    assert_eq!(schedule.next_after(&at(2024, 1, 15, 12, 0)), at(2024, 1, 17, 7, 15));
    assert_eq!(schedule.next_after(&at(2024, 1, 17, 7, 15)), at(2024, 1, 24, 7, 15));
    assert_eq!(schedule.to_string(), "every Wed at 07:15");
  }

  #[test]
  fn test_interval() {
    let config =
      SchedulerConfig { mode: ScheduleMode::Interval, interval_minutes: 90, ..SchedulerConfig::default() };
    let schedule = Schedule::from_config(&config).unwrap();
    assert_eq!(schedule.next_after(&at(2024, 1, 15, 12, 0)), at(2024, 1, 15, 13, 30));
    assert_eq!(schedule.wait_from(&at(2024, 1, 15, 12, 0)), Duration::from_secs(90 * 60));
  }

  #[test]
  fn test_huge_interval_is_config_error() {
    for minutes in [u64::MAX, i64::MAX as u64, 527_041] {
      let config =
        SchedulerConfig { mode: ScheduleMode::Interval, interval_minutes: minutes, ..SchedulerConfig::default() };
      let err = Schedule::from_config(&config).unwrap_err();
      assert!(err.to_string().contains("scheduler.interval_minutes"), "{minutes} gave {err}");
    }
    let config =
      SchedulerConfig { mode: ScheduleMode::Interval, interval_minutes: 527_040, ..SchedulerConfig::default() };
    assert!(Schedule::from_config(&config).is_ok());
  }

  #[test]
  fn test_bad_time_is_config_error() {
    let config = SchedulerConfig { run_time: "25:99".into(), ..SchedulerConfig::default() };
    assert!(matches!(Schedule::from_config(&config), Err(DigestError::Config(_))));
  }

  #[test]
  fn test_mode_serde() {
    let mode: ScheduleMode = serde_json::from_str("\"weekly\"").unwrap();
    assert_eq!(mode, ScheduleMode::Weekly);
  }
}
