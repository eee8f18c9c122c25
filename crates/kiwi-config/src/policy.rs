//! Validated cluster configuration

use crate::schema::{RawConfig, RawWorker};
use chrono::{DateTime, FixedOffset, Local, TimeZone};
use kiwi_util::{NodeName, ReservationSchedule, Username};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_INSTALL_PATH: &str = "/usr/lib/kiwi";

/// Validated cluster configuration ready for use by the lease client and gate
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Install location of the kiwi binaries on the workers
    pub worker_install_path: PathBuf,

    /// Shared directory as seen from the workers. None means the same path
    /// the client uses.
    pub worker_shared_path: Option<PathBuf>,

    /// Logins the gate always admits
    pub bypass: HashSet<Username>,

    /// Offset for reservation windows. None means local time.
    pub timezone: Option<FixedOffset>,

    /// Registered workers
    pub workers: BTreeMap<NodeName, Worker>,
}

impl ClusterConfig {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        let workers = raw
            .workers
            .into_iter()
            .map(|(name, worker)| {
                let name = NodeName::new(name);
                (name.clone(), Worker::from_raw(name, worker))
            })
            .collect();

        Self {
            worker_install_path: raw
                .worker_install_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALL_PATH)),
            worker_shared_path: raw.worker_shared_path,
            bypass: raw.worker_ssh_bypass.into_iter().map(Username::new).collect(),
            timezone: raw
                .timezone_offset_hours
                .and_then(|h| FixedOffset::east_opt(h * 3600)),
            workers,
        }
    }

    /// Get worker by name
    pub fn worker(&self, name: &NodeName) -> Option<&Worker> {
        self.workers.get(name)
    }

    pub fn is_bypass(&self, login: &Username) -> bool {
        self.bypass.contains(login)
    }

    /// Express `now` in the zone reservation windows are written in
    pub fn reservation_time(&self, now: DateTime<Local>) -> DateTime<FixedOffset> {
        match self.timezone {
            Some(offset) => now.with_timezone(&offset),
            None => now.fixed_offset(),
        }
    }

    /// Whether `worker` may be leased from `now` for `duration`.
    /// Workers without reservation windows are always reservable.
    pub fn is_reservable(&self, worker: &Worker, now: DateTime<Local>, duration: Duration) -> bool {
        match &worker.reservation {
            Some(schedule) => schedule.permits(&self.reservation_time(now), duration),
            None => true,
        }
    }
}

/// Validated worker definition
#[derive(Debug, Clone)]
pub struct Worker {
    pub name: NodeName,
    pub host: String,
    pub port: u16,
    pub reservation: Option<ReservationSchedule>,
    pub label: Option<String>,
}

impl Worker {
    fn from_raw(name: NodeName, raw: RawWorker) -> Self {
        Self {
            name,
            host: raw.host,
            port: raw.port,
            // Validation has already rejected unparsable schedules
            reservation: raw.reservation.and_then(|r| r.parse().ok()),
            label: raw.label.filter(|l| !l.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn config_with(reservation: Option<&str>, offset: Option<i32>) -> ClusterConfig {
        let mut raw = RawConfig::empty();
        raw.timezone_offset_hours = offset;
        raw.workers.insert(
            "gpu1".into(),
            RawWorker {
                host: "10.0.0.1".into(),
                port: 22,
                reservation: reservation.map(Into::into),
                label: Some(String::new()),
            },
        );
        ClusterConfig::from_raw(raw)
    }

    #[test]
    fn test_defaults() {
        let config = config_with(None, None);
        assert_eq!(config.worker_install_path, PathBuf::from(DEFAULT_INSTALL_PATH));
        assert!(config.is_bypass(&Username::new("root")));
        assert!(!config.is_bypass(&Username::new("alice")));

        let worker = config.worker(&NodeName::new("gpu1")).unwrap();
        assert!(worker.label.is_none());
        assert!(config.is_reservable(worker, Local::now(), Duration::from_secs(86_400 * 30)));
    }

    #[test]
    fn test_reservation_evaluated_in_configured_offset() {
        let config = config_with(Some("09:00-18:00"), Some(8));
        let worker = config.worker(&NodeName::new("gpu1")).unwrap();

        // 12:00 UTC is 20:00 at UTC+8, outside the window
        let noon_utc = chrono::Utc
            .with_ymd_and_hms(2025, 6, 2, 12, 0, 0)
            .unwrap()
            .with_timezone(&Local);
        assert_eq!(config.reservation_time(noon_utc).hour(), 20);
        assert!(!config.is_reservable(worker, noon_utc, Duration::from_secs(600)));

        // 02:00 UTC is 10:00 at UTC+8, inside
        let morning_utc = chrono::Utc
            .with_ymd_and_hms(2025, 6, 2, 2, 0, 0)
            .unwrap()
            .with_timezone(&Local);
        assert!(config.is_reservable(worker, morning_utc, Duration::from_secs(600)));
    }
}
