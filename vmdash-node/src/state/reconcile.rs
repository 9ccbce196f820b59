//! Recompute a record's status from the process table at read time.

use chrono::{DateTime, Duration, Utc};

use crate::model::{VmRecord, VmStatus, VmView};
use crate::process;

/// Liveness check used by [`reconcile_with`]; the OS probe in production.
pub trait Probe {
    fn is_alive(&self, pid: u32, start_time: Option<u64>) -> bool;
}

pub struct OsProbe;

impl Probe for OsProbe {
    fn is_alive(&self, pid: u32, start_time: Option<u64>) -> bool {
        process::is_alive(pid, start_time)
    }
}

pub fn reconcile(record: VmRecord) -> VmView {
    reconcile_with(&OsProbe, record, Utc::now())
}

/// The persisted status only decides between running and paused; whether the
/// VM runs at all comes from the probe.
pub fn reconcile_with(probe: &impl Probe, record: VmRecord, now: DateTime<Utc>) -> VmView {
    let alive = record
        .pid
        .is_some_and(|pid| probe.is_alive(pid, record.process_start_time));

    if !alive {
        return VmView {
            record,
            status: VmStatus::Stopped,
            uptime: None,
        };
    }

    let status = match record.status {
        VmStatus::Paused => VmStatus::Paused,
        _ => VmStatus::Running,
    };
    let uptime = record.started_at.map(|started| format_uptime(now - started));
    VmView {
        record,
        status,
        uptime,
    }
}

/// Most significant unit pair only: "2d 3h", "4h 10m" or "5m 30s".
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    let (days, hours, minutes, seconds) = (
        secs / 86_400,
        secs % 86_400 / 3_600,
        secs % 3_600 / 60,
        secs % 60,
    );
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m {seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::record;

    struct Fixed(bool);

    impl Probe for Fixed {
        fn is_alive(&self, _pid: u32, _start_time: Option<u64>) -> bool {
            self.0
        }
    }

    #[test]
    fn uptime_picks_the_largest_unit_pair() {
        assert_eq!(format_uptime(Duration::seconds(42)), "0m 42s");
        assert_eq!(format_uptime(Duration::seconds(5 * 60 + 30)), "5m 30s");
        assert_eq!(format_uptime(Duration::seconds(4 * 3600 + 10 * 60 + 9)), "4h 10m");
        assert_eq!(format_uptime(Duration::seconds(2 * 86_400 + 3 * 3600 + 59)), "2d 3h");
        assert_eq!(format_uptime(Duration::seconds(-5)), "0m 0s");
    }

    #[test]
    fn dead_process_is_stopped_whatever_was_persisted() {
        for persisted in [VmStatus::Running, VmStatus::Paused, VmStatus::Stopped] {
            let mut vm = record("ghost");
            vm.pid = Some(4242);
            vm.status = persisted;
            vm.started_at = Some(Utc::now());

            let view = reconcile_with(&Fixed(false), vm, Utc::now());
            assert_eq!(view.status, VmStatus::Stopped);
            assert_eq!(view.uptime, None);
        }
    }

    #[test]
    fn no_pid_means_stopped() {
        let mut vm = record("never-started");
        vm.status = VmStatus::Running;
        let view = reconcile_with(&Fixed(true), vm, Utc::now());
        assert_eq!(view.status, VmStatus::Stopped);
    }

    #[test]
    fn live_process_keeps_paused_and_reports_uptime() {
        let now = Utc::now();
        let mut vm = record("live");
        vm.pid = Some(4242);
        vm.started_at = Some(now - Duration::seconds(3 * 3600 + 5 * 60));

        vm.status = VmStatus::Paused;
        let view = reconcile_with(&Fixed(true), vm.clone(), now);
        assert_eq!(view.status, VmStatus::Paused);
        assert_eq!(view.uptime.as_deref(), Some("3h 5m"));

        vm.status = VmStatus::Stopped;
        let view = reconcile_with(&Fixed(true), vm, now);
        assert_eq!(view.status, VmStatus::Running);
    }

    #[test]
    fn os_probe_sees_real_processes() {
        let mut vm = record("self");
        vm.pid = Some(std::process::id());
        vm.started_at = Some(Utc::now());
        assert_eq!(reconcile(vm.clone()).status, VmStatus::Running);

        vm.pid = Some(999_999_999);
        assert_eq!(reconcile(vm).status, VmStatus::Stopped);
    }
}
