//! Snapshot of the conditions that undermine background delivery.

use sysinfo::System;

use geowake_daemon_protocol::ReliabilityReport;

use crate::alarms::AlarmService;
use crate::config::PlatformConfig;
use crate::host::HostRegistry;

pub fn check_reliability(
    platform: &PlatformConfig,
    alarms: &dyn AlarmService,
    hosts: &HostRegistry,
) -> ReliabilityReport {
    ReliabilityReport {
        battery_optimized: !platform.battery_optimization_exempt,
        exact_alarm_permission: alarms.can_schedule_exact(),
        manufacturer: manufacturer(platform),
        background_restricted: false,
        host_alive: hosts.is_alive(),
    }
}

fn manufacturer(platform: &PlatformConfig) -> String {
    platform
        .manufacturer
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(System::name)
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}
