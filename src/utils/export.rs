//! Metrics summary export: one `metric,value,description` row per counter.

use csv::Writer;
use log::info;
use std::{fs::create_dir_all, path::Path};

use crate::{
    core::error::{HubError, Result},
    utils::metrics::MetricsSnapshot,
};

pub fn export_metrics_csv(snapshot: &MetricsSnapshot, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        create_dir_all(dir)?;
    }

    let rows: [(&str, String, &str); 12] = [
        ("uptime_secs", format!("{:.3}", snapshot.uptime_secs), "Time since hub start"),
        ("commands_accepted", snapshot.commands_accepted.to_string(), "Commands broadcast to workers"),
        ("commands_rejected", snapshot.commands_rejected.to_string(), "Malformed commands refused at ingestion"),
        ("statuses_relayed", snapshot.statuses_relayed.to_string(), "Statuses stamped and fanned out"),
        ("listeners_pruned", snapshot.listeners_pruned.to_string(), "Disconnected listeners removed"),
        ("tracked_published", snapshot.tracked_published.to_string(), "Tracked frames sent on at least one interface"),
        ("tracked_dropped", snapshot.tracked_dropped.to_string(), "Tracked frames dropped before sending"),
        ("multicast_failures", snapshot.multicast_failures.to_string(), "Failed per-interface writes"),
        ("simulated_frames", snapshot.simulated_frames.to_string(), "Frames emitted by the vision simulator"),
        ("source_switches", snapshot.source_switches.to_string(), "Vision source switches"),
        ("vision_packets", snapshot.vision_packets.to_string(), "Datagrams received on the vision stream"),
        ("referee_packets", snapshot.referee_packets.to_string(), "Datagrams received on the referee stream"),
    ];

    let mut wtr = Writer::from_path(path).map_err(csv_error)?;
    wtr.write_record(["metric", "value", "description"])
        .map_err(csv_error)?;
    for (metric, value, description) in rows {
        wtr.write_record([metric, value.as_str(), description])
            .map_err(csv_error)?;
    }
    wtr.flush()?;

    info!("[Export] metrics summary written to {}", path.display());
    Ok(())
}

fn csv_error(e: csv::Error) -> HubError {
    HubError::Io(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn writes_summary_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("metrics.csv");
        let snapshot = MetricsSnapshot {
            commands_accepted: 3,
            vision_packets: 42,
            ..Default::default()
        };

        export_metrics_csv(&snapshot, &path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("metric,value,description"));
        assert!(text.contains("commands_accepted,3,"));
        assert!(text.contains("vision_packets,42,"));
        assert_eq!(text.lines().count(), 13);
    }
}
