//! Timelines command implementation.

use super::Cluster;
use serde::Serialize;
use std::fs;
use std::path::Path;
use xlog_core::timeline::read_history_file;
use xlog_core::{Lsn, TimeLineId};

/// One ancestor line of a history file.
#[derive(Debug, Serialize)]
pub struct AncestorInfo {
    /// Ancestor timeline.
    pub tli: TimeLineId,
    /// Where the child branched off.
    pub switch_point: Lsn,
    /// Recorded reason.
    pub reason: String,
}

/// A timeline and its ancestry.
#[derive(Debug, Serialize)]
pub struct TimelineInfo {
    /// Timeline id.
    pub tli: TimeLineId,
    /// History file name.
    pub file: String,
    /// Ancestors, oldest first.
    pub ancestors: Vec<AncestorInfo>,
}

/// Timelines found in the log directory.
#[derive(Debug, Serialize)]
pub struct TimelinesOutput {
    /// Timeline of the latest checkpoint.
    pub current: TimeLineId,
    /// Every timeline with a history file, in id order.
    pub timelines: Vec<TimelineInfo>,
}

/// Runs the timelines command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = Cluster::open(path)?;
    let geometry = cluster.geometry();
    let xlog_dir = cluster.dir.xlog_dir();

    let mut timelines = Vec::new();
    for entry in fs::read_dir(&xlog_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(tli) = parse_history_name(&name) else {
            continue;
        };
        let ancestors = read_history_file(&entry.path(), &geometry)?
            .into_iter()
            .map(|e| AncestorInfo {
                tli: e.tli,
                switch_point: e.switch_point,
                reason: e.reason,
            })
            .collect();
        timelines.push(TimelineInfo {
            tli,
            file: name,
            ancestors,
        });
    }
    timelines.sort_by_key(|t| t.tli);

    let output = TimelinesOutput {
        current: cluster.control.checkpoint_copy.this_timeline,
        timelines,
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            print_text_output(&output);
        }
    }

    Ok(())
}

fn parse_history_name(name: &str) -> Option<TimeLineId> {
    let hex = name.strip_suffix(".history")?;
    if hex.len() != 8 {
        return None;
    }
    TimeLineId::from_str_radix(hex, 16).ok()
}

fn print_text_output(output: &TimelinesOutput) {
    println!("Current timeline: {}", output.current);
    println!();
    if output.timelines.is_empty() {
        println!("No history files (only timeline 1 has been used)");
        return;
    }
    for t in &output.timelines {
        println!("Timeline {} ({})", t.tli, t.file);
        for a in &t.ancestors {
            println!("  {:>8}  switched at {:<16} {}", a.tli, a.switch_point.to_string(), a.reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_names() {
        assert_eq!(parse_history_name("00000003.history"), Some(3));
        assert_eq!(parse_history_name("0000000A.history"), Some(10));
        assert_eq!(parse_history_name("000000010000000000000001"), None);
        assert_eq!(parse_history_name("3.history"), None);
    }
}
