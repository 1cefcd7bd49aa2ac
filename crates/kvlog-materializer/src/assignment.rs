//! Mapping the ledger onto a partition assignment.

use kvlog_broker::{PartitionStart, StartOffset};
use kvlog_core::TopicPartitionOffset;
use tracing::{info, warn};

/// Decide where each assigned partition starts.
///
/// If the ledger holds exactly the assigned partitions of `topic`, every
/// partition resumes at its recorded offset. Any other shape (first run,
/// partitions added or removed) replays every partition from the beginning.
pub fn resolve_start_positions(
    topic: &str,
    assigned: &[i32],
    ledger: &[TopicPartitionOffset],
) -> Vec<PartitionStart> {
    let saved: Vec<&TopicPartitionOffset> = ledger.iter().filter(|row| row.topic == topic).collect();
    let resumed: Option<Vec<PartitionStart>> = (saved.len() == assigned.len())
        .then(|| {
            assigned
                .iter()
                .map(|&partition| {
                    saved
                        .iter()
                        .find(|row| row.partition == partition)
                        .map(|row| PartitionStart {
                            partition,
                            start: StartOffset::At(row.offset),
                        })
                })
                .collect()
        })
        .flatten();

    match resumed {
        Some(starts) => {
            info!(%topic, partitions = starts.len(), "resuming from ledger offsets");
            starts
        }
        None => {
            if !saved.is_empty() {
                let ledger_partitions: Vec<i32> = saved.iter().map(|row| row.partition).collect();
                warn!(
                    %topic,
                    ?assigned,
                    ledger = ?ledger_partitions,
                    "ledger does not match assignment, replaying from the beginning"
                );
            } else {
                info!(%topic, partitions = assigned.len(), "no ledger, replaying from the beginning");
            }
            assigned
                .iter()
                .map(|&partition| PartitionStart {
                    partition,
                    start: StartOffset::Beginning,
                })
                .collect()
        }
    }
}
