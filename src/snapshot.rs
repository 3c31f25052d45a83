use crate::{Batch, DecodedBatch, DerivedOutput, SessionStats, StatusCell, StreamLabels};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, trace};
use serde::Serialize;
use std::{
    sync::{atomic::Ordering, Arc, RwLock},
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSnapshot {
    pub label: String,
    pub events: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedSnapshot {
    pub name: String,
    pub values: Vec<f64>,
}

/// The events of one batch, laid out per stream. Replaced, never appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub streams: Vec<StreamSnapshot>,
    pub num_events: usize,
    /// Session-wide index of the first event in this snapshot. Assigned by the producer, so
    /// batches dropped on the telemetry path leave a gap instead of shifting later ids.
    pub first_event_id: u64,
    pub derived: Vec<DerivedSnapshot>,
}

impl Snapshot {
    pub fn from_batch(
        labels: &StreamLabels,
        batch: &DecodedBatch,
        derived: &[DerivedOutput],
    ) -> Self {
        let streams = labels
            .iter()
            .enumerate()
            .map(|(position, label)| StreamSnapshot {
                label: label.to_string(),
                events: batch.events.iter().map(|e| e.words[position]).collect(),
            })
            .collect();
        let derived = derived
            .iter()
            .map(|output| DerivedSnapshot {
                name: output.name.clone(),
                values: batch
                    .events
                    .iter()
                    .map(|e| {
                        e.words
                            .iter()
                            .zip(&output.weights)
                            .map(|(w, k)| f64::from(*w) * k)
                            .sum::<f64>()
                    })
                    .collect(),
            })
            .collect();
        Self {
            streams,
            num_events: batch.len(),
            first_event_id: batch.first_event_id,
            derived,
        }
    }
}

/// Where snapshots go. Each call fully replaces what observers see.
pub trait SnapshotPublisher: Send {
    fn publish(&mut self, snapshot: Snapshot);
}

/// In-process observation point: the latest snapshot behind a lock, shared by clones.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCell {
    latest: Arc<RwLock<Arc<Snapshot>>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        self.latest
            .read()
            .map(|s| Arc::clone(&s))
            .unwrap_or_default()
    }
}

impl SnapshotPublisher for SnapshotCell {
    fn publish(&mut self, snapshot: Snapshot) {
        if let Ok(mut latest) = self.latest.write() {
            *latest = Arc::new(snapshot);
        }
    }
}

/// Telemetry consumer: one fresh snapshot per batch until the producer hangs up.
pub fn run_telemetry<P: SnapshotPublisher>(
    rx: Receiver<Batch>,
    status: StatusCell,
    mut publisher: P,
    labels: StreamLabels,
    derived: Vec<DerivedOutput>,
    interval: Duration,
    stats: Arc<SessionStats>,
) {
    loop {
        match rx.recv_timeout(interval) {
            Ok(batch) => {
                let snapshot = Snapshot::from_batch(&labels, &batch, &derived);
                trace!(
                    "Publishing batch {} ({} events)",
                    batch.sequence,
                    snapshot.num_events
                );
                publisher.publish(snapshot);
                stats.snapshots_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(RecvTimeoutError::Timeout) => {
                // Snapshots are lossy; nothing queued and no acquisition means we are done.
                if !status.is_acquiring() && rx.is_empty() {
                    debug!("Telemetry done, acquisition is {}", status.get());
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
