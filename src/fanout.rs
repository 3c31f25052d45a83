use crate::{DaqError, DaqResult, DecodedBatch};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::debug;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

pub type Batch = Arc<DecodedBatch>;

/// Producer half of the queue pair.
///
/// Storage is lossless: `push` blocks while the storage queue is full. Telemetry is lossy:
/// when its queue is full the oldest waiting batch is discarded to make room. Dropping
/// the `FanOut` disconnects both queues so the consumers drain and exit.
pub struct FanOut {
    storage: Sender<Batch>,
    telemetry: Sender<Batch>,
    // Held so the producer can evict from a full telemetry queue.
    telemetry_evict: Receiver<Batch>,
    telemetry_dropped: Arc<AtomicU64>,
}

pub struct Consumers {
    pub storage: Receiver<Batch>,
    pub telemetry: Receiver<Batch>,
}

pub fn fan_out(storage_depth: usize, telemetry_depth: usize) -> (FanOut, Consumers) {
    let (storage_tx, storage_rx) = bounded(storage_depth);
    let (telemetry_tx, telemetry_rx) = bounded(telemetry_depth);
    let fanout = FanOut {
        storage: storage_tx,
        telemetry: telemetry_tx,
        telemetry_evict: telemetry_rx.clone(),
        telemetry_dropped: Arc::new(AtomicU64::new(0)),
    };
    (
        fanout,
        Consumers {
            storage: storage_rx,
            telemetry: telemetry_rx,
        },
    )
}

impl FanOut {
    pub fn push(&mut self, batch: DecodedBatch) -> DaqResult<()> {
        let batch = Arc::new(batch);
        self.push_telemetry(Arc::clone(&batch));
        self.storage
            .send(batch)
            .map_err(|_| DaqError::Storage("storage consumer is gone".into()))
    }

    fn push_telemetry(&mut self, mut batch: Batch) {
        loop {
            match self.telemetry.try_send(batch) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    batch = back;
                    if let Ok(old) = self.telemetry_evict.try_recv() {
                        let dropped = self.telemetry_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(
                            "Telemetry queue full, dropped batch {} ({dropped} dropped)",
                            old.sequence
                        );
                    }
                }
                // Unreachable while `telemetry_evict` is alive.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Number of telemetry batches discarded because the queue was full.
    pub fn telemetry_dropped(&self) -> u64 {
        self.telemetry_dropped.load(Ordering::Relaxed)
    }

    pub fn telemetry_dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.telemetry_dropped)
    }

    pub fn storage_backlog(&self) -> usize {
        self.storage.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    fn batch(sequence: u64) -> DecodedBatch {
        DecodedBatch {
            sequence,
            ..Default::default()
        }
    }

    #[test]
    fn both_consumers_receive_the_same_batch() {
        let (mut fanout, consumers) = fan_out(4, 4);
        fanout.push(batch(7)).unwrap();
        let a = consumers.storage.recv().unwrap();
        let b = consumers.telemetry.recv().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.sequence, 7);
    }

    #[test]
    fn telemetry_drops_oldest_when_full() {
        let (mut fanout, consumers) = fan_out(16, 2);
        for seq in 0..5 {
            fanout.push(batch(seq)).unwrap();
        }
        let telemetry: Vec<u64> = consumers.telemetry.try_iter().map(|b| b.sequence).collect();
        assert_eq!(telemetry, [3, 4]);
        assert_eq!(fanout.telemetry_dropped(), 3);

        let storage: Vec<u64> = consumers.storage.try_iter().map(|b| b.sequence).collect();
        assert_eq!(storage, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn storage_applies_backpressure() {
        let (mut fanout, consumers) = fan_out(1, 1);
        fanout.push(batch(0)).unwrap();

        let producer = thread::spawn(move || {
            fanout.push(batch(1)).unwrap();
            fanout
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        assert_eq!(consumers.storage.recv().unwrap().sequence, 0);
        let fanout = producer.join().unwrap();
        assert_eq!(consumers.storage.recv().unwrap().sequence, 1);
        drop(fanout);
        assert!(consumers.storage.recv().is_err());
    }

    #[test]
    fn missing_storage_consumer_is_an_error() {
        let (mut fanout, consumers) = fan_out(1, 1);
        drop(consumers.storage);
        assert!(matches!(fanout.push(batch(0)), Err(DaqError::Storage(_))));
    }

    #[test]
    fn missing_telemetry_consumer_is_ignored() {
        let (mut fanout, consumers) = fan_out(4, 1);
        let Consumers { storage, telemetry } = consumers;
        drop(telemetry);
        // The evict handle keeps the channel open, so the queue just stays full.
        fanout.push(batch(0)).unwrap();
        fanout.push(batch(1)).unwrap();
        assert_eq!(storage.len(), 2);
    }
}
