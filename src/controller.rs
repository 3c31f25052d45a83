use crate::{
    create_output_dir, decode, fan_out, next_free_file_number, output_file, run_storage,
    run_telemetry, AcqStatus, Conf, Consumers, DaqError, DaqResult, DatasetOptions,
    DatasetWriter, DecodeState, DecodedBatch, DerivedOutput, DeviceLink, FanOut,
    LinkInterrupter, SessionStats, SnapshotCell, StatsSnapshot, StatusCell, StreamLabels,
};
use log::{debug, error, info, warn};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// The control write that resets the device's acquisition before a session.
pub trait DeviceReset: Send {
    fn reset(&mut self) -> DaqResult<()>;
}

/// Reset hook for setups where the control system resets the device itself.
#[derive(Debug, Default)]
pub struct LogReset;

impl DeviceReset for LogReset {
    fn reset(&mut self) -> DaqResult<()> {
        info!("Device reset requested (handled by the control system)");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub file: PathBuf,
    pub events_written: u64,
    pub stats: StatsSnapshot,
    pub telemetry_dropped: u64,
    pub duration: Duration,
}

struct Session {
    file: PathBuf,
    started: Instant,
    stats: Arc<SessionStats>,
    telemetry_dropped: Arc<AtomicU64>,
    interrupter: LinkInterrupter,
    poller: JoinHandle<DaqResult<()>>,
    storage: JoinHandle<DaqResult<u64>>,
    telemetry: JoinHandle<()>,
}

struct Units {
    poller: JoinHandle<DaqResult<()>>,
    storage: JoinHandle<DaqResult<u64>>,
    telemetry: JoinHandle<()>,
}

/// Starts and stops acquisition sessions and owns the shared status.
///
/// `start` is only accepted while `Idle` and `stop` only while `Acquiring`; anything else is
/// rejected with `DaqError::State` and leaves status unchanged.
pub struct AcquisitionController {
    conf: Conf,
    labels: StreamLabels,
    derived: Vec<DerivedOutput>,
    status: StatusCell,
    reset: Box<dyn DeviceReset>,
    snapshots: SnapshotCell,
    file_number: u32,
    session: Option<Session>,
}

impl AcquisitionController {
    pub fn new(conf: Conf, reset: Box<dyn DeviceReset>) -> DaqResult<Self> {
        conf.validate()?;
        Ok(Self {
            labels: conf.labels()?,
            derived: conf.derived_outputs()?,
            file_number: conf.output.file_number,
            conf,
            status: StatusCell::new(),
            reset,
            snapshots: SnapshotCell::new(),
            session: None,
        })
    }

    pub fn status(&self) -> AcqStatus {
        self.status.get()
    }

    /// A handle on the status for observers and hooks.
    pub fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    pub fn snapshots(&self) -> SnapshotCell {
        self.snapshots.clone()
    }

    pub fn conf(&self) -> &Conf {
        &self.conf
    }

    /// Number the next auto-incremented file will use.
    pub fn file_number(&self) -> u32 {
        self.file_number
    }

    pub fn current_file(&self) -> Option<&PathBuf> {
        self.session.as_ref().map(|s| &s.file)
    }

    pub fn session_stats(&self) -> Option<StatsSnapshot> {
        self.session.as_ref().map(|s| s.stats.snapshot())
    }

    pub fn telemetry_dropped(&self) -> u64 {
        self.session
            .as_ref()
            .map_or(0, |s| s.telemetry_dropped.load(Ordering::Relaxed))
    }

    /// Reset the device outside a session.
    pub fn reset_device(&mut self) -> DaqResult<()> {
        let status = self.status.get();
        if status != AcqStatus::Idle {
            return Err(DaqError::State {
                action: "reset",
                status,
            });
        }
        self.reset.reset()
    }

    pub fn start(&mut self) -> DaqResult<()> {
        let status = self.status.get();
        if status != AcqStatus::Idle || self.session.is_some() {
            return Err(DaqError::State {
                action: "start",
                status,
            });
        }

        self.reset.reset()?;
        thread::sleep(Duration::from_millis(self.conf.device.reset_settle_ms));

        create_output_dir(&self.conf.output)?;
        if self.conf.output.auto_increment {
            self.file_number = next_free_file_number(&self.conf.output, self.file_number);
        }
        let file = output_file(&self.conf.output, self.file_number);
        let link = DeviceLink::connect_with_retry(&self.conf.device.address, &self.conf.device)?;
        let interrupter = link.interrupter()?;
        let writer = DatasetWriter::create(
            &file,
            &self.conf.output.dataset_path,
            &self.labels,
            &DatasetOptions::from_settings(&self.conf.output),
        )?;
        if self.conf.output.auto_increment {
            self.file_number += 1;
        }

        let (fanout, consumers) =
            fan_out(self.conf.queues.storage_depth, self.conf.queues.telemetry_depth);
        let stats = Arc::new(SessionStats::default());
        let telemetry_dropped = fanout.telemetry_dropped_counter();

        // Consumers must never observe a stale Idle.
        self.status.transition(AcqStatus::Idle, AcqStatus::Acquiring)?;

        let units = match self.spawn_units(link, fanout, consumers, writer, &stats) {
            Ok(units) => units,
            Err(e) => {
                self.abandon_start();
                return Err(e);
            }
        };

        info!("Acquisition started, writing {}", file.display());
        self.session = Some(Session {
            file,
            started: Instant::now(),
            stats,
            telemetry_dropped,
            interrupter,
            poller: units.poller,
            storage: units.storage,
            telemetry: units.telemetry,
        });
        Ok(())
    }

    /// Spawn the consumers, then the producer. On failure every unit already running has
    /// been joined before the error is returned.
    fn spawn_units(
        &self,
        link: DeviceLink,
        fanout: FanOut,
        consumers: Consumers,
        writer: DatasetWriter,
        stats: &Arc<SessionStats>,
    ) -> DaqResult<Units> {
        let interval = self.conf.poll_interval();
        let storage = {
            let status = self.status.clone();
            let stats = Arc::clone(stats);
            let rx = consumers.storage;
            spawn("storage", move || run_storage(rx, status, writer, interval, stats))?
        };
        let telemetry = {
            let status = self.status.clone();
            let stats = Arc::clone(stats);
            let publisher = self.snapshots.clone();
            let labels = self.labels.clone();
            let derived = self.derived.clone();
            let rx = consumers.telemetry;
            spawn("telemetry", move || {
                run_telemetry(rx, status, publisher, labels, derived, interval, stats)
            })
        };
        let telemetry = match telemetry {
            Ok(handle) => handle,
            Err(e) => {
                // Disconnecting the queue is what lets the writer close its file.
                drop(fanout);
                let _ = join("storage", storage);
                return Err(e);
            }
        };
        let poller = {
            let status = self.status.clone();
            let stats = Arc::clone(stats);
            spawn("poll", move || run_poll_loop(link, fanout, status, stats))
        };
        match poller {
            Ok(poller) => Ok(Units {
                poller,
                storage,
                telemetry,
            }),
            Err(e) => {
                let _ = join("storage", storage);
                let _ = join("telemetry", telemetry);
                Err(e)
            }
        }
    }

    /// Walk a start that failed after `Acquiring` was published back to `Idle`.
    fn abandon_start(&mut self) {
        error!("Acquisition start abandoned");
        if let Err(e) = self
            .status
            .transition(AcqStatus::Acquiring, AcqStatus::Stopping)
            .and_then(|_| self.status.transition(AcqStatus::Stopping, AcqStatus::Idle))
        {
            warn!("Rolling back start: {e}");
        }
    }

    /// Ask every unit to drain, wait for them, and return to `Idle`.
    pub fn stop(&mut self) -> DaqResult<SessionReport> {
        self.status.transition(AcqStatus::Acquiring, AcqStatus::Stopping)?;
        info!("Acquisition stopping");
        self.finish()
    }

    /// Complete a session that a failing unit moved to `Stopping` on its own.
    ///
    /// Returns `None` when there is nothing to reap.
    pub fn reap(&mut self) -> Option<DaqResult<SessionReport>> {
        if self.status.get() == AcqStatus::Stopping && self.session.is_some() {
            Some(self.finish())
        } else {
            None
        }
    }

    fn finish(&mut self) -> DaqResult<SessionReport> {
        let Some(session) = self.session.take() else {
            return Err(DaqError::State {
                action: "stop",
                status: self.status.get(),
            });
        };

        // A device that stops answering mid-read would hold the poll loop until the read
        // timeout; past the grace period the socket is closed under it.
        let grace = Duration::from_millis(self.conf.device.stop_grace_ms);
        let deadline = Instant::now() + grace;
        while !session.poller.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if !session.poller.is_finished() {
            warn!("Device read still pending after {grace:?}, closing the link");
            session.interrupter.interrupt();
        }

        let poll_result = join("poll", session.poller);
        let storage_result = join("storage", session.storage);
        let telemetry_result = join("telemetry", session.telemetry);

        self.status.transition(AcqStatus::Stopping, AcqStatus::Idle)?;

        // The writer's failure is the root cause when both failed.
        let events_written = match (storage_result?, poll_result?) {
            (Ok(written), Ok(())) => written,
            (Err(e), _) | (Ok(_), Err(e)) => {
                error!("Acquisition ended with error: {e}");
                return Err(e);
            }
        };
        telemetry_result?;

        let report = SessionReport {
            file: session.file,
            events_written,
            stats: session.stats.snapshot(),
            telemetry_dropped: session.telemetry_dropped.load(Ordering::Relaxed),
            duration: session.started.elapsed(),
        };
        info!(
            "Acquisition finished: {} events in {} packets ({} long events, {} snapshots dropped) -> {}",
            report.events_written,
            report.stats.packets,
            report.stats.long_events,
            report.telemetry_dropped,
            report.file.display()
        );
        Ok(report)
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        if self.session.is_none() {
            return;
        }
        let result = match self.status.get() {
            AcqStatus::Acquiring => self.stop(),
            _ => self.finish(),
        };
        if let Err(e) = result {
            warn!("Session closed on shutdown with error: {e}");
        }
    }
}

fn spawn<T: Send + 'static>(
    name: &str,
    f: impl FnOnce() -> T + Send + 'static,
) -> DaqResult<JoinHandle<T>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| DaqError::Thread(format!("spawn {name}: {e}")))
}

fn join<T>(name: &str, handle: JoinHandle<T>) -> DaqResult<T> {
    handle
        .join()
        .map_err(|_| DaqError::Thread(format!("{name} panicked")))
}

/// Producer: poll, decode, fan out, until status leaves `Acquiring` or the link fails.
///
/// Returning drops the `FanOut`, which is what lets both consumers finish.
pub fn run_poll_loop(
    mut link: DeviceLink,
    mut fanout: FanOut,
    status: StatusCell,
    stats: Arc<SessionStats>,
) -> DaqResult<()> {
    let mut state = DecodeState::default();
    let mut sequence = 0u64;
    let mut next_event_id = 0u64;

    while status.is_acquiring() {
        let packet = match link.poll() {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                stats.empty_polls.fetch_add(1, Ordering::Relaxed);
                link.backoff();
                continue;
            }
            Err(e) if !status.is_acquiring() => {
                debug!("Device link closed during stop: {e}");
                break;
            }
            Err(e) => {
                error!("Device link failed: {e}");
                let _ = status.transition(AcqStatus::Acquiring, AcqStatus::Stopping);
                return Err(e);
            }
        };

        let (decoded, next_state) = decode(&packet, state);
        state = next_state;

        let n_events = decoded.events.len() as u64;
        stats.packets.fetch_add(1, Ordering::Relaxed);
        stats.events_decoded.fetch_add(n_events, Ordering::Relaxed);
        stats
            .long_events
            .fetch_add(decoded.long_events as u64, Ordering::Relaxed);

        let batch = DecodedBatch {
            sequence,
            first_event_id: next_event_id,
            events: decoded.events,
            long_events: decoded.long_events,
        };
        sequence += 1;
        next_event_id += n_events;

        if let Err(e) = fanout.push(batch) {
            error!("Fan-out failed: {e}");
            let _ = status.transition(AcqStatus::Acquiring, AcqStatus::Stopping);
            return Err(e);
        }
    }

    if state.is_mid_run() {
        warn!("Acquisition stopped inside a run; the partial run is discarded");
    }
    Ok(())
}
