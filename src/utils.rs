use crate::{DaqError, DaqResult, OutputSettings};
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Counters shared by the poll loop and both consumers of one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub packets: AtomicU64,
    pub events_decoded: AtomicU64,
    pub long_events: AtomicU64,
    pub events_written: AtomicU64,
    pub snapshots_published: AtomicU64,
    pub empty_polls: AtomicU64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            events_decoded: self.events_decoded.load(Ordering::Relaxed),
            long_events: self.long_events.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets: u64,
    pub events_decoded: u64,
    pub long_events: u64,
    pub events_written: u64,
    pub snapshots_published: u64,
    pub empty_polls: u64,
}

/// Event counter with an all-time total and a sliding 1 s window rate.
#[derive(Debug)]
pub struct Counter {
    pub n_events: u64,
    pub t_begin: Instant,
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    events_in_window: u64,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            n_events: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            samples: VecDeque::new(),
            events_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Average events/s since `t_begin`.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.n_events as f64 / secs
    }

    /// Events/s over the sliding window.
    pub fn rate(&self) -> f64 {
        self.events_in_window as f64 / self.window.as_secs_f64().max(1e-6)
    }

    /// Feed the latest running total (e.g. `SessionStats::events_written`).
    pub fn update_total(&mut self, total: u64) {
        let delta = total.saturating_sub(self.n_events);
        self.increment_at(Instant::now(), delta);
    }

    fn increment_at(&mut self, now: Instant, count: u64) {
        self.n_events += count;
        self.samples.push_back((now, count));
        self.events_in_window += count;

        while let Some(&(ts, n)) = self.samples.front() {
            if now.duration_since(ts) > self.window {
                self.samples.pop_front();
                self.events_in_window -= n;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.n_events = 0;
        self.t_begin = Instant::now();
        self.samples.clear();
        self.events_in_window = 0;
    }
}

/// File for a session: `{name}_{number:04}.h5` with auto-increment, `{name}.h5` without.
pub fn output_file(settings: &OutputSettings, number: u32) -> PathBuf {
    let name = if settings.auto_increment {
        format!("{}_{:04}.h5", settings.file_name, number)
    } else {
        format!("{}.h5", settings.file_name)
    };
    PathBuf::from(&settings.directory).join(name)
}

/// First number at or after `from` whose numbered file does not exist yet, so a restart
/// with a stale `file_number` never lands on an earlier session's file.
pub fn next_free_file_number(settings: &OutputSettings, from: u32) -> u32 {
    let mut number = from;
    while output_file(settings, number).exists() {
        number += 1;
    }
    if number != from {
        log::info!("File numbers {from}..{number} already taken, continuing at {number}");
    }
    number
}

pub fn create_output_dir(settings: &OutputSettings) -> DaqResult<PathBuf> {
    let path = PathBuf::from(&settings.directory);
    if !path.exists() {
        std::fs::create_dir_all(&path)
            .map_err(|e| DaqError::storage(&format!("create {}", path.display()), e))?;
        log::info!("Created output directory {}", path.display());
    }
    Ok(path)
}
