use crate::{
    AcqStatus, Batch, DaqError, DaqResult, OutputSettings, SessionStats, ShortEvent, StatusCell,
    StreamLabels, SHORT_EVENT_WORDS,
};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use hdf5::{Dataset, Extent, File, Group, SimpleExtents};
use log::{debug, error, info};
use ndarray::Array2;
use std::{
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

pub const ATTR_NUM_EVENTS: &str = "numEvents";
pub const ATTR_LONG_EVENTS: &str = "longEvents";
pub const ATTR_START_TIME: &str = "startTime";

/// Chunk and compression options for the stream columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct Compression {
    /// blosc-zstd level, 0 = uncompressed.
    pub level: u8,
    pub threads: u8,
}

/// How a dataset file is created and how far its columns may grow.
#[derive(Debug, Clone, Copy)]
pub struct DatasetOptions {
    /// Growth block, in events.
    pub resize_by: usize,
    /// Column length cap; appends past it fail.
    pub max_events: Option<usize>,
    pub compression: Compression,
    /// Truncate an existing file instead of refusing to touch it.
    pub overwrite: bool,
}

impl DatasetOptions {
    /// Numbered (auto-increment) files are never overwritten.
    pub fn from_settings(settings: &OutputSettings) -> Self {
        Self {
            resize_by: settings.resize_by,
            max_events: (settings.max_events > 0).then_some(settings.max_events),
            compression: Compression {
                level: settings.compression_level,
                threads: settings.blosc_threads,
            },
            overwrite: !settings.auto_increment,
        }
    }
}

/// Appends events into one resizable `u32` column per labeled stream.
///
/// Columns start with `resize_by` rows and grow by whole `resize_by` blocks, so a resize
/// happens once per block instead of once per event. Every column is resized before any
/// of them is written, which keeps their lengths equal.
pub struct DatasetWriter {
    path: PathBuf,
    file: File,
    group: Group,
    columns: Vec<Dataset>,
    resize_by: usize,
    max_events: Option<usize>,
    cursor: usize,
    capacity: usize,
    long_events: u64,
}

impl DatasetWriter {
    pub fn create(
        path: &Path,
        dataset_path: &str,
        labels: &StreamLabels,
        options: &DatasetOptions,
    ) -> DaqResult<Self> {
        let DatasetOptions {
            resize_by,
            max_events,
            compression,
            overwrite,
        } = *options;
        if resize_by == 0 || max_events == Some(0) {
            return Err(DaqError::Storage(
                "resize_by and max_events must be > 0".into(),
            ));
        }
        let file = if overwrite {
            File::create(path)
        } else {
            File::create_excl(path)
        }
        .map_err(|e| DaqError::storage(&format!("create {}", path.display()), e))?;
        let group = ensure_group(&file, dataset_path)?;

        if compression.level > 0 {
            hdf5::filters::blosc_set_nthreads(compression.threads.max(1));
        }

        let initial = max_events.map_or(resize_by, |max| resize_by.min(max));
        let mut columns = Vec::with_capacity(SHORT_EVENT_WORDS);
        for label in labels.iter() {
            let builder = group
                .new_dataset::<u32>()
                .shape(SimpleExtents::new([Extent::new(initial, max_events)]))
                .chunk(initial);
            let builder = if compression.level > 0 {
                builder.blosc_zstd(compression.level, true)
            } else {
                builder
            };
            let column = builder
                .create(label)
                .map_err(|e| DaqError::storage(&format!("create column {label}"), e))?;
            columns.push(column);
        }

        group
            .new_attr::<i64>()
            .create(ATTR_START_TIME)?
            .write_scalar(&time::OffsetDateTime::now_utc().unix_timestamp())?;

        info!(
            "Writing {} under {dataset_path} (block {resize_by} events)",
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            group,
            columns,
            resize_by,
            max_events,
            cursor: 0,
            capacity: initial,
            long_events: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events written so far.
    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Rows currently allocated in every column.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// On-disk length of each column.
    pub fn column_lengths(&self) -> Vec<usize> {
        self.columns.iter().map(|c| c.size()).collect()
    }

    pub fn record_long_events(&mut self, count: usize) {
        self.long_events += count as u64;
    }

    /// Append one value per label per event at the cursor, growing the columns first if
    /// the batch would pass the current capacity.
    pub fn append(&mut self, events: &[ShortEvent]) -> DaqResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let start = self.cursor;
        let end = start + events.len();
        if end > self.capacity {
            self.grow_to(end)?;
        }

        // One contiguous row per stream so each column is written from a standard-layout view.
        let mut block = Array2::<u32>::zeros((SHORT_EVENT_WORDS, events.len()));
        for (j, event) in events.iter().enumerate() {
            for (i, word) in event.words.iter().enumerate() {
                block[[i, j]] = *word;
            }
        }
        for (i, column) in self.columns.iter().enumerate() {
            column
                .write_slice(block.row(i), start..end)
                .map_err(|e| DaqError::storage(&format!("write column {i}"), e))?;
        }

        self.cursor = end;
        Ok(())
    }

    fn grow_to(&mut self, needed: usize) -> DaqResult<()> {
        let mut capacity = needed.div_ceil(self.resize_by) * self.resize_by;
        if let Some(max) = self.max_events {
            if needed > max {
                return Err(DaqError::Storage(format!(
                    "{} is full: {needed} events exceed the {max} event cap",
                    self.path.display()
                )));
            }
            capacity = capacity.min(max);
        }
        for column in &self.columns {
            column
                .resize(capacity)
                .map_err(|e| DaqError::storage("resize column", e))?;
        }
        debug!("Columns grown from {} to {capacity}", self.capacity);
        self.capacity = capacity;
        Ok(())
    }

    /// Record the totals, trim the unused tail of the last block, flush and close.
    ///
    /// Data is durable once this returns.
    pub fn close(self) -> DaqResult<u64> {
        let Self {
            path,
            file,
            group,
            columns,
            cursor,
            long_events,
            ..
        } = self;
        for column in &columns {
            column
                .resize(cursor)
                .map_err(|e| DaqError::storage("trim column", e))?;
        }
        let num_events = cursor as u64;
        group
            .new_attr::<u64>()
            .create(ATTR_NUM_EVENTS)?
            .write_scalar(&num_events)?;
        group
            .new_attr::<u64>()
            .create(ATTR_LONG_EVENTS)?
            .write_scalar(&long_events)?;
        drop(columns);
        drop(group);
        file.flush()
            .map_err(|e| DaqError::storage("flush", e))?;
        file.close()
            .map_err(|e| DaqError::storage("close", e))?;
        info!("Closed {} with {num_events} events", path.display());
        Ok(num_events)
    }
}

/// Open or create every group along `/a/b/c`.
fn ensure_group(file: &File, dataset_path: &str) -> DaqResult<Group> {
    let mut group: Group = file.group("/")?;
    for part in dataset_path.split('/').filter(|p| !p.is_empty()) {
        group = if group.link_exists(part) {
            group.group(part)?
        } else {
            group.create_group(part)?
        };
    }
    Ok(group)
}

/// Storage consumer: append every batch until the producer hangs up, then close.
///
/// The producer only hangs up after status has left `Acquiring`, so this drains whatever it
/// pushed last. A failed append forces the session to `Stopping` and still closes the file so
/// the events written so far stay readable.
pub fn run_storage(
    rx: Receiver<Batch>,
    status: StatusCell,
    mut writer: DatasetWriter,
    interval: Duration,
    stats: Arc<SessionStats>,
) -> DaqResult<u64> {
    loop {
        match rx.recv_timeout(interval) {
            Ok(batch) => {
                if let Err(e) = writer.append(&batch.events) {
                    error!("Dataset append failed: {e}");
                    let _ = status.transition(AcqStatus::Acquiring, AcqStatus::Stopping);
                    drop(rx);
                    if let Err(close_err) = writer.close() {
                        error!("Closing after failure also failed: {close_err}");
                    }
                    return Err(e);
                }
                writer.record_long_events(batch.long_events);
                stats
                    .events_written
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
            Err(RecvTimeoutError::Timeout) => {
                if !status.is_acquiring() {
                    debug!("Storage waiting for producer to finish ({} queued)", rx.len());
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    writer.close()
}
