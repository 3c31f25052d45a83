use crate::{DaqError, DaqResult};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqStatus {
    Idle = 0,
    Acquiring = 1,
    Stopping = 2,
}

impl AcqStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Acquiring,
            2 => Self::Stopping,
            _ => Self::Idle,
        }
    }

    /// The only legal edges: Idle -> Acquiring -> Stopping -> Idle.
    pub fn can_become(self, next: AcqStatus) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Acquiring)
                | (Self::Acquiring, Self::Stopping)
                | (Self::Stopping, Self::Idle)
        )
    }
}

impl fmt::Display for AcqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Acquiring => "Acquiring",
            Self::Stopping => "Stopping",
        };
        f.write_str(name)
    }
}

type Listener = Box<dyn Fn(AcqStatus) + Send + Sync>;

/// Shared acquisition status.
///
/// Cloning shares the same cell. Writes are `SeqCst` and happen before listeners are
/// notified, so anything a listener triggers already observes the new value.
#[derive(Clone)]
pub struct StatusCell {
    value: Arc<AtomicU8>,
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self {
            value: Arc::new(AtomicU8::new(AcqStatus::Idle as u8)),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatusCell").field(&self.get()).finish()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> AcqStatus {
        AcqStatus::from_u8(self.value.load(Ordering::SeqCst))
    }

    pub fn is_acquiring(&self) -> bool {
        self.get() == AcqStatus::Acquiring
    }

    /// Register a status-write hook, called after every successful transition.
    pub fn subscribe(&self, listener: impl Fn(AcqStatus) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    /// Move `from -> to` atomically. Fails without changing anything if the edge is not
    /// legal or the current status is not `from`.
    pub fn transition(&self, from: AcqStatus, to: AcqStatus) -> DaqResult<()> {
        if !from.can_become(to) {
            return Err(DaqError::State {
                action: action_name(to),
                status: self.get(),
            });
        }
        self.value
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|current| DaqError::State {
                action: action_name(to),
                status: AcqStatus::from_u8(current),
            })?;
        self.notify(to);
        Ok(())
    }

    fn notify(&self, status: AcqStatus) {
        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.iter() {
                listener(status);
            }
        }
    }
}

fn action_name(to: AcqStatus) -> &'static str {
    match to {
        AcqStatus::Acquiring => "start",
        AcqStatus::Stopping => "stop",
        AcqStatus::Idle => "finish",
    }
}
