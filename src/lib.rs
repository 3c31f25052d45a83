//! Ingestion pipeline for a SoftGlue FPGA digitizer streaming 32-bit words over TCP.
//!
//! A poll loop reads fixed-size packets from the device, decodes them into 8-word events
//! and fans each batch out to two consumers: an HDF5 writer that must see every event and a
//! telemetry publisher that only cares about the newest one.

pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod event;
pub mod fanout;
pub mod link;
pub mod sim;
pub mod snapshot;
pub mod status;
pub mod tui;
pub mod utils;
pub mod writer;

pub use config::*;
pub use controller::*;
pub use decoder::*;
pub use error::*;
pub use event::*;
pub use fanout::*;
pub use link::{DeviceLink, LinkInterrupter};
pub use snapshot::*;
pub use status::*;
pub use utils::*;
pub use writer::*;
