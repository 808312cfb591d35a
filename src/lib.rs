//! Driver for Phomemo T02 style thermal printers over BLE.
//!
//! Images go through [`pipeline`] into a 384-dot [`RasterImage`], [`t02`]
//! frames that for the wire, and a [`session`] owns the connection to the
//! printer. [`ble::BleLink`] talks to real hardware; [`sim::SimulatedLink`]
//! stands in for it.

pub mod ble;
pub mod desk;
pub mod error;
pub mod link;
pub mod pipeline;
pub mod printer;
pub mod raster;
pub mod session;
pub mod sim;
pub mod status;
pub mod t02;

pub use desk::PrintDesk;
pub use error::{ImageError, LinkError, PrintError};
pub use link::RadioLink;
pub use pipeline::ConvertMode;
pub use printer::{PrinterState, ReadyPrinter};
pub use raster::{PrintJob, RasterImage};
pub use session::{SessionConfig, SessionHandle, WriteSelection};
