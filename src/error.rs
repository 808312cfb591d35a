//! Error types shared across the crate.

use thiserror::Error;

use crate::{link::Availability, printer::Fault};

/// Failure while turning a bitmap into a printable raster.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("couldn't decode image")]
    Decode(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("image has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },

    /// Scaling to the print head width would leave no rows.
    #[error("scaled image would be {width}x{height}")]
    Degenerate { width: u32, height: u32 },
}

/// Failure reported by a radio link backend.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("radio link unavailable: {0:?}")]
    Unavailable(Availability),

    #[error("no such device: {0}")]
    UnknownDevice(String),

    #[error("characteristic {0} not found on device")]
    UnknownCharacteristic(uuid::Uuid),

    #[error("connection refused: {0}")]
    ConnectFailed(String),

    #[error("link event stream already taken")]
    EventsTaken,

    #[error(transparent)]
    Ble(#[from] btleplug::Error),
}

/// Why a print request was turned down. Rejections never change session state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrintError {
    #[error("printer is not ready")]
    NotReady,

    #[error("a print is already in flight")]
    Busy,

    /// The capability was minted for an earlier ready period.
    #[error("printer handle is stale")]
    Stale,

    #[error("session has shut down")]
    SessionClosed,

    /// The session hit a fault it won't recover from by itself.
    #[error("printer unusable: {0}")]
    Faulted(Fault),
}
