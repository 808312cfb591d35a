//! Wire protocol for the Phomemo T02 family.

use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

use crate::raster::{PrintJob, RasterImage, ROW_BYTES};

/// The only service the scanner filters on.
pub const SERVICE_UUID: Uuid = uuid_from_u16(0x1812);

/// ESC @, ESC a 1, then the vendor "start raster" command.
pub const HEADER: [u8; 9] = [0x1b, 0x40, 0x1b, 0x61, 0x01, 0x1f, 0x11, 0x02, 0x04];

/// Feed twice, then ask for the status of everything once the paper moved.
pub const FOOTER: [u8; 18] = [
    0x1b, 0x64, 0x02, // ESC d 2
    0x1b, 0x64, 0x02, //
    0x1f, 0x11, 0x08, //
    0x1f, 0x11, 0x0e, //
    0x1f, 0x11, 0x07, //
    0x1f, 0x11, 0x09, //
];

pub const MAX_CHUNK_ROWS: u32 = 256;
pub const MARKER_LEN: usize = 8;

/// The link treats 0x0a as a line break, so it can't appear in raster data.
pub const LINE_FEED: u8 = 0x0a;
pub const LINE_FEED_SUBSTITUTE: u8 = 0x14;

/// GS v 0 with 48 bytes per line; `lines` is the row count minus one.
pub const fn marker(lines: u8) -> [u8; MARKER_LEN] {
    [0x1d, 0x76, 0x30, 0x00, 0x30, 0x00, lines, 0x00]
}

pub fn encoded_len(height: u32) -> usize {
    let chunks = height.div_ceil(MAX_CHUNK_ROWS) as usize;
    HEADER.len() + chunks * MARKER_LEN + height as usize * ROW_BYTES + FOOTER.len()
}

pub fn encode(job: PrintJob) -> Vec<u8> {
    encode_raster(job.raster())
}

pub fn encode_raster(raster: &RasterImage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(raster.height()));
    buf.extend_from_slice(&HEADER);

    let mut rows = raster.rows();
    let mut remaining = raster.height();
    while remaining > 0 {
        let lines = remaining.min(MAX_CHUNK_ROWS);
        buf.extend_from_slice(&marker((lines - 1) as u8));
        remaining -= lines;

        for row in rows.by_ref().take(lines as usize) {
            buf.extend(row.iter().map(|&b| escape(b)));
        }
    }

    buf.extend_from_slice(&FOOTER);
    buf
}

const fn escape(b: u8) -> u8 {
    if b == LINE_FEED {
        LINE_FEED_SUBSTITUTE
    } else {
        b
    }
}

/// Questions sent while waiting for the printer to speak up.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Query {
    SerialNumber,
    CompressionMode,
    Paper,
    Cover,
}

impl Query {
    /// One polling round, in send order.
    pub const CYCLE: [Query; 4] = [
        Query::SerialNumber,
        Query::CompressionMode,
        Query::Paper,
        Query::Cover,
    ];

    pub const fn bytes(self) -> &'static [u8] {
        match self {
            Query::SerialNumber => b"SSSGETSN\r\n",
            Query::CompressionMode => b"SSSGETBMAPMODE\r\n",
            Query::Paper => &[0x1f, 0x11, 0x11],
            Query::Cover => &[0x1f, 0x11, 0x12],
        }
    }

    /// The ASCII queries go out as acknowledged writes, the binary ones don't.
    pub const fn wants_ack(self) -> bool {
        matches!(self, Query::SerialNumber | Query::CompressionMode)
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        Self::CYCLE.into_iter().find(|q| q.bytes() == buf)
    }
}

/// Opcode pair carried in bytes 1..3 of a notification.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum StatusEvent {
    Overheated,
    TemperatureNormal,
    CoverOpen,
    CoverClosed,
    NoPaper,
    PaperPresent,
    CancelAcknowledged,
    PrintComplete,
    Unrecognized(u8, u8),
}

impl StatusEvent {
    /// `None` for frames too short to carry an opcode.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 3 {
            return None;
        }

        Some(match (buf[1], buf[2]) {
            (0x03, 0xa9) => Self::Overheated,
            (0x03, 0xa8) => Self::TemperatureNormal,
            (0x05, 0x99) => Self::CoverOpen,
            (0x05, 0x98) => Self::CoverClosed,
            (0x06, 0x88) => Self::NoPaper,
            (0x06, 0x89) => Self::PaperPresent,
            (0x0b, 0xb8) => Self::CancelAcknowledged,
            (0x0f, 0x0c) => Self::PrintComplete,
            (a, b) => Self::Unrecognized(a, b),
        })
    }

    /// A frame the printer would send for this event; used by the simulator.
    pub const fn frame(self) -> [u8; 3] {
        let (a, b) = match self {
            Self::Overheated => (0x03, 0xa9),
            Self::TemperatureNormal => (0x03, 0xa8),
            Self::CoverOpen => (0x05, 0x99),
            Self::CoverClosed => (0x05, 0x98),
            Self::NoPaper => (0x06, 0x88),
            Self::PaperPresent => (0x06, 0x89),
            Self::CancelAcknowledged => (0x0b, 0xb8),
            Self::PrintComplete => (0x0f, 0x0c),
            Self::Unrecognized(a, b) => (a, b),
        };
        [0x1a, a, b]
    }
}
