use std::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::{error::PrintError, raster::PrintJob, status::NotReadyReason};

/// What the session reports to whoever is watching.
#[derive(Clone, Debug, Default)]
pub enum PrinterState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Ready(ReadyPrinter),
    Printing,
    NotReady(NotReadyReason),
    Error(Fault),
}

/// Which part of the session gave up, and so whether it will try again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Radio off or not allowed. Cleared when the radio comes back.
    Radio,
    /// Couldn't start scanning.
    Scan,
    /// Link-level connect failed; the session scans again by itself.
    Connect,
    /// No usable service or characteristic. The attempt is abandoned.
    Discovery,
    /// Writing a job failed; the session drops the link and reconnects.
    Print,
    /// `ready_timeout` ran out.
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Nothing short of a new session gets past this one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            FaultKind::Scan | FaultKind::Discovery | FaultKind::Timeout
        )
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl PrinterState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn ready_printer(&self) -> Option<&ReadyPrinter> {
        match self {
            Self::Ready(p) => Some(p),
            _ => None,
        }
    }
}

impl PartialEq for PrinterState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Disconnected, Self::Disconnected)
            | (Self::Scanning, Self::Scanning)
            | (Self::Connecting, Self::Connecting)
            | (Self::Printing, Self::Printing) => true,
            (Self::Ready(a), Self::Ready(b)) => a.epoch == b.epoch,
            (Self::NotReady(a), Self::NotReady(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for PrinterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Scanning => write!(f, "searching for printer"),
            Self::Connecting => write!(f, "connecting"),
            Self::Ready(_) => write!(f, "ready"),
            Self::Printing => write!(f, "printing"),
            Self::NotReady(reasons) => {
                let reasons: Vec<&str> = reasons
                    .iter_names()
                    .map(|(name, _)| match name {
                        "NO_PAPER" => "no paper",
                        "COVER_OPEN" => "cover open",
                        "OVERHEATED" => "too hot",
                        other => other,
                    })
                    .collect();
                write!(f, "not ready ({})", reasons.join(", "))
            }
            Self::Error(fault) => write!(f, "error: {}", fault),
        }
    }
}

pub(crate) enum Command {
    Print {
        job: PrintJob,
        epoch: u64,
        reply: oneshot::Sender<Result<(), PrintError>>,
    },
    Observe(mpsc::UnboundedSender<PrinterState>),
}

/// Proof that the printer was ready. Only the session hands these out, and one
/// stops working as soon as the session leaves that ready period.
#[derive(Clone)]
pub struct ReadyPrinter {
    commands: mpsc::WeakSender<Command>,
    epoch: u64,
}

impl ReadyPrinter {
    pub(crate) fn new(commands: mpsc::WeakSender<Command>, epoch: u64) -> Self {
        Self { commands, epoch }
    }

    /// Hand a job to the session. Rejections come back immediately and leave
    /// the session state alone.
    pub async fn print(&self, job: PrintJob) -> Result<(), PrintError> {
        let commands = self.commands.upgrade().ok_or(PrintError::SessionClosed)?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Print {
                job,
                epoch: self.epoch,
                reply,
            })
            .await
            .map_err(|_| PrintError::SessionClosed)?;
        rx.await.map_err(|_| PrintError::SessionClosed)?
    }
}

impl fmt::Debug for ReadyPrinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyPrinter")
            .field("epoch", &self.epoch)
            .finish()
    }
}
