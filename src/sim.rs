//! An in-memory printer behind [`RadioLink`], for running without hardware.
//!
//! It advertises one device, answers the readiness queries the way the T02
//! firmware does, and collects each print stream from header to footer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use btleplug::api::bleuuid::uuid_from_u16;
use futures::{stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::LinkError,
    link::{
        Availability, CharProps, CharacteristicInfo, Frames, LinkEvent, LinkEvents, RadioLink,
        ServiceInfo, WriteKind,
    },
    raster::ROW_BYTES,
    t02::{self, Query, StatusEvent},
};

pub type SimDevice = u32;

pub const SIM_DEVICE: SimDevice = 2;

/// What the printer sends in reply to a serial number query. Not an opcode the
/// status table knows about.
pub const SERIAL_FRAME: [u8; 3] = [0x1a, 0x04, 0x5a];

#[derive(Clone, Debug)]
pub struct SimService {
    pub info: ServiceInfo,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl SimService {
    pub fn new(uuid: Uuid, characteristics: &[(u16, CharProps)]) -> Self {
        Self {
            info: ServiceInfo { uuid },
            characteristics: characteristics
                .iter()
                .map(|&(id, properties)| CharacteristicInfo {
                    uuid: uuid_from_u16(id),
                    service_uuid: uuid,
                    properties,
                })
                .collect(),
        }
    }

    /// FF00 with notify on FF01/FF03 and the command endpoint at FF02.
    pub fn t02() -> Self {
        Self::new(
            uuid_from_u16(0xff00),
            &[
                (0xff01, CharProps::READ | CharProps::NOTIFY),
                (0xff02, CharProps::WRITE | CharProps::WRITE_WITHOUT_RESPONSE),
                (0xff03, CharProps::NOTIFY),
            ],
        )
    }
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub availability: Availability,
    /// Show up in scans for this service.
    pub advertises: Option<Uuid>,
    pub services: Vec<SimService>,
    pub paper: bool,
    pub cover_closed: bool,
    pub overheated: bool,
    /// Refuse this many connection attempts before accepting one.
    pub refuse_connects: u32,
    /// Answer polling queries at all.
    pub responsive: bool,
    /// Send the print-complete opcode after a full job.
    pub completes_prints: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            availability: Availability::PoweredOn,
            advertises: Some(t02::SERVICE_UUID),
            services: vec![SimService::t02()],
            paper: true,
            cover_closed: true,
            overheated: false,
            refuse_connects: 0,
            responsive: true,
            completes_prints: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimWrite {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub kind: WriteKind,
}

struct Inner {
    config: SimConfig,
    events: mpsc::UnboundedSender<LinkEvent<SimDevice>>,
    events_rx: Option<mpsc::UnboundedReceiver<LinkEvent<SimDevice>>>,
    frames: Option<mpsc::UnboundedSender<Vec<u8>>>,
    connected: bool,
    connects: usize,
    subscribed: Vec<Uuid>,
    writes: Vec<SimWrite>,
    job: Option<Vec<u8>>,
    printed: Vec<Vec<u8>>,
}

impl Inner {
    fn emit(&self, event: LinkEvent<SimDevice>) {
        let _ = self.events.send(event);
    }

    fn notify(&self, frame: &[u8]) -> bool {
        if self.subscribed.is_empty() {
            return false;
        }
        match &self.frames {
            Some(tx) => tx.send(frame.to_vec()).is_ok(),
            None => false,
        }
    }

    fn sever(&mut self) {
        self.connected = false;
        self.frames = None;
        self.subscribed.clear();
        self.job = None;
    }

    fn check_device(&self, device: &SimDevice) -> Result<(), LinkError> {
        if *device != SIM_DEVICE || !self.connected {
            return Err(LinkError::UnknownDevice(device.to_string()));
        }
        Ok(())
    }

    fn receive(&mut self, data: &[u8]) {
        if self.job.is_none() && data.starts_with(&t02::HEADER) {
            debug!("sim: print stream started");
            self.job = Some(vec![]);
        }

        if let Some(job) = &mut self.job {
            job.extend_from_slice(data);
            let Some(end) = job_len(job) else {
                return;
            };
            let mut job = std::mem::take(job);
            self.job = None;
            if job.len() > end {
                debug!("sim: dropping {} bytes after footer", job.len() - end);
                job.truncate(end);
            }
            if !job.ends_with(&t02::FOOTER) {
                warn!("sim: job doesn't end in the expected footer");
            }
            info!("sim: received {} byte print job", job.len());
            self.printed.push(job);
            if self.config.completes_prints {
                self.notify(&StatusEvent::PrintComplete.frame());
            }
            return;
        }

        if !self.config.responsive {
            return;
        }
        let reply = match Query::from_bytes(data) {
            Some(Query::SerialNumber) if self.config.overheated => StatusEvent::Overheated.frame(),
            Some(Query::SerialNumber) => SERIAL_FRAME,
            Some(Query::Paper) if self.config.paper => StatusEvent::PaperPresent.frame(),
            Some(Query::Paper) => StatusEvent::NoPaper.frame(),
            Some(Query::Cover) if self.config.cover_closed => StatusEvent::CoverClosed.frame(),
            Some(Query::Cover) => StatusEvent::CoverOpen.frame(),
            Some(Query::CompressionMode) => return,
            None => {
                debug!("sim: ignoring write {:02x?}", data);
                return;
            }
        };
        self.notify(&reply);
    }
}

/// Length of a job once all of it has arrived. Walks the chunk markers, so
/// raster rows that look like a footer don't end the job early.
fn job_len(buf: &[u8]) -> Option<usize> {
    let mut i = t02::HEADER.len();
    loop {
        match buf.get(i)? {
            &MARKER_START => {
                let lines = *buf.get(i + 6)? as usize + 1;
                i += t02::MARKER_LEN + lines * ROW_BYTES;
            }
            _ => {
                let end = i + t02::FOOTER.len();
                return (buf.len() >= end).then_some(end);
            }
        }
    }
}

const MARKER_START: u8 = t02::marker(0)[0];

pub struct SimulatedLink {
    inner: Arc<Mutex<Inner>>,
}

/// Pokes at a [`SimulatedLink`] after it's been handed to a session.
#[derive(Clone)]
pub struct SimControl {
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedLink {
    pub fn new(config: SimConfig) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let _ = events.send(LinkEvent::Availability(config.availability));
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                events,
                events_rx: Some(events_rx),
                frames: None,
                connected: false,
                connects: 0,
                subscribed: vec![],
                writes: vec![],
                job: None,
                printed: vec![],
            })),
        }
    }

    pub fn control(&self) -> SimControl {
        SimControl {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimControl {
    /// Deliver an unsolicited notification. False if nobody is subscribed.
    pub fn push_frame(&self, frame: &[u8]) -> bool {
        lock(&self.inner).notify(frame)
    }

    pub fn set_paper(&self, present: bool) {
        let mut inner = lock(&self.inner);
        inner.config.paper = present;
        let event = if present {
            StatusEvent::PaperPresent
        } else {
            StatusEvent::NoPaper
        };
        inner.notify(&event.frame());
    }

    pub fn set_cover(&self, closed: bool) {
        let mut inner = lock(&self.inner);
        inner.config.cover_closed = closed;
        let event = if closed {
            StatusEvent::CoverClosed
        } else {
            StatusEvent::CoverOpen
        };
        inner.notify(&event.frame());
    }

    /// Anything but `PoweredOn` silently takes the connection down with it.
    pub fn set_availability(&self, availability: Availability) {
        let mut inner = lock(&self.inner);
        inner.config.availability = availability;
        if availability != Availability::PoweredOn {
            inner.sever();
        }
        inner.emit(LinkEvent::Availability(availability));
    }

    /// The printer walks away: link drops, pending job is lost.
    pub fn drop_link(&self) {
        let mut inner = lock(&self.inner);
        if inner.connected {
            inner.sever();
            inner.emit(LinkEvent::Disconnected(SIM_DEVICE));
        }
    }

    pub fn connected(&self) -> bool {
        lock(&self.inner).connected
    }

    pub fn connects(&self) -> usize {
        lock(&self.inner).connects
    }

    pub fn subscribed(&self) -> Vec<Uuid> {
        lock(&self.inner).subscribed.clone()
    }

    pub fn writes(&self) -> Vec<SimWrite> {
        lock(&self.inner).writes.clone()
    }

    /// Complete jobs received so far, header to footer.
    pub fn printed(&self) -> Vec<Vec<u8>> {
        lock(&self.inner).printed.clone()
    }
}

impl RadioLink for SimulatedLink {
    type DeviceId = SimDevice;

    async fn events(&self) -> Result<LinkEvents<SimDevice>, LinkError> {
        let rx = lock(&self.inner)
            .events_rx
            .take()
            .ok_or(LinkError::EventsTaken)?;
        let events = stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        });
        Ok(events.boxed())
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), LinkError> {
        let inner = lock(&self.inner);
        if inner.config.availability != Availability::PoweredOn {
            return Err(LinkError::Unavailable(inner.config.availability));
        }
        if inner.config.advertises == Some(service) && !inner.connected {
            inner.emit(LinkEvent::Discovered(SIM_DEVICE));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn connect(&self, device: &SimDevice) -> Result<(), LinkError> {
        let mut inner = lock(&self.inner);
        if *device != SIM_DEVICE {
            return Err(LinkError::UnknownDevice(device.to_string()));
        }
        if inner.config.refuse_connects > 0 {
            inner.config.refuse_connects -= 1;
            return Err(LinkError::ConnectFailed("simulated refusal".into()));
        }
        inner.connected = true;
        inner.connects += 1;
        Ok(())
    }

    async fn disconnect(&self, device: &SimDevice) -> Result<(), LinkError> {
        let mut inner = lock(&self.inner);
        inner.check_device(device)?;
        inner.sever();
        inner.emit(LinkEvent::Disconnected(SIM_DEVICE));
        Ok(())
    }

    async fn discover_services(&self, device: &SimDevice) -> Result<Vec<ServiceInfo>, LinkError> {
        let inner = lock(&self.inner);
        inner.check_device(device)?;
        Ok(inner.config.services.iter().map(|s| s.info.clone()).collect())
    }

    async fn discover_characteristics(
        &self,
        device: &SimDevice,
        service: &ServiceInfo,
    ) -> Result<Vec<CharacteristicInfo>, LinkError> {
        let inner = lock(&self.inner);
        inner.check_device(device)?;
        Ok(inner
            .config
            .services
            .iter()
            .find(|s| s.info == *service)
            .map(|s| s.characteristics.clone())
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        device: &SimDevice,
        characteristic: &CharacteristicInfo,
    ) -> Result<(), LinkError> {
        let mut inner = lock(&self.inner);
        inner.check_device(device)?;
        if !characteristic.can_notify() {
            return Err(LinkError::UnknownCharacteristic(characteristic.uuid));
        }
        inner.subscribed.push(characteristic.uuid);
        Ok(())
    }

    async fn notifications(&self, device: &SimDevice) -> Result<Frames, LinkError> {
        let mut inner = lock(&self.inner);
        inner.check_device(device)?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.frames = Some(tx);
        let frames = stream::unfold(rx, |mut rx| async move {
            let frame = rx.recv().await?;
            Some((frame, rx))
        });
        Ok(frames.boxed())
    }

    async fn write(
        &self,
        device: &SimDevice,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), LinkError> {
        let mut inner = lock(&self.inner);
        inner.check_device(device)?;
        if !characteristic.can_write() {
            return Err(LinkError::UnknownCharacteristic(characteristic.uuid));
        }
        inner.writes.push(SimWrite {
            characteristic: characteristic.uuid,
            data: data.to_vec(),
            kind,
        });
        inner.receive(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::RasterImage;

    fn write_target() -> CharacteristicInfo {
        SimService::t02().characteristics[1].clone()
    }

    async fn connected(config: SimConfig) -> (SimulatedLink, Frames) {
        let link = SimulatedLink::new(config);
        link.connect(&SIM_DEVICE).await.unwrap();
        let frames = link.notifications(&SIM_DEVICE).await.unwrap();
        for c in SimService::t02().characteristics.iter().filter(|c| c.can_notify()) {
            link.subscribe(&SIM_DEVICE, c).await.unwrap();
        }
        (link, frames)
    }

    #[tokio::test]
    async fn test_answers_queries() {
        let (link, mut frames) = connected(SimConfig {
            cover_closed: false,
            ..SimConfig::default()
        })
        .await;
        let target = write_target();

        for query in Query::CYCLE {
            let kind = WriteKind::acked(query.wants_ack());
            link.write(&SIM_DEVICE, &target, query.bytes(), kind).await.unwrap();
        }
        assert_eq!(frames.next().await, Some(SERIAL_FRAME.to_vec()));
        assert_eq!(frames.next().await, Some(StatusEvent::PaperPresent.frame().to_vec()));
        assert_eq!(frames.next().await, Some(StatusEvent::CoverOpen.frame().to_vec()));
    }

    #[tokio::test]
    async fn test_collects_job() {
        let (link, mut frames) = connected(SimConfig::default()).await;
        let control = link.control();
        let target = write_target();

        let data = t02::encode_raster(&RasterImage::blank(300));
        for chunk in data.chunks(100) {
            link.write(&SIM_DEVICE, &target, chunk, WriteKind::WithoutResponse)
                .await
                .unwrap();
        }
        assert_eq!(control.printed(), vec![data]);
        assert_eq!(frames.next().await, Some(StatusEvent::PrintComplete.frame().to_vec()));
    }

    #[tokio::test]
    async fn test_footer_lookalike_rows() {
        let (link, _frames) = connected(SimConfig::default()).await;
        let control = link.control();
        let target = write_target();

        let mut row = [0u8; ROW_BYTES];
        row[ROW_BYTES - t02::FOOTER.len()..].copy_from_slice(&t02::FOOTER);
        let mut raster = RasterImage::with_capacity(2);
        raster.push_row(&row);
        raster.push_row(&row);
        let data = t02::encode_raster(&raster);

        // first write ends right after a row that reads like a footer
        let split = t02::HEADER.len() + t02::MARKER_LEN + ROW_BYTES;
        assert!(data[..split].ends_with(&t02::FOOTER));
        link.write(&SIM_DEVICE, &target, &data[..split], WriteKind::WithoutResponse)
            .await
            .unwrap();
        assert!(control.printed().is_empty());

        link.write(&SIM_DEVICE, &target, &data[split..], WriteKind::WithoutResponse)
            .await
            .unwrap();
        assert_eq!(control.printed(), vec![data]);
    }

    #[tokio::test]
    async fn test_refuses_unknown_and_disconnected() {
        let link = SimulatedLink::default();
        let target = write_target();
        assert!(link.connect(&7).await.is_err());
        assert!(link
            .write(&SIM_DEVICE, &target, b"x", WriteKind::WithResponse)
            .await
            .is_err());

        link.connect(&SIM_DEVICE).await.unwrap();
        link.control().set_availability(Availability::PoweredOff);
        assert!(!link.control().connected());
        assert!(link.start_scan(t02::SERVICE_UUID).await.is_err());
    }
}
