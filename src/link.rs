//! What the session needs from the wireless stack.
//!
//! Backends hand out plain descriptions of services and characteristics; the
//! session never touches backend types directly.

use std::{fmt, future::Future};

use bitflags::bitflags;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::LinkError;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Availability {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Unknown,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoweredOn => write!(f, "Bluetooth is powered on"),
            Self::PoweredOff => write!(f, "Bluetooth is powered off"),
            Self::Unauthorized => write!(f, "Bluetooth unauthorized"),
            Self::Unsupported => write!(f, "Bluetooth unsupported"),
            Self::Unknown => write!(f, "Bluetooth state unknown"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent<Id> {
    Availability(Availability),
    Discovered(Id),
    Disconnected(Id),
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CharProps: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const WRITE_WITHOUT_RESPONSE = 1 << 2;
        const NOTIFY = 1 << 3;
        const INDICATE = 1 << 4;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharProps,
}

impl CharacteristicInfo {
    pub fn can_notify(&self) -> bool {
        self.properties.intersects(CharProps::NOTIFY | CharProps::INDICATE)
    }

    pub fn can_write(&self) -> bool {
        self.properties
            .intersects(CharProps::WRITE | CharProps::WRITE_WITHOUT_RESPONSE)
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

impl WriteKind {
    pub fn acked(ack: bool) -> Self {
        if ack {
            Self::WithResponse
        } else {
            Self::WithoutResponse
        }
    }
}

pub type LinkEvents<Id> = BoxStream<'static, LinkEvent<Id>>;

/// Raw notification payloads from every subscribed characteristic.
pub type Frames = BoxStream<'static, Vec<u8>>;

pub trait RadioLink: Send + Sync + 'static {
    type DeviceId: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    /// Adapter and device events. Backends emit an initial
    /// [`LinkEvent::Availability`] once the radio state is known.
    fn events(&self) -> impl Future<Output = Result<LinkEvents<Self::DeviceId>, LinkError>> + Send;

    fn start_scan(&self, service: Uuid) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn stop_scan(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn connect(&self, device: &Self::DeviceId) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn disconnect(&self, device: &Self::DeviceId) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Services in the order the backend reports them.
    fn discover_services(
        &self,
        device: &Self::DeviceId,
    ) -> impl Future<Output = Result<Vec<ServiceInfo>, LinkError>> + Send;

    fn discover_characteristics(
        &self,
        device: &Self::DeviceId,
        service: &ServiceInfo,
    ) -> impl Future<Output = Result<Vec<CharacteristicInfo>, LinkError>> + Send;

    fn subscribe(
        &self,
        device: &Self::DeviceId,
        characteristic: &CharacteristicInfo,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn notifications(
        &self,
        device: &Self::DeviceId,
    ) -> impl Future<Output = Result<Frames, LinkError>> + Send;

    fn write(
        &self,
        device: &Self::DeviceId,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        kind: WriteKind,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;
}
