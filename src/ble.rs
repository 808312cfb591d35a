//! [`RadioLink`] on top of btleplug.

use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::{self, StreamExt};
use log::{debug, info, trace};
use uuid::Uuid;

use crate::{
    error::LinkError,
    link::{
        Availability, CharProps, CharacteristicInfo, Frames, LinkEvent, LinkEvents, RadioLink,
        ServiceInfo, WriteKind,
    },
};

#[derive(Debug, Clone)]
pub struct BleLink {
    central: Adapter,
    name_filter: Option<String>,
}

impl BleLink {
    /// Grab the first adapter. `name_filter` narrows discovery to devices whose
    /// advertised local name contains it.
    pub async fn new(name_filter: Option<String>) -> Result<Self, LinkError> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(LinkError::Unavailable(Availability::Unsupported))?;
        info!("using adapter {}", central.adapter_info().await?);

        Ok(Self {
            central,
            name_filter,
        })
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, LinkError> {
        Ok(self.central.peripheral(id).await?)
    }

    fn characteristic(p: &Peripheral, ch: &CharacteristicInfo) -> Result<Characteristic, LinkError> {
        p.characteristics()
            .into_iter()
            .find(|c| c.uuid == ch.uuid && c.service_uuid == ch.service_uuid)
            .ok_or(LinkError::UnknownCharacteristic(ch.uuid))
    }
}

async fn wanted(central: &Adapter, id: &PeripheralId, name_filter: Option<&str>) -> bool {
    if name_filter.is_none() {
        return true;
    }
    let props = match central.peripheral(id).await {
        Ok(p) => p.properties().await.ok().flatten(),
        Err(_) => None,
    };
    let local_name = props.and_then(|p| p.local_name);
    debug!(" = {:?}", local_name);
    name_matches(local_name.as_deref(), name_filter)
}

fn name_matches(local_name: Option<&str>, name_filter: Option<&str>) -> bool {
    match (name_filter, local_name) {
        (None, _) => true,
        (Some(search_name), Some(name)) => name.contains(search_name),
        (Some(_), None) => false,
    }
}

/// What a central event says about devices coming and going.
#[derive(Debug, PartialEq, Eq)]
enum Sighting<'a> {
    /// Advertising. btleplug only reports a device as discovered the first
    /// time it sees it; after that, including after a disconnect, it's an
    /// update. The name may also only show up in a later update.
    Seen(&'a PeripheralId),
    Gone(&'a PeripheralId),
}

impl<'a> Sighting<'a> {
    fn of(event: &'a CentralEvent) -> Option<Self> {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                Some(Self::Seen(id))
            }
            CentralEvent::DeviceDisconnected(id) => Some(Self::Gone(id)),
            _ => None,
        }
    }
}

fn char_info(c: &Characteristic) -> CharacteristicInfo {
    let mut properties = CharProps::empty();
    for (theirs, ours) in [
        (CharPropFlags::READ, CharProps::READ),
        (CharPropFlags::WRITE, CharProps::WRITE),
        (CharPropFlags::WRITE_WITHOUT_RESPONSE, CharProps::WRITE_WITHOUT_RESPONSE),
        (CharPropFlags::NOTIFY, CharProps::NOTIFY),
        (CharPropFlags::INDICATE, CharProps::INDICATE),
    ] {
        if c.properties.contains(theirs) {
            properties |= ours;
        }
    }

    CharacteristicInfo {
        uuid: c.uuid,
        service_uuid: c.service_uuid,
        properties,
    }
}

impl RadioLink for BleLink {
    type DeviceId = PeripheralId;

    async fn events(&self) -> Result<LinkEvents<PeripheralId>, LinkError> {
        let central = self.central.clone();
        let name_filter = self.name_filter.clone();
        let events = self.central.events().await?.filter_map(move |event| {
            let central = central.clone();
            let name_filter = name_filter.clone();
            async move {
                match Sighting::of(&event) {
                    Some(Sighting::Seen(id)) => {
                        trace!("{:?}", event);
                        wanted(&central, id, name_filter.as_deref())
                            .await
                            .then(|| LinkEvent::Discovered(id.clone()))
                    }
                    Some(Sighting::Gone(id)) => {
                        debug!("DeviceDisconnected {:?}", id);
                        Some(LinkEvent::Disconnected(id.clone()))
                    }
                    None => {
                        debug!("{:?}", event);
                        None
                    }
                }
            }
        });

        // having an adapter at all is as much as btleplug tells us
        let powered = stream::once(async { LinkEvent::Availability(Availability::PoweredOn) });
        Ok(powered.chain(events).boxed())
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), LinkError> {
        info!("--scanning for {}--", service);
        self.central
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.central.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device: &PeripheralId) -> Result<(), LinkError> {
        let p = self.peripheral(device).await?;
        p.connect()
            .await
            .map_err(|e| LinkError::ConnectFailed(e.to_string()))
    }

    async fn disconnect(&self, device: &PeripheralId) -> Result<(), LinkError> {
        self.peripheral(device).await?.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self, device: &PeripheralId) -> Result<Vec<ServiceInfo>, LinkError> {
        let p = self.peripheral(device).await?;
        p.discover_services().await?;
        Ok(p.services()
            .into_iter()
            .map(|s| ServiceInfo { uuid: s.uuid })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        device: &PeripheralId,
        service: &ServiceInfo,
    ) -> Result<Vec<CharacteristicInfo>, LinkError> {
        let p = self.peripheral(device).await?;
        Ok(p.services()
            .into_iter()
            .find(|s| s.uuid == service.uuid)
            .map(|s| s.characteristics.iter().map(char_info).collect())
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        device: &PeripheralId,
        characteristic: &CharacteristicInfo,
    ) -> Result<(), LinkError> {
        let p = self.peripheral(device).await?;
        let c = Self::characteristic(&p, characteristic)?;
        p.subscribe(&c).await?;
        Ok(())
    }

    async fn notifications(&self, device: &PeripheralId) -> Result<Frames, LinkError> {
        let p = self.peripheral(device).await?;
        let stream = p.notifications().await?.map(|n| {
            debug!("NOTIFY [{:?}]: {:02x?}", n.uuid, n.value);
            n.value
        });
        Ok(stream.boxed())
    }

    async fn write(
        &self,
        device: &PeripheralId,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), LinkError> {
        let p = self.peripheral(device).await?;
        let c = Self::characteristic(&p, characteristic)?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        p.write(&c, data, write_type).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_filter() {
        assert!(name_matches(None, None));
        assert!(name_matches(Some("T02"), None));
        assert!(name_matches(Some("T02_1A2B"), Some("T02")));
        assert!(!name_matches(Some("Q30"), Some("T02")));
        // no name yet; a later update may carry it
        assert!(!name_matches(None, Some("T02")));
    }

    // PeripheralId can only be built from outside btleplug on macOS
    #[cfg(target_os = "macos")]
    #[test]
    fn test_updates_count_as_sightings() {
        let id = PeripheralId::from(Uuid::from_u128(0x1812));
        let event = CentralEvent::DeviceUpdated(id.clone());
        assert_eq!(Sighting::of(&event), Some(Sighting::Seen(&id)));
        let event = CentralEvent::DeviceDiscovered(id.clone());
        assert_eq!(Sighting::of(&event), Some(Sighting::Seen(&id)));
        let event = CentralEvent::DeviceDisconnected(id.clone());
        assert_eq!(Sighting::of(&event), Some(Sighting::Gone(&id)));
        let event = CentralEvent::DeviceConnected(id);
        assert_eq!(Sighting::of(&event), None);
    }
}
