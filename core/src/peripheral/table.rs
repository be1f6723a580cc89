//! Local attribute table served by the GATT server.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{BleError, PlatformError, Result};
use crate::profile::{
    Capabilities, Characteristic, Service, BATTERY_LEVEL_CHARACTERISTIC, BATTERY_SERVICE,
    DEVICE_INFORMATION_SERVICE, DEVICE_NAME_CHARACTERISTIC, MODEL_NUMBER_CHARACTERISTIC,
    SERIAL_NUMBER_CHARACTERISTIC,
};

pub type SharedAttributeTable = Arc<RwLock<AttributeTable>>;

/// Services with their characteristic values, keyed by (service, characteristic).
#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    services: Vec<Service>,
    values: HashMap<(Uuid, Uuid), Vec<u8>>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device Information (name, model, serial) and Battery Level services.
    pub fn device_profile(name: &str, model: &str, serial: &str) -> Self {
        let read = Capabilities::READABLE;
        let mut table = Self::new();
        table.add_service(
            Service::primary(DEVICE_INFORMATION_SERVICE)
                .with_characteristic(Characteristic::new(DEVICE_NAME_CHARACTERISTIC, read))
                .with_characteristic(Characteristic::new(MODEL_NUMBER_CHARACTERISTIC, read))
                .with_characteristic(Characteristic::new(SERIAL_NUMBER_CHARACTERISTIC, read)),
        );
        table.add_service(Service::primary(BATTERY_SERVICE).with_characteristic(
            Characteristic::new(BATTERY_LEVEL_CHARACTERISTIC, read | Capabilities::NOTIFIABLE),
        ));

        let info = [
            (DEVICE_NAME_CHARACTERISTIC, name),
            (MODEL_NUMBER_CHARACTERISTIC, model),
            (SERIAL_NUMBER_CHARACTERISTIC, serial),
        ];
        for (characteristic, text) in info {
            table
                .values
                .insert((DEVICE_INFORMATION_SERVICE, characteristic), text.as_bytes().to_vec());
        }
        table
            .values
            .insert((BATTERY_SERVICE, BATTERY_LEVEL_CHARACTERISTIC), vec![0]);
        table
    }

    pub fn add_service(&mut self, service: Service) {
        self.services.push(service);
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Result<&Characteristic> {
        let owner = self
            .services
            .iter()
            .find(|s| &s.uuid == service)
            .ok_or(BleError::AttributeNotFound(*service))?;
        owner
            .characteristic(characteristic)
            .ok_or(BleError::AttributeNotFound(*characteristic))
    }

    pub fn set_value(&mut self, service: &Uuid, characteristic: &Uuid, value: Vec<u8>) -> Result<()> {
        self.characteristic(service, characteristic)?;
        self.values.insert((*service, *characteristic), value);
        Ok(())
    }

    /// Value of a readable characteristic; empty when never set.
    pub fn read(&self, service: &Uuid, characteristic: &Uuid) -> Result<Vec<u8>> {
        let entry = self.characteristic(service, characteristic)?;
        if !entry.capabilities.contains(Capabilities::READABLE) {
            return Err(BleError::InvalidState(format!(
                "characteristic {} is not readable",
                characteristic
            )));
        }
        Ok(self
            .values
            .get(&(*service, *characteristic))
            .cloned()
            .unwrap_or_default())
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.values
            .get(&(BATTERY_SERVICE, BATTERY_LEVEL_CHARACTERISTIC))
            .and_then(|v| v.first().copied())
    }

    /// Store a battery percentage, clamped to 100.
    pub fn set_battery_level(&mut self, percent: u8) -> Result<()> {
        self.set_value(
            &BATTERY_SERVICE,
            &BATTERY_LEVEL_CHARACTERISTIC,
            vec![percent.min(100)],
        )
    }
}

/// Where the periodic battery refresh reads its percentage from.
#[async_trait]
pub trait BatterySource: Send + Sync {
    async fn battery_level(&self) -> std::result::Result<u8, PlatformError>;
}

/// Constant battery reading, for hosts without a battery.
#[derive(Debug, Clone, Copy)]
pub struct FixedBatteryLevel(pub u8);

#[async_trait]
impl BatterySource for FixedBatteryLevel {
    async fn battery_level(&self) -> std::result::Result<u8, PlatformError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_profile_layout() {
        let table = AttributeTable::device_profile("MyDevice", "1AB2", "1234");
        let uuids: Vec<_> = table.services().iter().map(|s| s.uuid).collect();
        assert_eq!(uuids, vec![DEVICE_INFORMATION_SERVICE, BATTERY_SERVICE]);
        assert_eq!(table.services()[0].characteristics.len(), 3);

        assert_eq!(
            table
                .read(&DEVICE_INFORMATION_SERVICE, &MODEL_NUMBER_CHARACTERISTIC)
                .expect("readable"),
            b"1AB2".to_vec()
        );
        assert_eq!(
            table
                .read(&DEVICE_INFORMATION_SERVICE, &SERIAL_NUMBER_CHARACTERISTIC)
                .expect("readable"),
            b"1234".to_vec()
        );
        assert_eq!(table.battery_level(), Some(0));
    }

    #[test]
    fn test_unknown_attribute() {
        let table = AttributeTable::device_profile("MyDevice", "1AB2", "1234");
        let missing = Uuid::from_u128(7);
        assert_eq!(
            table.read(&missing, &DEVICE_NAME_CHARACTERISTIC),
            Err(BleError::AttributeNotFound(missing))
        );
        assert_eq!(
            table.read(&BATTERY_SERVICE, &DEVICE_NAME_CHARACTERISTIC),
            Err(BleError::AttributeNotFound(DEVICE_NAME_CHARACTERISTIC))
        );
    }

    #[test]
    fn test_write_only_characteristic_is_not_readable() {
        let control = Uuid::from_u128(0xc0);
        let command = Uuid::from_u128(0xc1);
        let mut table = AttributeTable::new();
        table.add_service(
            Service::primary(control)
                .with_characteristic(Characteristic::new(command, Capabilities::WRITABLE)),
        );
        table.set_value(&control, &command, vec![1]).expect("known");

        assert!(matches!(
            table.read(&control, &command),
            Err(BleError::InvalidState(_))
        ));
    }

    #[test]
    fn test_battery_level_is_clamped() {
        let mut table = AttributeTable::device_profile("MyDevice", "1AB2", "1234");
        table.set_battery_level(250).expect("battery service present");
        assert_eq!(table.battery_level(), Some(100));

        let mut bare = AttributeTable::new();
        assert!(bare.set_battery_level(50).is_err());
    }

    #[tokio::test]
    async fn test_fixed_battery_source() {
        let source = FixedBatteryLevel(87);
        assert_eq!(source.battery_level().await, Ok(87));
    }
}
