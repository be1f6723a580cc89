// BLE Link Core: Central and Peripheral lifecycles
//
// Whatever the radio does between our calls, including power loss and late
// callbacks, every session lands in a defined state.

pub mod central;
pub mod config;
pub mod error;
pub mod events;
pub mod peripheral;
pub mod profile;
pub mod radio;
pub mod sim;

#[cfg(test)]
mod testing;

pub use central::{
    Central, ConnectionSession, ConnectionState, DiscoveredPeripheral, ScanSession, ScanState,
};
pub use config::{ConfigError, PeripheralConfig, ScanConfig};
pub use error::{BleError, PlatformError, Result};
pub use events::{CentralDelegate, CentralEvent, PeripheralDelegate, PeripheralEvent};
pub use peripheral::{
    AdvertiseSession, AdvertiseState, AdvertisementConfig, AttributeTable, BatterySource,
    FixedBatteryLevel, GattServerSession, Peripheral, SharedAttributeTable,
};
pub use profile::{
    Capabilities, Characteristic, CharacteristicId, GattProfile, Service, ServiceId, ServiceKind,
};
pub use radio::{GattStatus, LinkState, RadioAdapter, RadioPlatform, RadioState};
