//! GATT attribute model: services, characteristics and the discovered profile tree.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BleError, Result};

// ============================================================================
// WELL-KNOWN IDENTIFIERS
// ============================================================================

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number into its full 128-bit UUID.
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Return the 16-bit assigned number if `uuid` lives on the Bluetooth base.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = !(0xffff_u128 << 96);
    if value & mask == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

pub const DEVICE_INFORMATION_SERVICE: Uuid = bluetooth_uuid(0x180a);
pub const BATTERY_SERVICE: Uuid = bluetooth_uuid(0x180f);
pub const DEVICE_NAME_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2a00);
pub const MODEL_NUMBER_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2a24);
pub const SERIAL_NUMBER_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2a25);
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2a19);

// ============================================================================
// CHARACTERISTICS
// ============================================================================

/// Access capabilities of a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const READABLE: Self = Self(0b001);
    pub const WRITABLE: Self = Self(0b010);
    pub const NOTIFIABLE: Self = Self(0b100);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = [
            (Self::READABLE, "read"),
            (Self::WRITABLE, "write"),
            (Self::NOTIFIABLE, "notify"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, label)| label)
        .collect();

        if labels.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", labels.join("|"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub capabilities: Capabilities,
}

impl Characteristic {
    pub fn new(uuid: Uuid, capabilities: Capabilities) -> Self {
        Self { uuid, capabilities }
    }
}

// ============================================================================
// SERVICES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    Primary,
    Secondary,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Primary => write!(f, "primary"),
            ServiceKind::Secondary => write!(f, "secondary"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub kind: ServiceKind,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn primary(uuid: Uuid) -> Self {
        Self {
            uuid,
            kind: ServiceKind::Primary,
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(uuid: Uuid) -> Self {
        Self {
            uuid,
            kind: ServiceKind::Secondary,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

// ============================================================================
// DISCOVERED PROFILE
// ============================================================================

/// Position of a service within a [`GattProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub u16);

/// Position of a characteristic within its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub service: ServiceId,
    pub index: u16,
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.C{}", self.service, self.index)
    }
}

/// Ordered service tree captured from a remote peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattProfile {
    services: Vec<Service>,
}

impl GattProfile {
    /// Capture a discovered tree as delivered, keeping every service instance
    /// with its own characteristics. Service `i` becomes `ServiceId(i)`.
    pub fn from_services(services: Vec<Service>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }

    /// First service carrying `uuid`.
    pub fn service_id(&self, uuid: &Uuid) -> Result<ServiceId> {
        self.services
            .iter()
            .position(|s| &s.uuid == uuid)
            .map(|index| ServiceId(index as u16))
            .ok_or(BleError::AttributeNotFound(*uuid))
    }

    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(id.0 as usize)
    }

    pub fn characteristic(&self, id: CharacteristicId) -> Option<&Characteristic> {
        self.service(id.service)?
            .characteristics
            .get(id.index as usize)
    }

    /// Every characteristic paired with its identifier, in tree order.
    pub fn entries(&self) -> impl Iterator<Item = (CharacteristicId, &Characteristic)> + '_ {
        self.services.iter().enumerate().flat_map(|(s, service)| {
            service
                .characteristics
                .iter()
                .enumerate()
                .map(move |(c, characteristic)| {
                    (
                        CharacteristicId {
                            service: ServiceId(s as u16),
                            index: c as u16,
                        },
                        characteristic,
                    )
                })
        })
    }
}
