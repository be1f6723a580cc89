//! Outbound events and the delegate traits that receive them.
//!
//! Sessions compute events while holding their state lock and hand them to the
//! delegate only after the lock is released, in production order. A delegate
//! may therefore call straight back into the session that notified it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::central::scan::{DiscoveredPeripheral, ScanFailureReason};
use crate::peripheral::advertise::AdvertiseFailureReason;
use crate::profile::{Capabilities, CharacteristicId, ServiceId, ServiceKind};

// ============================================================================
// CENTRAL ROLE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CentralEvent {
    ScanStarted,
    ScanFailed {
        reason: ScanFailureReason,
    },
    ScanStopped,
    PeripheralDiscovered(DiscoveredPeripheral),
    Connected {
        address: String,
    },
    Disconnected {
        address: String,
    },
    ServiceDiscoveryStarted {
        address: String,
    },
    ServiceAdded {
        id: ServiceId,
        uuid: Uuid,
        kind: ServiceKind,
    },
    CharacteristicAdded {
        id: CharacteristicId,
        uuid: Uuid,
        capabilities: Capabilities,
    },
    ServiceDiscoveryStopped {
        address: String,
        succeeded: bool,
    },
}

impl fmt::Display for CentralEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentralEvent::ScanStarted => write!(f, "scan started"),
            CentralEvent::ScanFailed { reason } => write!(f, "scan failed: {}", reason),
            CentralEvent::ScanStopped => write!(f, "scan stopped"),
            CentralEvent::PeripheralDiscovered(p) => write!(
                f,
                "discovered {} ({}) at {} dBm",
                p.name.as_deref().unwrap_or("?"),
                p.address,
                p.rssi
            ),
            CentralEvent::Connected { address } => write!(f, "connected to {}", address),
            CentralEvent::Disconnected { address } => write!(f, "disconnected from {}", address),
            CentralEvent::ServiceDiscoveryStarted { address } => {
                write!(f, "discovering services on {}", address)
            }
            CentralEvent::ServiceAdded { id, uuid, kind } => {
                write!(f, "{} {} service {}", id, kind, uuid)
            }
            CentralEvent::CharacteristicAdded {
                id,
                uuid,
                capabilities,
            } => write!(f, "{} characteristic {} [{}]", id, uuid, capabilities),
            CentralEvent::ServiceDiscoveryStopped { address, succeeded } => write!(
                f,
                "service discovery on {} {}",
                address,
                if *succeeded { "finished" } else { "aborted" }
            ),
        }
    }
}

pub trait CentralDelegate: Send + Sync {
    fn on_central_event(&self, event: CentralEvent);
}

impl CentralDelegate for mpsc::UnboundedSender<CentralEvent> {
    fn on_central_event(&self, event: CentralEvent) {
        if let Err(e) = self.send(event) {
            debug!("Central event dropped, receiver closed: {}", e.0);
        }
    }
}

// ============================================================================
// PERIPHERAL ROLE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeripheralEvent {
    AdvertisingStarted,
    AdvertisingFailed { reason: AdvertiseFailureReason },
    AdvertisingStopped,
    CentralConnected { device: String },
    CentralDisconnected { device: String },
}

impl fmt::Display for PeripheralEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralEvent::AdvertisingStarted => write!(f, "advertising started"),
            PeripheralEvent::AdvertisingFailed { reason } => {
                write!(f, "advertising failed: {}", reason)
            }
            PeripheralEvent::AdvertisingStopped => write!(f, "advertising stopped"),
            PeripheralEvent::CentralConnected { device } => {
                write!(f, "central {} connected", device)
            }
            PeripheralEvent::CentralDisconnected { device } => {
                write!(f, "central {} disconnected", device)
            }
        }
    }
}

pub trait PeripheralDelegate: Send + Sync {
    fn on_peripheral_event(&self, event: PeripheralEvent);
}

impl PeripheralDelegate for mpsc::UnboundedSender<PeripheralEvent> {
    fn on_peripheral_event(&self, event: PeripheralEvent) {
        if let Err(e) = self.send(event) {
            debug!("Peripheral event dropped, receiver closed: {}", e.0);
        }
    }
}

pub(crate) fn dispatch_central(delegate: &Arc<dyn CentralDelegate>, events: Vec<CentralEvent>) {
    for event in events {
        debug!("central event: {}", event);
        delegate.on_central_event(event);
    }
}

pub(crate) fn dispatch_peripheral(
    delegate: &Arc<dyn PeripheralDelegate>,
    events: Vec<PeripheralEvent>,
) {
    for event in events {
        debug!("peripheral event: {}", event);
        delegate.on_peripheral_event(event);
    }
}
