//! Radio adapter: access to the platform radio and its power state.
//!
//! The platform owns the radio. The core never switches it on or off; it only
//! reads the current [`RadioState`], borrows the role entry points (scanner,
//! connector, advertiser, GATT server) and fans state changes out to the
//! sessions that registered as [`RadioStateObserver`]s.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::central::connection::GattConnector;
use crate::central::scan::Scanner;
use crate::error::{BleError, Result};
use crate::peripheral::advertise::Advertiser;
use crate::peripheral::server::GattServerPlatform;

// ============================================================================
// STATE
// ============================================================================

/// Power state reported by the platform radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    Off,
    TurningOn,
    On,
    TurningOff,
}

impl RadioState {
    pub fn is_on(self) -> bool {
        self == RadioState::On
    }

    /// True once the radio can no longer carry scans, links or advertisements.
    pub fn is_powering_down(self) -> bool {
        matches!(self, RadioState::Off | RadioState::TurningOff)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Off => write!(f, "off"),
            RadioState::TurningOn => write!(f, "turning on"),
            RadioState::On => write!(f, "on"),
            RadioState::TurningOff => write!(f, "turning off"),
        }
    }
}

/// Outcome code attached to link notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    Failure(i32),
}

impl GattStatus {
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            GattStatus::Success
        } else {
            GattStatus::Failure(code)
        }
    }

    pub fn is_success(self) -> bool {
        self == GattStatus::Success
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Success => write!(f, "success"),
            GattStatus::Failure(code) => write!(f, "failure ({})", code),
        }
    }
}

/// Link-layer state carried by connection notifications on both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

// ============================================================================
// PLATFORM TRAITS
// ============================================================================

/// Platform radio abstraction.
///
/// Role accessors return `None` when the radio cannot currently provide that
/// role, typically because it is powered off.
pub trait RadioPlatform: Send + Sync {
    fn is_low_energy_supported(&self) -> bool;

    fn state(&self) -> RadioState;

    fn scanner(&self) -> Option<Arc<dyn Scanner>>;

    fn gatt_connector(&self) -> Option<Arc<dyn GattConnector>>;

    fn advertiser(&self) -> Option<Arc<dyn Advertiser>>;

    fn gatt_server(&self) -> Option<Arc<dyn GattServerPlatform>>;

    /// Register the adapter for power-state notifications.
    fn watch_state(&self, _observer: Weak<dyn RadioStateObserver>) {}
}

pub trait RadioStateObserver: Send + Sync {
    fn on_radio_state_changed(&self, state: RadioState);
}

// ============================================================================
// ADAPTER
// ============================================================================

struct AdapterInner {
    platform: Arc<dyn RadioPlatform>,
    observers: Mutex<Vec<Weak<dyn RadioStateObserver>>>,
}

impl AdapterInner {
    fn fan_out(&self, state: RadioState) {
        let live: Vec<Arc<dyn RadioStateObserver>> = {
            let mut observers = self.observers.lock();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };

        info!("Radio state changed: {} ({} observers)", state, live.len());
        for observer in live {
            observer.on_radio_state_changed(state);
        }
    }
}

impl RadioStateObserver for AdapterInner {
    fn on_radio_state_changed(&self, state: RadioState) {
        self.fan_out(state);
    }
}

/// Shared handle to the platform radio.
#[derive(Clone)]
pub struct RadioAdapter {
    inner: Arc<AdapterInner>,
}

impl RadioAdapter {
    /// Wrap a platform radio. Fails when it lacks Bluetooth Low Energy support.
    pub fn new(platform: Arc<dyn RadioPlatform>) -> Result<Self> {
        if !platform.is_low_energy_supported() {
            return Err(BleError::RadioUnavailable(
                "Bluetooth Low Energy not supported".to_string(),
            ));
        }

        let inner = Arc::new(AdapterInner {
            platform,
            observers: Mutex::new(Vec::new()),
        });
        let as_observer: Arc<dyn RadioStateObserver> = inner.clone();
        inner.platform.watch_state(Arc::downgrade(&as_observer));

        debug!("Radio adapter ready, state {}", inner.platform.state());
        Ok(Self { inner })
    }

    pub fn state(&self) -> RadioState {
        self.inner.platform.state()
    }

    pub fn is_enabled(&self) -> bool {
        self.state().is_on()
    }

    pub fn scanner(&self) -> Option<Arc<dyn Scanner>> {
        self.inner.platform.scanner()
    }

    pub fn gatt_connector(&self) -> Option<Arc<dyn GattConnector>> {
        self.inner.platform.gatt_connector()
    }

    pub fn advertiser(&self) -> Option<Arc<dyn Advertiser>> {
        self.inner.platform.advertiser()
    }

    pub fn gatt_server(&self) -> Option<Arc<dyn GattServerPlatform>> {
        self.inner.platform.gatt_server()
    }

    /// Add an observer. Observers are held weakly and pruned once dropped.
    pub fn subscribe(&self, observer: Weak<dyn RadioStateObserver>) {
        self.inner.observers.lock().push(observer);
    }

    /// Entry point for platform power-state notifications.
    pub fn on_radio_state_changed(&self, state: RadioState) {
        self.inner.fan_out(state);
    }
}

impl fmt::Debug for RadioAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadioAdapter")
            .field("state", &self.state())
            .finish()
    }
}
