//! Peripheral advertise session
//!
//! IDLE → (STARTING) → ADVERTISING → IDLE. One advertisement at a time; a
//! second start while one is pending or running is rejected before any
//! platform call is made.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BleError, PlatformError, Result};
use crate::events::{dispatch_peripheral, PeripheralDelegate, PeripheralEvent};
use crate::profile::{short_uuid, BATTERY_SERVICE, DEVICE_INFORMATION_SERVICE};
use crate::radio::{RadioAdapter, RadioState, RadioStateObserver};

/// Legacy advertising PDU payload limit in bytes.
pub const LEGACY_ADVERTISEMENT_LIMIT: usize = 31;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    Medium,
    High,
}

impl TxPowerLevel {
    /// Nominal transmit power in dBm.
    pub fn dbm(self) -> i16 {
        match self {
            TxPowerLevel::UltraLow => -21,
            TxPowerLevel::Low => -15,
            TxPowerLevel::Medium => -7,
            TxPowerLevel::High => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementConfig {
    pub device_name: String,
    pub service_uuids: BTreeSet<Uuid>,
    pub tx_power: TxPowerLevel,
    pub connectable: bool,
    pub mode: AdvertiseMode,
}

impl Default for AdvertisementConfig {
    fn default() -> Self {
        Self {
            device_name: "MyDevice".to_string(),
            service_uuids: [DEVICE_INFORMATION_SERVICE, BATTERY_SERVICE]
                .into_iter()
                .collect(),
            tx_power: TxPowerLevel::High,
            connectable: true,
            mode: AdvertiseMode::LowLatency,
        }
    }
}

/// Advertisement handed to the platform, derived from an [`AdvertisementConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementPayload {
    pub local_name: String,
    pub service_uuids: Vec<Uuid>,
    pub tx_power: TxPowerLevel,
    pub connectable: bool,
    pub mode: AdvertiseMode,
}

impl AdvertisementPayload {
    pub fn from_config(config: &AdvertisementConfig) -> Self {
        Self {
            local_name: config.device_name.clone(),
            service_uuids: config.service_uuids.iter().copied().collect(),
            tx_power: config.tx_power,
            connectable: config.connectable,
            mode: config.mode,
        }
    }

    /// Encoded size of the AD structures: flags, complete local name and the
    /// 16-bit and 128-bit service UUID lists.
    pub fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.connectable {
            len += 3;
        }
        if !self.local_name.is_empty() {
            len += 2 + self.local_name.len();
        }

        let short = self
            .service_uuids
            .iter()
            .filter(|u| short_uuid(u).is_some())
            .count();
        let long = self.service_uuids.len() - short;
        if short > 0 {
            len += 2 + 2 * short;
        }
        if long > 0 {
            len += 2 + 16 * long;
        }
        len
    }
}

// ============================================================================
// PLATFORM INTERFACE
// ============================================================================

/// Platform advertiser. The start outcome arrives later through the callback;
/// implementations must not invoke it before returning.
#[cfg_attr(test, mockall::automock)]
pub trait Advertiser: Send + Sync {
    fn set_device_name(&self, name: &str) -> std::result::Result<(), PlatformError>;

    fn start_advertising(
        &self,
        payload: &AdvertisementPayload,
        callback: Arc<dyn AdvertiseCallback>,
    ) -> std::result::Result<(), PlatformError>;

    fn stop_advertising(&self) -> std::result::Result<(), PlatformError>;
}

pub trait AdvertiseCallback: Send + Sync {
    fn on_start_success(&self);

    fn on_start_failure(&self, reason: AdvertiseFailureReason);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiseFailureReason {
    AlreadyStarted,
    DataTooLarge,
    TooManyAdvertisers,
    InternalError,
    FeatureUnsupported,
}

impl AdvertiseFailureReason {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => AdvertiseFailureReason::AlreadyStarted,
            2 => AdvertiseFailureReason::DataTooLarge,
            3 => AdvertiseFailureReason::TooManyAdvertisers,
            5 => AdvertiseFailureReason::FeatureUnsupported,
            _ => AdvertiseFailureReason::InternalError,
        }
    }
}

impl fmt::Display for AdvertiseFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertiseFailureReason::AlreadyStarted => write!(f, "advertising already started"),
            AdvertiseFailureReason::DataTooLarge => write!(f, "advertisement data too large"),
            AdvertiseFailureReason::TooManyAdvertisers => write!(f, "too many advertisers"),
            AdvertiseFailureReason::InternalError => write!(f, "internal error"),
            AdvertiseFailureReason::FeatureUnsupported => write!(f, "feature unsupported"),
        }
    }
}

// ============================================================================
// STATE MANAGEMENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiseState {
    Idle,
    Starting,
    Advertising,
}

impl fmt::Display for AdvertiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertiseState::Idle => write!(f, "idle"),
            AdvertiseState::Starting => write!(f, "starting"),
            AdvertiseState::Advertising => write!(f, "advertising"),
        }
    }
}

struct AdvertiseCore {
    state: AdvertiseState,
    generation: u64,
    last_config: Option<AdvertisementConfig>,
    /// Set when power loss ended an advertisement the caller still wanted.
    interrupted: bool,
}

struct AdvertiseInner {
    adapter: RadioAdapter,
    delegate: Arc<dyn PeripheralDelegate>,
    core: Mutex<AdvertiseCore>,
}

struct AdvertiseListener {
    session: Weak<AdvertiseInner>,
    generation: u64,
}

#[derive(Clone)]
pub struct AdvertiseSession {
    inner: Arc<AdvertiseInner>,
}

impl AdvertiseSession {
    /// Create an advertise session. Fails when peripheral mode is unsupported.
    pub fn new(adapter: &RadioAdapter, delegate: Arc<dyn PeripheralDelegate>) -> Result<Self> {
        if adapter.advertiser().is_none() {
            return Err(BleError::RadioUnavailable(
                "peripheral mode not supported".to_string(),
            ));
        }

        let inner = Arc::new(AdvertiseInner {
            adapter: adapter.clone(),
            delegate,
            core: Mutex::new(AdvertiseCore {
                state: AdvertiseState::Idle,
                generation: 0,
                last_config: None,
                interrupted: false,
            }),
        });
        let observer: Arc<dyn RadioStateObserver> = inner.clone();
        adapter.subscribe(Arc::downgrade(&observer));

        Ok(Self { inner })
    }

    pub fn state(&self) -> AdvertiseState {
        self.inner.core.lock().state
    }

    pub fn last_config(&self) -> Option<AdvertisementConfig> {
        self.inner.core.lock().last_config.clone()
    }

    pub fn start(&self, config: AdvertisementConfig) -> Result<()> {
        let mut core = self.inner.core.lock();
        if core.state != AdvertiseState::Idle {
            return Err(BleError::AlreadyActive);
        }

        let advertiser = self.inner.adapter.advertiser().ok_or_else(|| {
            BleError::RadioUnavailable("advertiser unavailable".to_string())
        })?;
        advertiser.set_device_name(&config.device_name)?;

        let payload = AdvertisementPayload::from_config(&config);
        let size = payload.encoded_len();
        if size > LEGACY_ADVERTISEMENT_LIMIT {
            warn!(
                "Advertisement is {} bytes, above the {} byte legacy limit",
                size, LEGACY_ADVERTISEMENT_LIMIT
            );
        }

        core.generation += 1;
        let listener = Arc::new(AdvertiseListener {
            session: Arc::downgrade(&self.inner),
            generation: core.generation,
        });
        advertiser.start_advertising(&payload, listener)?;

        debug!("Advertising '{}' requested ({} bytes)", config.device_name, size);
        core.last_config = Some(config);
        core.interrupted = false;
        core.state = AdvertiseState::Starting;
        Ok(())
    }

    /// Stop advertising. A no-op when idle.
    pub fn stop(&self) {
        let events = self.halt();
        self.dispatch(events);
    }

    /// Stop without reporting; the caller dispatches the returned events once
    /// its own locks are released.
    pub(crate) fn halt(&self) -> Vec<PeripheralEvent> {
        {
            let mut core = self.inner.core.lock();
            if core.state == AdvertiseState::Idle {
                debug!("Advertise stop ignored while idle");
                return Vec::new();
            }

            match self.inner.adapter.advertiser() {
                Some(advertiser) => {
                    if let Err(e) = advertiser.stop_advertising() {
                        warn!("Failed to stop advertising: {}", e);
                    }
                }
                None => debug!("Advertiser gone, treating advertisement as stopped"),
            }
            core.state = AdvertiseState::Idle;
            core.interrupted = false;
        }

        info!("Advertising stopped");
        vec![PeripheralEvent::AdvertisingStopped]
    }

    pub(crate) fn dispatch(&self, events: Vec<PeripheralEvent>) {
        dispatch_peripheral(&self.inner.delegate, events);
    }

    /// Start again with the most recent configuration.
    pub fn restart(&self) -> Result<()> {
        let config = self.last_config().ok_or_else(|| {
            BleError::InvalidState("no advertisement to restart".to_string())
        })?;
        self.start(config)
    }

    /// Restart an advertisement that power loss cut short.
    ///
    /// Returns `true` when a restart was issued.
    pub fn resume(&self) -> Result<bool> {
        let interrupted = std::mem::take(&mut self.inner.core.lock().interrupted);
        if !interrupted {
            return Ok(false);
        }
        info!("Resuming interrupted advertisement");
        self.restart().map(|()| true)
    }
}

impl AdvertiseInner {
    fn start_succeeded(&self, generation: u64) {
        let stale_advertiser = {
            let mut core = self.core.lock();
            if core.generation != generation {
                return;
            }
            match core.state {
                AdvertiseState::Starting => {
                    core.state = AdvertiseState::Advertising;
                    None
                }
                AdvertiseState::Idle => self.adapter.advertiser(),
                AdvertiseState::Advertising => return,
            }
        };

        match stale_advertiser {
            None => {
                info!("Advertising started");
                dispatch_peripheral(&self.delegate, vec![PeripheralEvent::AdvertisingStarted]);
            }
            Some(advertiser) => {
                // Stopped while the start was in flight.
                debug!("Late advertise start, stopping it again");
                if let Err(e) = advertiser.stop_advertising() {
                    warn!("Failed to stop late advertisement: {}", e);
                }
            }
        }
    }

    fn start_failed(&self, generation: u64, reason: AdvertiseFailureReason) {
        {
            let mut core = self.core.lock();
            if core.generation != generation || core.state != AdvertiseState::Starting {
                return;
            }
            core.state = AdvertiseState::Idle;
        }

        warn!("Advertising failed: {}", reason);
        dispatch_peripheral(
            &self.delegate,
            vec![PeripheralEvent::AdvertisingFailed { reason }],
        );
    }
}

impl RadioStateObserver for AdvertiseInner {
    fn on_radio_state_changed(&self, state: RadioState) {
        if !state.is_powering_down() {
            return;
        }
        {
            let mut core = self.core.lock();
            if core.state == AdvertiseState::Idle {
                return;
            }
            core.state = AdvertiseState::Idle;
            core.interrupted = true;
        }

        warn!("Radio {} while advertising", state);
        dispatch_peripheral(&self.delegate, vec![PeripheralEvent::AdvertisingStopped]);
    }
}

impl AdvertiseCallback for AdvertiseListener {
    fn on_start_success(&self) {
        if let Some(session) = self.session.upgrade() {
            session.start_succeeded(self.generation);
        }
    }

    fn on_start_failure(&self, reason: AdvertiseFailureReason) {
        if let Some(session) = self.session.upgrade() {
            session.start_failed(self.generation, reason);
        }
    }
}
