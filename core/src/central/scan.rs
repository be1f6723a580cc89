//! Central scan session
//!
//! Owns one radio scan at a time: IDLE → SCANNING → (STOPPING) → IDLE.
//! Sightings are deduplicated by address and by advertised name before being
//! surfaced, and every way a scan can end (confirmed stop, platform failure,
//! radio power loss) converges on a single `ScanStopped` event.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BleError, PlatformError, Result};
use crate::events::{dispatch_central, CentralDelegate, CentralEvent};
use crate::radio::{RadioAdapter, RadioState, RadioStateObserver};

// ============================================================================
// PLATFORM INTERFACE
// ============================================================================

/// Platform scanner. Results arrive later through the supplied callback;
/// implementations must not invoke it before returning.
#[cfg_attr(test, mockall::automock)]
pub trait Scanner: Send + Sync {
    fn start_scan(&self, callback: Arc<dyn ScanCallback>) -> std::result::Result<(), PlatformError>;

    fn stop_scan(&self) -> std::result::Result<(), PlatformError>;
}

pub trait ScanCallback: Send + Sync {
    fn on_device_found(&self, address: &str, name: Option<&str>, rssi: i16);

    fn on_scan_failed(&self, reason: ScanFailureReason);

    /// The platform confirmed that the scan has ended.
    fn on_scan_complete(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanFailureReason {
    AlreadyStarted,
    ApplicationRegistrationFailed,
    FeatureUnsupported,
    InternalError,
}

impl ScanFailureReason {
    /// Map a platform scan error code; unknown codes count as internal errors.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ScanFailureReason::AlreadyStarted,
            2 => ScanFailureReason::ApplicationRegistrationFailed,
            3 => ScanFailureReason::FeatureUnsupported,
            _ => ScanFailureReason::InternalError,
        }
    }
}

impl fmt::Display for ScanFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanFailureReason::AlreadyStarted => write!(f, "scan already started"),
            ScanFailureReason::ApplicationRegistrationFailed => {
                write!(f, "application registration failed")
            }
            ScanFailureReason::FeatureUnsupported => write!(f, "feature unsupported"),
            ScanFailureReason::InternalError => write!(f, "internal error"),
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Idle,
    Scanning,
    Stopping,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "idle"),
            ScanState::Scanning => write!(f, "scanning"),
            ScanState::Stopping => write!(f, "stopping"),
        }
    }
}

/// A remote peripheral seen during the current scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeripheral {
    pub address: String,
    pub name: Option<String>,
    /// Latest signal strength in dBm.
    pub rssi: i16,
}

/// Set of surfaced peripherals, first sighting wins.
#[derive(Debug, Default)]
pub(crate) struct DiscoverySet {
    entries: Vec<DiscoveredPeripheral>,
}

impl DiscoverySet {
    /// Record a sighting. Returns the entry when it is new and worth surfacing.
    pub(crate) fn record(
        &mut self,
        address: &str,
        name: Option<&str>,
        rssi: i16,
    ) -> Option<DiscoveredPeripheral> {
        if let Some(known) = self.entries.iter_mut().find(|p| p.address == address) {
            known.rssi = rssi;
            return None;
        }

        let name = name.filter(|n| !n.is_empty())?;
        if self.entries.iter().any(|p| p.name.as_deref() == Some(name)) {
            return None;
        }

        let entry = DiscoveredPeripheral {
            address: address.to_string(),
            name: Some(name.to_string()),
            rssi,
        };
        self.entries.push(entry.clone());
        Some(entry)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<DiscoveredPeripheral> {
        self.entries.clone()
    }
}

struct ScanCore {
    state: ScanState,
    generation: u64,
    discovered: DiscoverySet,
}

struct ScanInner {
    adapter: RadioAdapter,
    delegate: Arc<dyn CentralDelegate>,
    core: Mutex<ScanCore>,
}

/// Callback handed to the platform for one scan. Stale notifications from an
/// earlier scan carry an old generation and are dropped.
struct ScanListener {
    session: Weak<ScanInner>,
    generation: u64,
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Clone)]
pub struct ScanSession {
    inner: Arc<ScanInner>,
}

impl ScanSession {
    /// Create a scan session. Fails when the radio cannot provide a scanner.
    pub fn new(adapter: &RadioAdapter, delegate: Arc<dyn CentralDelegate>) -> Result<Self> {
        if adapter.scanner().is_none() {
            return Err(BleError::RadioUnavailable(
                "scanner unavailable, is Bluetooth enabled?".to_string(),
            ));
        }

        let inner = Arc::new(ScanInner {
            adapter: adapter.clone(),
            delegate,
            core: Mutex::new(ScanCore {
                state: ScanState::Idle,
                generation: 0,
                discovered: DiscoverySet::default(),
            }),
        });
        let observer: Arc<dyn RadioStateObserver> = inner.clone();
        adapter.subscribe(Arc::downgrade(&observer));

        Ok(Self { inner })
    }

    pub fn state(&self) -> ScanState {
        self.inner.core.lock().state
    }

    pub fn is_scanning(&self) -> bool {
        self.state() == ScanState::Scanning
    }

    /// Peripherals surfaced since the current (or last) scan started.
    pub fn discovered(&self) -> Vec<DiscoveredPeripheral> {
        self.inner.core.lock().discovered.snapshot()
    }

    pub fn start(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        match core.state {
            ScanState::Scanning => return Err(BleError::AlreadyActive),
            ScanState::Stopping => {
                return Err(BleError::InvalidState(
                    "scan is still stopping".to_string(),
                ))
            }
            ScanState::Idle => {}
        }

        let scanner = self.inner.adapter.scanner().ok_or_else(|| {
            BleError::RadioUnavailable("scanner unavailable".to_string())
        })?;

        core.generation += 1;
        core.discovered.clear();
        let listener = Arc::new(ScanListener {
            session: Arc::downgrade(&self.inner),
            generation: core.generation,
        });
        scanner.start_scan(listener)?;

        core.state = ScanState::Scanning;
        drop(core);

        info!("BLE scan started");
        dispatch_central(&self.inner.delegate, vec![CentralEvent::ScanStarted]);
        Ok(())
    }

    /// Request the scan to end. Completion is reported as `ScanStopped`.
    pub fn stop(&self) {
        let mut events = Vec::new();
        {
            let mut core = self.inner.core.lock();
            if core.state != ScanState::Scanning {
                debug!("Scan stop ignored while {}", core.state);
                return;
            }

            match self.inner.adapter.scanner() {
                Some(scanner) => match scanner.stop_scan() {
                    Ok(()) => core.state = ScanState::Stopping,
                    Err(e) => {
                        warn!("Scanner refused to stop, treating scan as ended: {}", e);
                        core.state = ScanState::Idle;
                        events.push(CentralEvent::ScanStopped);
                    }
                },
                None => {
                    debug!("Scanner gone, scan already ended");
                    core.state = ScanState::Idle;
                    events.push(CentralEvent::ScanStopped);
                }
            }
        }
        dispatch_central(&self.inner.delegate, events);
    }
}

impl ScanInner {
    fn is_current(&self, core: &ScanCore, generation: u64) -> bool {
        if core.generation != generation {
            debug!(
                "Dropping notification from scan #{} (current #{})",
                generation, core.generation
            );
            return false;
        }
        true
    }

    fn device_found(&self, generation: u64, address: &str, name: Option<&str>, rssi: i16) {
        let found = {
            let mut core = self.core.lock();
            if !self.is_current(&core, generation) || core.state != ScanState::Scanning {
                return;
            }
            core.discovered.record(address, name, rssi)
        };

        if let Some(peripheral) = found {
            dispatch_central(
                &self.delegate,
                vec![CentralEvent::PeripheralDiscovered(peripheral)],
            );
        }
    }

    fn scan_failed(&self, generation: u64, reason: ScanFailureReason) {
        {
            let mut core = self.core.lock();
            if !self.is_current(&core, generation) || core.state == ScanState::Idle {
                return;
            }
            core.state = ScanState::Idle;
        }

        warn!("BLE scan failed: {}", reason);
        dispatch_central(
            &self.delegate,
            vec![CentralEvent::ScanFailed { reason }, CentralEvent::ScanStopped],
        );
    }

    fn scan_complete(&self, generation: u64) {
        {
            let mut core = self.core.lock();
            if !self.is_current(&core, generation) || core.state == ScanState::Idle {
                return;
            }
            core.state = ScanState::Idle;
        }

        info!("BLE scan stopped");
        dispatch_central(&self.delegate, vec![CentralEvent::ScanStopped]);
    }
}

impl RadioStateObserver for ScanInner {
    fn on_radio_state_changed(&self, state: RadioState) {
        if !state.is_powering_down() {
            return;
        }
        {
            let mut core = self.core.lock();
            if core.state == ScanState::Idle {
                return;
            }
            core.state = ScanState::Idle;
        }

        warn!("Radio {} during scan, scan ended", state);
        dispatch_central(&self.delegate, vec![CentralEvent::ScanStopped]);
    }
}

impl ScanCallback for ScanListener {
    fn on_device_found(&self, address: &str, name: Option<&str>, rssi: i16) {
        if let Some(session) = self.session.upgrade() {
            session.device_found(self.generation, address, name, rssi);
        }
    }

    fn on_scan_failed(&self, reason: ScanFailureReason) {
        if let Some(session) = self.session.upgrade() {
            session.scan_failed(self.generation, reason);
        }
    }

    fn on_scan_complete(&self) {
        if let Some(session) = self.session.upgrade() {
            session.scan_complete(self.generation);
        }
    }
}
