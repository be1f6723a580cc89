//! Central role: scanning for peripherals and inspecting them over GATT.

pub mod connection;
pub mod scan;

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{BleError, Result};
use crate::events::{CentralDelegate, CentralEvent};
use crate::radio::RadioAdapter;
use connection::WeakConnectionSession;

pub use connection::{ConnectionSession, ConnectionState};
pub use scan::{DiscoveredPeripheral, ScanSession, ScanState};

/// Sits between the sessions and the caller's delegate so a connect requested
/// mid-scan can be issued once the scan has really stopped.
struct CentralRelay {
    downstream: Arc<dyn CentralDelegate>,
    pending_connect: Mutex<Option<String>>,
    connection: OnceLock<WeakConnectionSession>,
}

impl CentralDelegate for CentralRelay {
    fn on_central_event(&self, event: CentralEvent) {
        let scan_ended = event == CentralEvent::ScanStopped;
        self.downstream.on_central_event(event);
        if !scan_ended {
            return;
        }

        let Some(address) = self.pending_connect.lock().take() else {
            return;
        };
        let Some(connection) = self
            .connection
            .get()
            .and_then(WeakConnectionSession::upgrade)
        else {
            return;
        };
        info!("Scan stopped, connecting to {}", address);
        if let Err(e) = connection.connect(&address) {
            warn!("Deferred connect to {} failed: {}", address, e);
        }
    }
}

/// Scan and connection sessions sharing one radio.
pub struct Central {
    scan: ScanSession,
    connection: ConnectionSession,
    relay: Arc<CentralRelay>,
}

impl Central {
    pub fn new(adapter: &RadioAdapter, delegate: Arc<dyn CentralDelegate>) -> Result<Self> {
        let relay = Arc::new(CentralRelay {
            downstream: delegate,
            pending_connect: Mutex::new(None),
            connection: OnceLock::new(),
        });
        let scan = ScanSession::new(adapter, relay.clone())?;
        let connection = ConnectionSession::new(adapter, relay.clone())?;
        relay.connection.get_or_init(|| connection.downgrade());

        Ok(Self {
            scan,
            connection,
            relay,
        })
    }

    pub fn scan(&self) -> &ScanSession {
        &self.scan
    }

    pub fn connection(&self) -> &ConnectionSession {
        &self.connection
    }

    pub fn start_scan(&self) -> Result<()> {
        self.scan.start()
    }

    pub fn stop_scan(&self) {
        self.scan.stop();
    }

    pub fn discovered(&self) -> Vec<DiscoveredPeripheral> {
        self.scan.discovered()
    }

    /// Connect to `address`, stopping an active scan first.
    ///
    /// While a scan is running the request is parked and issued when the scan
    /// reports `ScanStopped`.
    pub fn connect(&self, address: &str) -> Result<()> {
        let state = self.connection.state();
        if state != ConnectionState::Disconnected {
            return Err(BleError::InvalidState(format!(
                "cannot connect to {} while {}",
                address, state
            )));
        }

        match self.scan.state() {
            ScanState::Idle => self.connection.connect(address),
            ScanState::Scanning | ScanState::Stopping => {
                info!("Deferring connect to {} until the scan stops", address);
                *self.relay.pending_connect.lock() = Some(address.to_string());
                self.scan.stop();
                Ok(())
            }
        }
    }

    /// Disconnect, or cancel a connect still waiting for the scan to stop.
    pub fn disconnect(&self) -> Result<()> {
        if self.relay.pending_connect.lock().take().is_some() {
            return Ok(());
        }
        self.connection.disconnect()
    }

    pub fn pending_connect(&self) -> Option<String> {
        self.relay.pending_connect.lock().clone()
    }
}
