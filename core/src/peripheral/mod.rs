//! Peripheral role: advertising the local device and serving its attributes.

pub mod advertise;
pub mod server;
pub mod table;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::PeripheralConfig;
use crate::error::Result;
use crate::events::PeripheralDelegate;
use crate::radio::{RadioAdapter, RadioState, RadioStateObserver};

pub use advertise::{AdvertiseSession, AdvertiseState, AdvertisementConfig};
pub use server::{BatteryRefresh, GattServerSession};
pub use table::{AttributeTable, BatterySource, FixedBatteryLevel, SharedAttributeTable};

/// Resumes an advertisement cut short by radio power loss.
struct PowerWatch {
    advertise: AdvertiseSession,
}

impl RadioStateObserver for PowerWatch {
    fn on_radio_state_changed(&self, state: RadioState) {
        if state != RadioState::On {
            return;
        }
        match self.advertise.resume() {
            Ok(true) => info!("Radio back on, advertising resumed"),
            Ok(false) => {}
            Err(e) => warn!("Radio back on but advertising could not resume: {}", e),
        }
    }
}

/// Advertise and GATT server sessions for the default device profile.
pub struct Peripheral {
    config: PeripheralConfig,
    advertise: AdvertiseSession,
    server: GattServerSession,
    _power_watch: Arc<PowerWatch>,
}

impl Peripheral {
    /// Build the attribute table from `config`, register it and prepare
    /// advertising. Advertising itself starts with [`Peripheral::start_advertising`].
    pub fn start(
        adapter: &RadioAdapter,
        config: PeripheralConfig,
        battery: Arc<dyn BatterySource>,
        delegate: Arc<dyn PeripheralDelegate>,
    ) -> Result<Self> {
        config.validate()?;

        let advertise = AdvertiseSession::new(adapter, delegate.clone())?;
        let table = AttributeTable::device_profile(
            &config.advertisement.device_name,
            &config.model_number,
            &config.serial_number,
        );
        let server = GattServerSession::start(
            adapter,
            table,
            advertise.clone(),
            delegate,
            BatteryRefresh {
                source: battery,
                period: config.battery_refresh(),
            },
        )?;

        let power_watch = Arc::new(PowerWatch {
            advertise: advertise.clone(),
        });
        let observer: Arc<dyn RadioStateObserver> = power_watch.clone();
        adapter.subscribe(Arc::downgrade(&observer));

        info!(
            "Peripheral '{}' ready (model {}, serial {})",
            config.advertisement.device_name, config.model_number, config.serial_number
        );
        Ok(Self {
            config,
            advertise,
            server,
            _power_watch: power_watch,
        })
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    pub fn advertise(&self) -> &AdvertiseSession {
        &self.advertise
    }

    pub fn server(&self) -> &GattServerSession {
        &self.server
    }

    pub fn start_advertising(&self) -> Result<()> {
        self.advertise.start(self.config.advertisement.clone())
    }

    pub fn stop_advertising(&self) {
        self.advertise.stop();
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.server.battery_level()
    }

    pub fn shutdown(&self) {
        self.advertise.stop();
        self.server.shutdown();
    }
}
