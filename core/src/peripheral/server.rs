//! GATT server session
//!
//! Registers the local [`AttributeTable`] with the radio, tracks inbound
//! Centrals and arbitrates with the [`AdvertiseSession`]: a Central arriving
//! stops the advertisement, the last Central leaving restarts it. A periodic
//! task keeps the battery level characteristic fresh.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BleError, PlatformError, Result};
use crate::events::{dispatch_peripheral, PeripheralDelegate, PeripheralEvent};
use crate::peripheral::advertise::AdvertiseSession;
use crate::peripheral::table::{AttributeTable, BatterySource, SharedAttributeTable};
use crate::radio::{GattStatus, LinkState, RadioAdapter, RadioState, RadioStateObserver};

// ============================================================================
// PLATFORM INTERFACE
// ============================================================================

pub trait GattServerPlatform: Send + Sync {
    /// Publish the table and start accepting Centrals.
    fn register(
        &self,
        table: SharedAttributeTable,
        callback: Arc<dyn GattServerCallback>,
    ) -> std::result::Result<(), PlatformError>;

    fn unregister(&self);
}

pub trait GattServerCallback: Send + Sync {
    fn on_connection_state_change(&self, device: &str, status: GattStatus, state: LinkState);
}

/// Periodic battery refresh settings.
#[derive(Clone)]
pub struct BatteryRefresh {
    pub source: Arc<dyn BatterySource>,
    pub period: Duration,
}

// ============================================================================
// SESSION
// ============================================================================

struct ServerInner {
    platform: Arc<dyn GattServerPlatform>,
    advertise: AdvertiseSession,
    delegate: Arc<dyn PeripheralDelegate>,
    table: SharedAttributeTable,
    /// Held across accept/stop-advertising and leave/restart-advertising.
    /// Events are dispatched only after it is released.
    ordering: Mutex<()>,
    centrals: Mutex<BTreeSet<String>>,
    battery_task: Mutex<Option<JoinHandle<()>>>,
}

struct ServerListener {
    session: Weak<ServerInner>,
}

#[derive(Clone)]
pub struct GattServerSession {
    inner: Arc<ServerInner>,
}

impl GattServerSession {
    /// Register `table` with the radio and start the battery refresh task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        adapter: &RadioAdapter,
        table: AttributeTable,
        advertise: AdvertiseSession,
        delegate: Arc<dyn PeripheralDelegate>,
        battery: BatteryRefresh,
    ) -> Result<Self> {
        let platform = adapter
            .gatt_server()
            .ok_or_else(|| BleError::RadioUnavailable("GATT server unavailable".to_string()))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BleError::InvalidState("GATT server requires a tokio runtime".to_string())
        })?;
        if battery.period.is_zero() {
            return Err(BleError::InvalidState(
                "battery refresh period must be non-zero".to_string(),
            ));
        }

        let inner = Arc::new(ServerInner {
            platform,
            advertise,
            delegate,
            table: Arc::new(RwLock::new(table)),
            ordering: Mutex::new(()),
            centrals: Mutex::new(BTreeSet::new()),
            battery_task: Mutex::new(None),
        });

        let listener = Arc::new(ServerListener {
            session: Arc::downgrade(&inner),
        });
        inner.platform.register(inner.table.clone(), listener)?;
        info!(
            "GATT server registered with {} services",
            inner.table.read().services().len()
        );

        let task = runtime.spawn(refresh_battery(Arc::downgrade(&inner.table), battery));
        *inner.battery_task.lock() = Some(task);

        let observer: Arc<dyn RadioStateObserver> = inner.clone();
        adapter.subscribe(Arc::downgrade(&observer));

        Ok(Self { inner })
    }

    pub fn table(&self) -> SharedAttributeTable {
        self.inner.table.clone()
    }

    pub fn read_value(&self, service: &Uuid, characteristic: &Uuid) -> Result<Vec<u8>> {
        self.inner.table.read().read(service, characteristic)
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.inner.table.read().battery_level()
    }

    pub fn connected_centrals(&self) -> Vec<String> {
        self.inner.centrals.lock().iter().cloned().collect()
    }

    /// Stop the battery task and withdraw the table from the radio.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.battery_task.lock().take() {
            task.abort();
        }
        self.inner.platform.unregister();
        self.inner.centrals.lock().clear();
        info!("GATT server shut down");
    }
}

impl ServerInner {
    fn connection_changed(&self, device: &str, status: GattStatus, state: LinkState) {
        if !status.is_success() {
            warn!("Ignoring {:?} from {} with status {}", state, device, status);
            return;
        }

        let mut events = Vec::new();
        let mut advertise_events = Vec::new();
        {
            let _order = self.ordering.lock();
            match state {
                LinkState::Connected => {
                    if !self.centrals.lock().insert(device.to_string()) {
                        debug!("Central {} already connected", device);
                        return;
                    }
                    info!("Central {} connected", device);
                    events.push(PeripheralEvent::CentralConnected {
                        device: device.to_string(),
                    });
                    advertise_events = self.advertise.halt();
                }
                LinkState::Disconnected => {
                    let remaining = {
                        let mut centrals = self.centrals.lock();
                        if !centrals.remove(device) {
                            debug!("Unknown central {} disconnected", device);
                            return;
                        }
                        centrals.len()
                    };
                    info!("Central {} disconnected", device);
                    events.push(PeripheralEvent::CentralDisconnected {
                        device: device.to_string(),
                    });
                    if remaining == 0 {
                        if let Err(e) = self.advertise.restart() {
                            warn!("Could not resume advertising after {} left: {}", device, e);
                        }
                    }
                }
                LinkState::Connecting | LinkState::Disconnecting => return,
            }
        }

        dispatch_peripheral(&self.delegate, events);
        self.advertise.dispatch(advertise_events);
    }
}

async fn refresh_battery(table: Weak<RwLock<AttributeTable>>, battery: BatteryRefresh) {
    let mut ticker = tokio::time::interval(battery.period);
    loop {
        ticker.tick().await;
        let level = match battery.source.battery_level().await {
            Ok(level) => level,
            Err(e) => {
                warn!("Battery level unavailable: {}", e);
                continue;
            }
        };
        let Some(table) = table.upgrade() else {
            return;
        };
        if let Err(e) = table.write().set_battery_level(level) {
            warn!("Battery level not stored: {}", e);
            return;
        }
        debug!("Battery level refreshed: {}%", level);
    }
}

impl RadioStateObserver for ServerInner {
    fn on_radio_state_changed(&self, state: RadioState) {
        if !state.is_powering_down() {
            return;
        }
        let dropped: Vec<String> = {
            let _order = self.ordering.lock();
            std::mem::take(&mut *self.centrals.lock())
                .into_iter()
                .collect()
        };
        if dropped.is_empty() {
            return;
        }

        warn!("Radio {}, dropping {} centrals", state, dropped.len());
        dispatch_peripheral(
            &self.delegate,
            dropped
                .into_iter()
                .map(|device| PeripheralEvent::CentralDisconnected { device })
                .collect(),
        );
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(task) = self.battery_task.get_mut().take() {
            task.abort();
        }
    }
}

impl GattServerCallback for ServerListener {
    fn on_connection_state_change(&self, device: &str, status: GattStatus, state: LinkState) {
        if let Some(session) = self.session.upgrade() {
            session.connection_changed(device, status, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::advertise::{
        AdvertiseCallback, AdvertiseState, AdvertisementConfig, MockAdvertiser,
    };
    use crate::peripheral::table::FixedBatteryLevel;
    use crate::profile::{DEVICE_INFORMATION_SERVICE, DEVICE_NAME_CHARACTERISTIC};
    use crate::testing::{CallbackSlot, EventLog, FakeGattServer, FakeRadio};
    use std::thread;

    struct Fixture {
        server_platform: Arc<FakeGattServer>,
        advertise: AdvertiseSession,
        advertise_slot: CallbackSlot<dyn AdvertiseCallback>,
        server: GattServerSession,
        log: Arc<EventLog<PeripheralEvent>>,
        radio: Arc<FakeRadio>,
    }

    fn fixture(level: u8) -> Fixture {
        let advertise_slot = CallbackSlot::new();
        let mut advertiser = MockAdvertiser::new();
        advertiser.expect_set_device_name().returning(|_| Ok(()));
        let slot = advertise_slot.clone();
        advertiser
            .expect_start_advertising()
            .returning(move |_, callback| {
                slot.set(callback);
                Ok(())
            });
        advertiser.expect_stop_advertising().returning(|| Ok(()));
        let log = Arc::new(EventLog::<PeripheralEvent>::new());
        fixture_with(level, advertiser, advertise_slot, log.clone(), log)
    }

    fn fixture_with(
        level: u8,
        advertiser: MockAdvertiser,
        advertise_slot: CallbackSlot<dyn AdvertiseCallback>,
        log: Arc<EventLog<PeripheralEvent>>,
        delegate: Arc<dyn PeripheralDelegate>,
    ) -> Fixture {
        let radio = Arc::new(FakeRadio::new());
        radio.set_advertiser(Some(Arc::new(advertiser)));
        let server_platform = Arc::new(FakeGattServer::new());
        radio.set_gatt_server(Some(server_platform.clone()));

        let adapter = RadioAdapter::new(radio.clone()).expect("LE supported");
        let advertise = AdvertiseSession::new(&adapter, delegate.clone()).expect("advertiser");
        let server = GattServerSession::start(
            &adapter,
            AttributeTable::device_profile("MyDevice", "1AB2", "1234"),
            advertise.clone(),
            delegate,
            BatteryRefresh {
                source: Arc::new(FixedBatteryLevel(level)),
                period: Duration::from_secs(5),
            },
        )
        .expect("server starts");

        Fixture {
            server_platform,
            advertise,
            advertise_slot,
            server,
            log,
            radio,
        }
    }

    fn advertising(f: &Fixture) {
        f.advertise
            .start(AdvertisementConfig::default())
            .expect("start advertising");
        f.advertise_slot.get().expect("callback").on_start_success();
        assert_eq!(f.advertise.state(), AdvertiseState::Advertising);
    }

    #[tokio::test]
    async fn test_table_registered_once() {
        let f = fixture(50);
        assert_eq!(f.server_platform.register_calls(), 1);
        assert_eq!(
            f.server
                .read_value(&DEVICE_INFORMATION_SERVICE, &DEVICE_NAME_CHARACTERISTIC)
                .expect("readable"),
            b"MyDevice".to_vec()
        );
    }

    #[tokio::test]
    async fn test_central_accept_stops_and_leave_restarts_advertising() {
        let f = fixture(50);
        advertising(&f);
        let callback = f.server_platform.callback().expect("registered");

        callback.on_connection_state_change("11:22", GattStatus::Success, LinkState::Connected);
        assert_eq!(f.advertise.state(), AdvertiseState::Idle);
        assert_eq!(f.server.connected_centrals(), vec!["11:22".to_string()]);

        callback.on_connection_state_change("11:22", GattStatus::Success, LinkState::Disconnected);
        assert_eq!(f.advertise.state(), AdvertiseState::Starting);
        f.advertise_slot.get().expect("callback").on_start_success();
        assert_eq!(f.advertise.state(), AdvertiseState::Advertising);

        assert_eq!(
            f.log.events(),
            vec![
                PeripheralEvent::AdvertisingStarted,
                PeripheralEvent::CentralConnected {
                    device: "11:22".to_string()
                },
                PeripheralEvent::AdvertisingStopped,
                PeripheralEvent::CentralDisconnected {
                    device: "11:22".to_string()
                },
                PeripheralEvent::AdvertisingStarted,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_status_is_ignored() {
        let f = fixture(50);
        advertising(&f);
        let callback = f.server_platform.callback().expect("registered");

        callback.on_connection_state_change("11:22", GattStatus::Failure(8), LinkState::Connected);
        assert_eq!(f.advertise.state(), AdvertiseState::Advertising);
        assert!(f.server.connected_centrals().is_empty());
    }

    #[tokio::test]
    async fn test_restart_failure_is_not_escalated() {
        let f = fixture(50);
        let callback = f.server_platform.callback().expect("registered");

        // Never advertised, so there is nothing to restart.
        callback.on_connection_state_change("11:22", GattStatus::Success, LinkState::Connected);
        callback.on_connection_state_change("11:22", GattStatus::Success, LinkState::Disconnected);
        assert_eq!(f.advertise.state(), AdvertiseState::Idle);
        assert_eq!(f.log.events().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_refresh_runs_immediately() {
        let f = fixture(73);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.server.battery_level(), Some(73));

        f.server.table().write().set_battery_level(5).expect("battery");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.server.battery_level(), Some(73));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_refresh_and_unregisters() {
        let f = fixture(73);
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.server.shutdown();
        assert_eq!(f.server_platform.unregister_calls(), 1);

        f.server.table().write().set_battery_level(5).expect("battery");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(f.server.battery_level(), Some(5));
    }

    #[tokio::test]
    async fn test_radio_off_drops_centrals() {
        let f = fixture(50);
        let callback = f.server_platform.callback().expect("registered");
        callback.on_connection_state_change("11:22", GattStatus::Success, LinkState::Connected);

        f.radio.notify(RadioState::Off);
        assert!(f.server.connected_centrals().is_empty());
        assert_eq!(
            f.log.events().last(),
            Some(&PeripheralEvent::CentralDisconnected {
                device: "11:22".to_string()
            })
        );
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let radio = Arc::new(FakeRadio::new());
        radio.set_gatt_server(Some(Arc::new(FakeGattServer::new())));
        let mut advertiser = MockAdvertiser::new();
        advertiser.expect_stop_advertising().returning(|| Ok(()));
        radio.set_advertiser(Some(Arc::new(advertiser)));
        let adapter = RadioAdapter::new(radio).expect("LE supported");
        let log = Arc::new(EventLog::<PeripheralEvent>::new());
        let advertise = AdvertiseSession::new(&adapter, log.clone()).expect("advertiser");

        let result = GattServerSession::start(
            &adapter,
            AttributeTable::new(),
            advertise,
            log,
            BatteryRefresh {
                source: Arc::new(FixedBatteryLevel(1)),
                period: Duration::from_secs(1),
            },
        );
        assert!(matches!(result, Err(BleError::InvalidState(_))));
    }

    /// Advertiser that confirms every start from a separate thread, the way a
    /// host stack delivers callbacks.
    fn threaded_advertiser(
        confirmations: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    ) -> MockAdvertiser {
        let mut advertiser = MockAdvertiser::new();
        advertiser.expect_set_device_name().returning(|_| Ok(()));
        advertiser
            .expect_start_advertising()
            .returning(move |_, callback| {
                let handle = thread::spawn(move || callback.on_start_success());
                confirmations.lock().push(handle);
                Ok(())
            });
        advertiser.expect_stop_advertising().returning(|| Ok(()));
        advertiser
    }

    fn join_all(confirmations: &Mutex<Vec<thread::JoinHandle<()>>>) {
        loop {
            let pending: Vec<_> = confirmations.lock().drain(..).collect();
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                handle.join().expect("confirmation thread");
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_centrals_never_overlap_advertising() {
        let confirmations = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::new(EventLog::<PeripheralEvent>::new());
        let f = fixture_with(
            50,
            threaded_advertiser(confirmations.clone()),
            CallbackSlot::new(),
            log.clone(),
            log,
        );
        f.advertise
            .start(AdvertisementConfig::default())
            .expect("start advertising");
        join_all(&confirmations);
        assert_eq!(f.advertise.state(), AdvertiseState::Advertising);

        let callback = f.server_platform.callback().expect("registered");
        thread::scope(|scope| {
            for worker in 0..4 {
                let callback = callback.clone();
                let advertise = f.advertise.clone();
                scope.spawn(move || {
                    let device = format!("C{}:00", worker);
                    for _ in 0..200 {
                        callback.on_connection_state_change(
                            &device,
                            GattStatus::Success,
                            LinkState::Connected,
                        );
                        // Nothing may restart advertising while this central is present.
                        assert_eq!(advertise.state(), AdvertiseState::Idle);
                        callback.on_connection_state_change(
                            &device,
                            GattStatus::Success,
                            LinkState::Disconnected,
                        );
                    }
                });
            }
        });
        join_all(&confirmations);

        assert!(f.server.connected_centrals().is_empty());
        assert_eq!(f.advertise.state(), AdvertiseState::Advertising);
        let events = f.log.events();
        let connected = events
            .iter()
            .filter(|e| matches!(e, PeripheralEvent::CentralConnected { .. }))
            .count();
        let disconnected = events
            .iter()
            .filter(|e| matches!(e, PeripheralEvent::CentralDisconnected { .. }))
            .count();
        assert_eq!((connected, disconnected), (800, 800));
        assert!(!events
            .iter()
            .any(|e| matches!(e, PeripheralEvent::AdvertisingFailed { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_caller_requests_race_central_callbacks() {
        let confirmations = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::new(EventLog::<PeripheralEvent>::new());
        let f = fixture_with(
            50,
            threaded_advertiser(confirmations.clone()),
            CallbackSlot::new(),
            log.clone(),
            log,
        );
        let callback = f.server_platform.callback().expect("registered");

        thread::scope(|scope| {
            for worker in 0..2 {
                let callback = callback.clone();
                scope.spawn(move || {
                    let device = format!("C{}:00", worker);
                    for _ in 0..200 {
                        callback.on_connection_state_change(
                            &device,
                            GattStatus::Success,
                            LinkState::Connected,
                        );
                        callback.on_connection_state_change(
                            &device,
                            GattStatus::Success,
                            LinkState::Disconnected,
                        );
                    }
                });
            }
            for _ in 0..2 {
                let advertise = f.advertise.clone();
                scope.spawn(move || {
                    for _ in 0..200 {
                        match advertise.start(AdvertisementConfig::default()) {
                            Ok(()) | Err(BleError::AlreadyActive) => {}
                            Err(e) => panic!("unexpected start error: {}", e),
                        }
                        advertise.stop();
                    }
                });
            }
        });
        join_all(&confirmations);

        assert!(f.server.connected_centrals().is_empty());
        f.advertise.stop();
        join_all(&confirmations);
        assert_eq!(f.advertise.state(), AdvertiseState::Idle);
    }

    /// Forwards events and, like a Central that drops straight away, reports
    /// every arrival as an immediate departure.
    struct BouncingDelegate {
        log: Arc<EventLog<PeripheralEvent>>,
        server: CallbackSlot<dyn GattServerCallback>,
    }

    impl PeripheralDelegate for BouncingDelegate {
        fn on_peripheral_event(&self, event: PeripheralEvent) {
            self.log.on_peripheral_event(event.clone());
            if let PeripheralEvent::CentralConnected { device } = event {
                if let Some(server) = self.server.get() {
                    server.on_connection_state_change(
                        &device,
                        GattStatus::Success,
                        LinkState::Disconnected,
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_delegate_may_reenter_from_central_events() {
        let advertise_slot = CallbackSlot::new();
        let mut advertiser = MockAdvertiser::new();
        advertiser.expect_set_device_name().returning(|_| Ok(()));
        let slot = advertise_slot.clone();
        advertiser
            .expect_start_advertising()
            .returning(move |_, callback| {
                slot.set(callback);
                Ok(())
            });
        advertiser.expect_stop_advertising().returning(|| Ok(()));
        let log = Arc::new(EventLog::<PeripheralEvent>::new());
        let server_slot = CallbackSlot::new();
        let delegate = Arc::new(BouncingDelegate {
            log: log.clone(),
            server: server_slot.clone(),
        });
        let f = fixture_with(50, advertiser, advertise_slot, log, delegate);
        server_slot.set(f.server_platform.callback().expect("registered"));
        advertising(&f);

        f.server_platform
            .callback()
            .expect("registered")
            .on_connection_state_change("11:22", GattStatus::Success, LinkState::Connected);

        assert!(f.server.connected_centrals().is_empty());
        assert_eq!(f.advertise.state(), AdvertiseState::Starting);
        let events = f.log.events();
        assert!(events.contains(&PeripheralEvent::CentralConnected {
            device: "11:22".to_string()
        }));
        assert!(events.contains(&PeripheralEvent::CentralDisconnected {
            device: "11:22".to_string()
        }));
        assert!(events.contains(&PeripheralEvent::AdvertisingStopped));
    }
}
