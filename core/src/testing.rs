//! Test doubles for the platform traits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::central::connection::{GattClientCallback, GattConnector, GattLink};
use crate::central::scan::Scanner;
use crate::error::PlatformError;
use crate::events::{CentralDelegate, CentralEvent, PeripheralDelegate, PeripheralEvent};
use crate::peripheral::advertise::Advertiser;
use crate::peripheral::server::{GattServerCallback, GattServerPlatform};
use crate::peripheral::table::SharedAttributeTable;
use crate::radio::{RadioPlatform, RadioState, RadioStateObserver};

// ============================================================================
// RADIO
// ============================================================================

pub struct FakeRadio {
    low_energy: bool,
    state: Mutex<RadioState>,
    scanner: Mutex<Option<Arc<dyn Scanner>>>,
    connector: Mutex<Option<Arc<dyn GattConnector>>>,
    advertiser: Mutex<Option<Arc<dyn Advertiser>>>,
    gatt_server: Mutex<Option<Arc<dyn GattServerPlatform>>>,
    watchers: Mutex<Vec<Weak<dyn RadioStateObserver>>>,
}

impl FakeRadio {
    pub fn new() -> Self {
        Self {
            low_energy: true,
            state: Mutex::new(RadioState::On),
            scanner: Mutex::new(None),
            connector: Mutex::new(None),
            advertiser: Mutex::new(None),
            gatt_server: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn without_low_energy() -> Self {
        Self {
            low_energy: false,
            ..Self::new()
        }
    }

    pub fn set_state(&self, state: RadioState) {
        *self.state.lock() = state;
    }

    pub fn set_scanner(&self, scanner: Option<Arc<dyn Scanner>>) {
        *self.scanner.lock() = scanner;
    }

    pub fn set_connector(&self, connector: Option<Arc<dyn GattConnector>>) {
        *self.connector.lock() = connector;
    }

    pub fn set_advertiser(&self, advertiser: Option<Arc<dyn Advertiser>>) {
        *self.advertiser.lock() = advertiser;
    }

    pub fn set_gatt_server(&self, server: Option<Arc<dyn GattServerPlatform>>) {
        *self.gatt_server.lock() = server;
    }

    /// Switch state and notify the adapter, as the platform would.
    pub fn notify(&self, state: RadioState) {
        self.set_state(state);
        let watchers: Vec<_> = self
            .watchers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for watcher in watchers {
            watcher.on_radio_state_changed(state);
        }
    }
}

impl RadioPlatform for FakeRadio {
    fn is_low_energy_supported(&self) -> bool {
        self.low_energy
    }

    fn state(&self) -> RadioState {
        *self.state.lock()
    }

    fn scanner(&self) -> Option<Arc<dyn Scanner>> {
        self.scanner.lock().clone()
    }

    fn gatt_connector(&self) -> Option<Arc<dyn GattConnector>> {
        self.connector.lock().clone()
    }

    fn advertiser(&self) -> Option<Arc<dyn Advertiser>> {
        self.advertiser.lock().clone()
    }

    fn gatt_server(&self) -> Option<Arc<dyn GattServerPlatform>> {
        self.gatt_server.lock().clone()
    }

    fn watch_state(&self, observer: Weak<dyn RadioStateObserver>) {
        self.watchers.lock().push(observer);
    }
}

// ============================================================================
// CALLBACK CAPTURE
// ============================================================================

/// Holds the most recent callback a session handed to a mock.
pub struct CallbackSlot<T: ?Sized> {
    inner: Arc<Mutex<Option<Arc<T>>>>,
}

impl<T: ?Sized> Clone for CallbackSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> CallbackSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set(&self, callback: Arc<T>) {
        *self.inner.lock() = Some(callback);
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.lock().clone()
    }
}

/// Delegate that records every event.
pub struct EventLog<E> {
    events: Mutex<Vec<E>>,
}

impl<E: Clone> EventLog<E> {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<E> {
        self.events.lock().clone()
    }
}

impl CentralDelegate for EventLog<CentralEvent> {
    fn on_central_event(&self, event: CentralEvent) {
        self.events.lock().push(event);
    }
}

impl PeripheralDelegate for EventLog<PeripheralEvent> {
    fn on_peripheral_event(&self, event: PeripheralEvent) {
        self.events.lock().push(event);
    }
}

// ============================================================================
// GATT CLIENT
// ============================================================================

/// Counters shared between a [`FakeConnector`] and the links it opens.
#[derive(Default)]
pub struct LinkProbe {
    discover: AtomicUsize,
    disconnect: AtomicUsize,
    closed: AtomicBool,
    fail_disconnect: bool,
}

impl LinkProbe {
    pub fn discover_calls(&self) -> usize {
        self.discover.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeLink {
    probe: Arc<LinkProbe>,
}

impl GattLink for FakeLink {
    fn discover_services(&self) -> Result<(), PlatformError> {
        self.probe.discover.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PlatformError> {
        self.probe.disconnect.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail_disconnect {
            return Err(PlatformError::Backend("link already gone".to_string()));
        }
        Ok(())
    }

    fn close(&self) {
        self.probe.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    calls: AtomicUsize,
    fail_disconnect: AtomicBool,
    last_callback: Mutex<Option<Arc<dyn GattClientCallback>>>,
    last_probe: Mutex<Option<Arc<LinkProbe>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_disconnect: AtomicBool::new(false),
            last_callback: Mutex::new(None),
            last_probe: Mutex::new(None),
        }
    }

    /// Links opened from now on reject disconnect requests.
    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_callback(&self) -> Option<Arc<dyn GattClientCallback>> {
        self.last_callback.lock().clone()
    }

    pub fn last_probe(&self) -> Option<Arc<LinkProbe>> {
        self.last_probe.lock().clone()
    }
}

impl GattConnector for FakeConnector {
    fn connect(
        &self,
        _address: &str,
        callback: Arc<dyn GattClientCallback>,
    ) -> Result<Box<dyn GattLink>, PlatformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let probe = Arc::new(LinkProbe {
            fail_disconnect: self.fail_disconnect.load(Ordering::SeqCst),
            ..LinkProbe::default()
        });
        *self.last_callback.lock() = Some(callback);
        *self.last_probe.lock() = Some(probe.clone());
        Ok(Box::new(FakeLink { probe }))
    }
}

// ============================================================================
// GATT SERVER
// ============================================================================

pub struct FakeGattServer {
    registered: AtomicUsize,
    unregistered: AtomicUsize,
    table: Mutex<Option<SharedAttributeTable>>,
    callback: Mutex<Option<Arc<dyn GattServerCallback>>>,
}

impl FakeGattServer {
    pub fn new() -> Self {
        Self {
            registered: AtomicUsize::new(0),
            unregistered: AtomicUsize::new(0),
            table: Mutex::new(None),
            callback: Mutex::new(None),
        }
    }

    pub fn register_calls(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn unregister_calls(&self) -> usize {
        self.unregistered.load(Ordering::SeqCst)
    }

    pub fn callback(&self) -> Option<Arc<dyn GattServerCallback>> {
        self.callback.lock().clone()
    }

    pub fn table(&self) -> Option<SharedAttributeTable> {
        self.table.lock().clone()
    }
}

impl GattServerPlatform for FakeGattServer {
    fn register(
        &self,
        table: SharedAttributeTable,
        callback: Arc<dyn GattServerCallback>,
    ) -> Result<(), PlatformError> {
        self.registered.fetch_add(1, Ordering::SeqCst);
        *self.table.lock() = Some(table);
        *self.callback.lock() = Some(callback);
        Ok(())
    }

    fn unregister(&self) {
        self.unregistered.fetch_add(1, Ordering::SeqCst);
        self.table.lock().take();
        self.callback.lock().take();
    }
}
