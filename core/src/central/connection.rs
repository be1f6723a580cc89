//! Central connection session
//!
//! DISCONNECTED → CONNECTING → CONNECTED → DISCOVERING → READY →
//! DISCONNECTING → DISCONNECTED.
//!
//! Service discovery is issued by the session itself the moment the link
//! reports CONNECTED; there is no public discovery entry point. Once the tree
//! has been captured the session disconnects on its own. The platform link
//! handle lives inside the phase, so it is released exactly when the session
//! returns to DISCONNECTED.

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BleError, PlatformError, Result};
use crate::events::{dispatch_central, CentralDelegate, CentralEvent};
use crate::profile::{CharacteristicId, GattProfile, Service, ServiceId};
use crate::radio::{GattStatus, LinkState, RadioAdapter, RadioState, RadioStateObserver};

// ============================================================================
// PLATFORM INTERFACE
// ============================================================================

/// Opens GATT client links. Outcomes arrive through the callback; it must not
/// be invoked before `connect` returns.
pub trait GattConnector: Send + Sync {
    fn connect(
        &self,
        address: &str,
        callback: Arc<dyn GattClientCallback>,
    ) -> std::result::Result<Box<dyn GattLink>, PlatformError>;
}

/// Handle to one open client link.
pub trait GattLink: Send + Sync {
    fn discover_services(&self) -> std::result::Result<(), PlatformError>;

    fn disconnect(&self) -> std::result::Result<(), PlatformError>;

    /// Release platform resources held by the link.
    fn close(&self);
}

pub trait GattClientCallback: Send + Sync {
    fn on_connection_state_change(&self, status: GattStatus, state: LinkState);

    fn on_services_discovered(&self, status: GattStatus, services: Vec<Service>);
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Discovering,
    Ready,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnecting => "disconnecting",
        };
        write!(f, "{}", label)
    }
}

struct Link {
    address: String,
    handle: Box<dyn GattLink>,
}

enum Phase {
    Disconnected,
    Connecting(Link),
    Connected(Link),
    Discovering(Link),
    Ready(Link),
    Disconnecting(Link),
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting(_) => ConnectionState::Connecting,
            Phase::Connected(_) => ConnectionState::Connected,
            Phase::Discovering(_) => ConnectionState::Discovering,
            Phase::Ready(_) => ConnectionState::Ready,
            Phase::Disconnecting(_) => ConnectionState::Disconnecting,
        }
    }

    fn address(&self) -> Option<&str> {
        match self {
            Phase::Disconnected => None,
            Phase::Connecting(link)
            | Phase::Connected(link)
            | Phase::Discovering(link)
            | Phase::Ready(link)
            | Phase::Disconnecting(link) => Some(&link.address),
        }
    }

    fn into_link(self) -> Option<Link> {
        match self {
            Phase::Disconnected => None,
            Phase::Connecting(link)
            | Phase::Connected(link)
            | Phase::Discovering(link)
            | Phase::Ready(link)
            | Phase::Disconnecting(link) => Some(link),
        }
    }
}

struct ConnectionCore {
    phase: Phase,
    epoch: u64,
    profile: Option<GattProfile>,
}

impl ConnectionCore {
    /// Release the link and settle in DISCONNECTED.
    fn tear_down(&mut self, events: &mut Vec<CentralEvent>) {
        let was_discovering = matches!(self.phase, Phase::Discovering(_));
        let Some(link) = mem::replace(&mut self.phase, Phase::Disconnected).into_link() else {
            return;
        };

        if was_discovering {
            events.push(CentralEvent::ServiceDiscoveryStopped {
                address: link.address.clone(),
                succeeded: false,
            });
        }
        link.handle.close();
        events.push(CentralEvent::Disconnected {
            address: link.address,
        });
    }

    /// Ask the platform to drop the link; falls back to a local tear-down when
    /// the request cannot be issued.
    fn begin_disconnect(&mut self, events: &mut Vec<CentralEvent>) {
        let link = match mem::replace(&mut self.phase, Phase::Disconnected) {
            Phase::Disconnecting(link) => {
                self.phase = Phase::Disconnecting(link);
                return;
            }
            other => match other.into_link() {
                Some(link) => link,
                None => return,
            },
        };

        match link.handle.disconnect() {
            Ok(()) => {
                debug!("Disconnect requested for {}", link.address);
                self.phase = Phase::Disconnecting(link);
            }
            Err(e) => {
                warn!("Disconnect request for {} failed: {}", link.address, e);
                self.phase = Phase::Disconnecting(link);
                self.tear_down(events);
            }
        }
    }
}

struct ConnectionInner {
    adapter: RadioAdapter,
    delegate: Arc<dyn CentralDelegate>,
    core: Mutex<ConnectionCore>,
}

/// Callback handed to the platform for one link attempt.
struct LinkListener {
    session: Weak<ConnectionInner>,
    epoch: u64,
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Clone)]
pub struct ConnectionSession {
    inner: Arc<ConnectionInner>,
}

/// Non-owning handle to a [`ConnectionSession`].
#[derive(Clone)]
pub(crate) struct WeakConnectionSession {
    inner: Weak<ConnectionInner>,
}

impl WeakConnectionSession {
    pub(crate) fn upgrade(&self) -> Option<ConnectionSession> {
        self.inner.upgrade().map(|inner| ConnectionSession { inner })
    }
}

impl ConnectionSession {
    pub fn new(adapter: &RadioAdapter, delegate: Arc<dyn CentralDelegate>) -> Result<Self> {
        if adapter.gatt_connector().is_none() {
            return Err(BleError::RadioUnavailable(
                "GATT client unavailable".to_string(),
            ));
        }

        let inner = Arc::new(ConnectionInner {
            adapter: adapter.clone(),
            delegate,
            core: Mutex::new(ConnectionCore {
                phase: Phase::Disconnected,
                epoch: 0,
                profile: None,
            }),
        });
        let observer: Arc<dyn RadioStateObserver> = inner.clone();
        adapter.subscribe(Arc::downgrade(&observer));

        Ok(Self { inner })
    }

    pub(crate) fn downgrade(&self) -> WeakConnectionSession {
        WeakConnectionSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().phase.state()
    }

    /// Remote address while a link exists.
    pub fn address(&self) -> Option<String> {
        self.inner.core.lock().phase.address().map(str::to_string)
    }

    /// Service tree captured by the most recent successful discovery.
    ///
    /// Kept after the automatic disconnect; cleared when a new connection starts.
    pub fn profile(&self) -> Option<GattProfile> {
        self.inner.core.lock().profile.clone()
    }

    pub fn connect(&self, address: &str) -> Result<()> {
        let mut core = self.inner.core.lock();
        if !matches!(core.phase, Phase::Disconnected) {
            return Err(BleError::InvalidState(format!(
                "cannot connect to {} while {}",
                address,
                core.phase.state()
            )));
        }

        let connector = self.inner.adapter.gatt_connector().ok_or_else(|| {
            BleError::RadioUnavailable("GATT client unavailable".to_string())
        })?;

        core.epoch += 1;
        let listener = Arc::new(LinkListener {
            session: Arc::downgrade(&self.inner),
            epoch: core.epoch,
        });
        let handle = connector.connect(address, listener)?;

        info!("Connecting to {}", address);
        core.profile = None;
        core.phase = Phase::Connecting(Link {
            address: address.to_string(),
            handle,
        });
        Ok(())
    }

    /// Request the link to close. A no-op while already disconnecting.
    pub fn disconnect(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut core = self.inner.core.lock();
            match core.phase.state() {
                ConnectionState::Disconnected => {
                    return Err(BleError::InvalidState(
                        "no connection to disconnect".to_string(),
                    ))
                }
                ConnectionState::Disconnecting => return Ok(()),
                _ => core.begin_disconnect(&mut events),
            }
        }
        dispatch_central(&self.inner.delegate, events);
        Ok(())
    }
}

impl ConnectionInner {
    fn connection_state_changed(&self, epoch: u64, status: GattStatus, state: LinkState) {
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            if core.epoch != epoch {
                debug!("Dropping link notification from attempt #{}", epoch);
                return;
            }

            match (status.is_success(), state) {
                (true, LinkState::Connected) => Self::link_up(&mut core, &mut events),
                (true, LinkState::Disconnected) | (false, _) => {
                    if let Some(address) = core.phase.address() {
                        info!("Link to {} closed ({})", address, status);
                    }
                    core.tear_down(&mut events);
                }
                (true, other) => debug!("Ignoring intermediate link state {:?}", other),
            }
        }
        dispatch_central(&self.delegate, events);
    }

    fn link_up(core: &mut ConnectionCore, events: &mut Vec<CentralEvent>) {
        let link = match mem::replace(&mut core.phase, Phase::Disconnected) {
            Phase::Connecting(link) => link,
            other => {
                debug!("Duplicate connected notification while {}", other.state());
                core.phase = other;
                return;
            }
        };

        info!("Connected to {}", link.address);
        events.push(CentralEvent::Connected {
            address: link.address.clone(),
        });
        events.push(CentralEvent::ServiceDiscoveryStarted {
            address: link.address.clone(),
        });
        match link.handle.discover_services() {
            Ok(()) => core.phase = Phase::Discovering(link),
            Err(e) => {
                warn!("Service discovery on {} could not start: {}", link.address, e);
                events.push(CentralEvent::ServiceDiscoveryStopped {
                    address: link.address.clone(),
                    succeeded: false,
                });
                core.phase = Phase::Connected(link);
                core.begin_disconnect(events);
            }
        }
    }

    fn services_discovered(&self, epoch: u64, status: GattStatus, services: Vec<Service>) {
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            if core.epoch != epoch {
                return;
            }
            let link = match mem::replace(&mut core.phase, Phase::Disconnected) {
                Phase::Discovering(link) => link,
                other => {
                    debug!("Discovery result ignored while {}", other.state());
                    core.phase = other;
                    return;
                }
            };

            if status.is_success() {
                let profile = GattProfile::from_services(services);
                info!(
                    "Discovered {} services, {} characteristics on {}",
                    profile.services().len(),
                    profile.characteristic_count(),
                    link.address
                );
                push_profile_events(&profile, &mut events);
                events.push(CentralEvent::ServiceDiscoveryStopped {
                    address: link.address.clone(),
                    succeeded: true,
                });
                core.profile = Some(profile);
                core.phase = Phase::Ready(link);
            } else {
                warn!("Service discovery on {} failed ({})", link.address, status);
                events.push(CentralEvent::ServiceDiscoveryStopped {
                    address: link.address.clone(),
                    succeeded: false,
                });
                core.phase = Phase::Connected(link);
            }

            core.begin_disconnect(&mut events);
        }
        dispatch_central(&self.delegate, events);
    }
}

fn push_profile_events(profile: &GattProfile, events: &mut Vec<CentralEvent>) {
    for (s, service) in profile.services().iter().enumerate() {
        let service_id = ServiceId(s as u16);
        events.push(CentralEvent::ServiceAdded {
            id: service_id,
            uuid: service.uuid,
            kind: service.kind,
        });
        for (c, characteristic) in service.characteristics.iter().enumerate() {
            events.push(CentralEvent::CharacteristicAdded {
                id: CharacteristicId {
                    service: service_id,
                    index: c as u16,
                },
                uuid: characteristic.uuid,
                capabilities: characteristic.capabilities,
            });
        }
    }
}

impl RadioStateObserver for ConnectionInner {
    fn on_radio_state_changed(&self, state: RadioState) {
        if !state.is_powering_down() {
            return;
        }
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            if matches!(core.phase, Phase::Disconnected) {
                return;
            }
            warn!("Radio {} with an open link, dropping it", state);
            core.tear_down(&mut events);
        }
        dispatch_central(&self.delegate, events);
    }
}

impl GattClientCallback for LinkListener {
    fn on_connection_state_change(&self, status: GattStatus, state: LinkState) {
        if let Some(session) = self.session.upgrade() {
            session.connection_state_changed(self.epoch, status, state);
        }
    }

    fn on_services_discovered(&self, status: GattStatus, services: Vec<Service>) {
        if let Some(session) = self.session.upgrade() {
            session.services_discovered(self.epoch, status, services);
        }
    }
}
