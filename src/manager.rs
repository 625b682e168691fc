//! Mapping lifecycle management.
//!
//! [`ConnectionManager`] is the single authority for creating, starting,
//! stopping, and removing mappings. It owns the mapping table, the port
//! allocators, the config writer, the tunnel supervisor, and the per-mapping
//! bridges.
//!
//! ## State machine
//!
//! ```text
//! Stopped ──start──▶ Starting ──▶ Running
//!    ▲                  │            │
//!    │                  ▼            ▼
//!    └──────stop─────  Error  ◀── (crash)
//!
//! Stopped ──remove──▶ Removing ──▶ (deleted)
//! ```
//!
//! ## Concurrency
//!
//! Everything mutable lives behind one `Mutex` that is held for the entire
//! duration of a transition (check and act under one lock, never
//! check-then-reacquire). That serializes transitions: config regeneration,
//! tunnel restarts, and port bookkeeping can never interleave. Work inside a
//! transition (serial open, process spawn, config write) runs on the calling
//! task; relay loops and child-output reads run on their own tasks and
//! report back through channels.
//!
//! ## Port reservations
//!
//! A mapping's public port is *assigned* at `add_mapping` but *reserved*
//! only while the mapping is not Stopped. Stopped mappings keep their
//! number without holding it, so two Stopped mappings may carry the same
//! port — whichever starts first wins, the other gets `PortConflict`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::error::Error;
use crate::events::{Event, EventSender};
use crate::ports::PortAllocator;
use crate::tunnel::supervisor::{Supervisor, TunnelNotice};
use crate::tunnel::writer::{ConfigWriter, TunnelStanza};

pub type MappingId = String;

/// Mapping lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingState {
    Stopped,
    Starting,
    Running,
    Error,
    Removing,
}

impl MappingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Removing => "removing",
        }
    }
}

/// What a mapping exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MappingSource {
    /// A serial device, bridged to TCP locally before being forwarded.
    Serial { device: String, baud: u32 },
    /// An internal TCP endpoint, forwarded directly.
    Tcp { host: String, port: u16 },
}

/// A request to create a mapping.
#[derive(Debug, Clone)]
pub struct MappingSpec {
    pub name: Option<String>,
    pub source: MappingSource,
    /// Explicit public port; suggested by the allocator when `None`.
    pub public_port: Option<u16>,
}

/// Snapshot of one mapping, as handed to the UI/CLI.
#[derive(Debug, Clone, Serialize)]
pub struct MappingInfo {
    pub id: MappingId,
    pub name: Option<String>,
    #[serde(flatten)]
    pub source: MappingSource,
    pub public_port: u16,
    /// Loopback port of the bridge listener (serial mappings while active).
    pub local_port: Option<u16>,
    pub state: MappingState,
    pub last_error: Option<String>,
}

/// Internal bookkeeping for a mapping.
struct Mapping {
    name: Option<String>,
    source: MappingSource,
    public_port: u16,
    local_port: Option<u16>,
    state: MappingState,
    last_error: Option<String>,
}

struct Inner {
    mappings: HashMap<MappingId, Mapping>,
    /// Public (internet-facing) port reservations.
    allocator: PortAllocator,
    /// Loopback ports for bridge listeners.
    local_ports: PortAllocator,
    writer: ConfigWriter,
    supervisor: Supervisor,
    bridges: HashMap<MappingId, Bridge>,
}

/// Sole entry point for mapping operations.
///
/// Cloneable — all clones share the same inner state. Construct inside a
/// tokio runtime: `new` spawns the tunnel exit watcher.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Mutex<Inner>>,
    events: EventSender,
    config: Arc<Config>,
}

impl ConnectionManager {
    pub fn new(config: Config, events: EventSender) -> Self {
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            config.client.binary.clone(),
            Duration::from_millis(config.client.stop_grace_ms),
            events.clone(),
            notice_tx,
        );
        let inner = Inner {
            mappings: HashMap::new(),
            allocator: PortAllocator::new(config.allocator.public_port_base),
            local_ports: PortAllocator::new(config.bridge.local_port_base),
            writer: ConfigWriter::new(),
            supervisor,
            bridges: HashMap::new(),
        };
        let manager = Self {
            inner: Arc::new(Mutex::new(inner)),
            events,
            config: Arc::new(config),
        };

        // Tunnel exit watcher: crashes reach the state machine through here.
        let watcher = manager.clone();
        tokio::spawn(async move {
            while let Some(notice) = notice_rx.recv().await {
                watcher.on_tunnel_exit(notice).await;
            }
        });

        manager
    }

    /// Subscribe to the observer feed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Validate a spec and store it in Stopped state. Returns the new id.
    ///
    /// An explicit public port that is currently reserved is rejected
    /// synchronously with `PortConflict`; no partial state is created.
    pub async fn add_mapping(&self, spec: MappingSpec) -> Result<MappingId, Error> {
        validate(&spec)?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let public_port = match spec.public_port {
            Some(port) => {
                if inner.allocator.is_reserved(port) {
                    return Err(Error::PortConflict(port));
                }
                port
            }
            None => {
                // Skip ports already assigned to other (possibly Stopped)
                // mappings so suggestions stay collision-free.
                let mut min = 0;
                loop {
                    let port = inner.allocator.suggest(min).ok_or_else(|| {
                        Error::InvalidMapping("no free public ports above the base".into())
                    })?;
                    if inner.mappings.values().all(|m| m.public_port != port) {
                        break port;
                    }
                    min = port.checked_add(1).ok_or_else(|| {
                        Error::InvalidMapping("no free public ports above the base".into())
                    })?;
                }
            }
        };

        let id = Uuid::new_v4().to_string();
        inner.mappings.insert(
            id.clone(),
            Mapping {
                name: spec.name,
                source: spec.source,
                public_port,
                local_port: None,
                state: MappingState::Stopped,
                last_error: None,
            },
        );
        info!("Mapping {id}: added (public port {public_port})");
        self.emit(&id, MappingState::Stopped, None);
        Ok(id)
    }

    /// Start a mapping: Stopped/Error → Starting → Running.
    ///
    /// Ordering: public port reservation, then (serial only) the bridge,
    /// then config regeneration, then the tunnel restart. Any failure lands
    /// the mapping in Error with `last_error` set and already-acquired
    /// resources rolled back — except the public port reservation, which an
    /// Error mapping keeps.
    pub async fn start(&self, id: &str) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let mapping = inner
            .mappings
            .get_mut(id)
            .ok_or_else(|| Error::MappingNotFound(id.to_string()))?;
        match mapping.state {
            MappingState::Stopped | MappingState::Error => {}
            other => {
                return Err(Error::InvalidTransition(format!(
                    "cannot start a {} mapping",
                    other.as_str()
                )))
            }
        }

        let public_port = mapping.public_port;
        let source = mapping.source.clone();
        if mapping.state == MappingState::Stopped {
            // Fails before any state is touched: the caller's mapping (and
            // whoever holds the port) stay exactly as they were.
            inner.allocator.reserve(public_port)?;
        }

        if let Some(mapping) = inner.mappings.get_mut(id) {
            mapping.state = MappingState::Starting;
            mapping.last_error = None;
        }
        self.emit(id, MappingState::Starting, None);
        info!("Mapping {id}: starting (public port {public_port})");

        // Serial mappings get their bridge before the tunnel sees them.
        if let MappingSource::Serial { device, baud } = &source {
            if inner.bridges.values().any(|b| b.device == *device) {
                let err = Error::DeviceUnavailable(format!(
                    "{device} is already claimed by another mapping"
                ));
                return self.fail_start(inner, id, err);
            }
            let Some(local_port) = inner.local_ports.suggest(0) else {
                return self.fail_start(
                    inner,
                    id,
                    Error::InvalidMapping("no free local ports above the base".into()),
                );
            };
            if let Err(e) = inner.local_ports.reserve(local_port) {
                return self.fail_start(inner, id, e);
            }
            match Bridge::start(
                device,
                *baud,
                &self.config.bridge.bind,
                local_port,
                self.events.clone(),
            )
            .await
            {
                Ok(bridge) => {
                    if let Some(mapping) = inner.mappings.get_mut(id) {
                        mapping.local_port = Some(bridge.local_port);
                    }
                    inner.bridges.insert(id.to_string(), bridge);
                }
                Err(e) => {
                    inner.local_ports.release(local_port);
                    return self.fail_start(inner, id, e);
                }
            }
        }

        // Config regeneration completes (and is flushed) before the tunnel
        // client is restarted against it.
        let stanzas = self.stanzas(inner, Some(id));
        let path = match inner.writer.write(&self.config.server, &stanzas) {
            Ok(path) => path,
            Err(e) => {
                self.teardown_bridge(inner, id).await;
                return self.fail_start(inner, id, Error::Io(e));
            }
        };
        if let Err(e) = inner.supervisor.restart(&path).await {
            self.teardown_bridge(inner, id).await;
            return self.fail_start(inner, id, e);
        }

        if let Some(mapping) = inner.mappings.get_mut(id) {
            mapping.state = MappingState::Running;
            mapping.last_error = None;
        }
        self.emit(id, MappingState::Running, None);
        info!("Mapping {id}: running");
        Ok(())
    }

    /// Stop a mapping: Running/Error → Stopped. Idempotent on Stopped.
    ///
    /// The bridge is torn down, both ports released, and the tunnel client
    /// restarted without this mapping's stanza — or stopped entirely (and
    /// the config file removed) when no Running mappings remain.
    pub async fn stop(&self, id: &str) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let mapping = inner
            .mappings
            .get(id)
            .ok_or_else(|| Error::MappingNotFound(id.to_string()))?;
        match mapping.state {
            MappingState::Running | MappingState::Error => {}
            MappingState::Stopped => return Ok(()),
            other => {
                return Err(Error::InvalidTransition(format!(
                    "cannot stop a {} mapping",
                    other.as_str()
                )))
            }
        }
        let public_port = mapping.public_port;

        self.teardown_bridge(inner, id).await;
        if let Some(mapping) = inner.mappings.get_mut(id) {
            mapping.state = MappingState::Stopped;
        }
        inner.allocator.release(public_port);
        self.emit(id, MappingState::Stopped, None);
        info!("Mapping {id}: stopped (public port {public_port} released)");

        let stanzas = self.stanzas(inner, None);
        if stanzas.is_empty() {
            inner.supervisor.stop().await;
            inner.writer.cleanup();
        } else {
            match inner.writer.write(&self.config.server, &stanzas) {
                Ok(path) => {
                    if let Err(e) = inner.supervisor.restart(&path).await {
                        error!("Failed to relaunch forwarding client after stop: {e}");
                        self.fail_running(inner, &e.to_string()).await;
                    }
                }
                Err(e) => {
                    error!("Failed to regenerate tunnel config after stop: {e}");
                    self.fail_running(inner, &e.to_string()).await;
                }
            }
        }
        Ok(())
    }

    /// Delete a Stopped mapping and release its assigned port number.
    pub async fn remove(&self, id: &str) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let mapping = inner
            .mappings
            .get(id)
            .ok_or_else(|| Error::MappingNotFound(id.to_string()))?;
        if mapping.state != MappingState::Stopped {
            return Err(Error::InvalidTransition(format!(
                "cannot remove a {} mapping; stop it first",
                mapping.state.as_str()
            )));
        }
        let public_port = mapping.public_port;

        self.emit(id, MappingState::Removing, None);
        inner.allocator.release(public_port); // Stopped ⇒ already free
        inner.mappings.remove(id);
        info!("Mapping {id}: removed");
        Ok(())
    }

    /// Snapshot of one mapping.
    pub async fn get(&self, id: &str) -> Option<MappingInfo> {
        let inner = self.inner.lock().await;
        inner.mappings.get(id).map(|m| info_for(id, m))
    }

    /// Snapshot of all mappings.
    pub async fn list(&self) -> Vec<MappingInfo> {
        let inner = self.inner.lock().await;
        let mut items: Vec<MappingInfo> = inner
            .mappings
            .iter()
            .map(|(id, m)| info_for(id, m))
            .collect();
        items.sort_by(|a, b| a.public_port.cmp(&b.public_port));
        items
    }

    /// Stop every non-Stopped mapping, the tunnel client, and remove the
    /// config file. Used during shutdown.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let active: Vec<MappingId> = inner
            .mappings
            .iter()
            .filter(|(_, m)| m.state != MappingState::Stopped)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &active {
            self.teardown_bridge(inner, id).await;
            if let Some(mapping) = inner.mappings.get_mut(id) {
                inner.allocator.release(mapping.public_port);
                mapping.state = MappingState::Stopped;
            }
            self.emit(id, MappingState::Stopped, None);
        }
        inner.supervisor.stop().await;
        inner.writer.cleanup();
        info!("Connection manager shut down ({} mapping(s) stopped)", active.len());
    }

    /// React to an unexpected tunnel exit: every Running mapping goes to
    /// Error with its bridge torn down. Public ports stay reserved so an
    /// explicit re-`start` picks up exactly where the crash left off.
    async fn on_tunnel_exit(&self, notice: TunnelNotice) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        // A newer restart owns the tunnel now; this exit is history.
        if notice.generation != inner.supervisor.generation() {
            return;
        }

        let affected: Vec<MappingId> = inner
            .mappings
            .iter()
            .filter(|(_, m)| m.state == MappingState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        if affected.is_empty() {
            return;
        }
        warn!(
            "Forwarding client exited unexpectedly ({}), failing {} running mapping(s)",
            notice.status,
            affected.len()
        );

        let message = Error::ProcessCrashed(notice.status).to_string();
        for id in &affected {
            self.teardown_bridge(inner, id).await;
            if let Some(mapping) = inner.mappings.get_mut(id) {
                mapping.state = MappingState::Error;
                mapping.last_error = Some(message.clone());
            }
            self.emit(id, MappingState::Error, Some(message.clone()));
        }
    }

    /// Land a failed start in Error, keeping the public port reserved.
    fn fail_start(&self, inner: &mut Inner, id: &str, err: Error) -> Result<(), Error> {
        let message = err.to_string();
        if let Some(mapping) = inner.mappings.get_mut(id) {
            mapping.state = MappingState::Error;
            mapping.last_error = Some(message.clone());
        }
        self.emit(id, MappingState::Error, Some(message));
        warn!("Mapping {id}: start failed: {err}");
        Err(err)
    }

    /// Fail all Running mappings to Error (used when a restart on behalf of
    /// a `stop` fails and leaves the survivors dark). Bridges are torn down
    /// and loopback ports released, same as the crash path, so a later
    /// `start` does not trip over a stale device claim.
    async fn fail_running(&self, inner: &mut Inner, message: &str) {
        let affected: Vec<MappingId> = inner
            .mappings
            .iter()
            .filter(|(_, m)| m.state == MappingState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &affected {
            self.teardown_bridge(inner, id).await;
            if let Some(mapping) = inner.mappings.get_mut(id) {
                mapping.state = MappingState::Error;
                mapping.last_error = Some(message.to_string());
            }
            self.emit(id, MappingState::Error, Some(message.to_string()));
        }
    }

    /// Stop and forget a mapping's bridge, releasing its loopback port.
    async fn teardown_bridge(&self, inner: &mut Inner, id: &str) {
        if let Some(mut bridge) = inner.bridges.remove(id) {
            bridge.stop().await;
        }
        if let Some(mapping) = inner.mappings.get_mut(id) {
            if let Some(local_port) = mapping.local_port.take() {
                inner.local_ports.release(local_port);
            }
        }
    }

    /// Forwarding stanzas for all Running mappings, plus the one named in
    /// `include` (the mapping currently Starting). Sorted for deterministic
    /// config output.
    ///
    /// Stanza names are suffixed with the public port: the client rejects a
    /// config with a repeated section name, and user-supplied mapping names
    /// are not required to be unique. Public ports are — every rendered
    /// mapping holds a reservation.
    fn stanzas(&self, inner: &Inner, include: Option<&str>) -> Vec<TunnelStanza> {
        let mut stanzas: Vec<TunnelStanza> = inner
            .mappings
            .iter()
            .filter(|(id, m)| {
                m.state == MappingState::Running || Some(id.as_str()) == include
            })
            .map(|(_, m)| {
                let name = match &m.name {
                    Some(name) => format!("{name}-{}", m.public_port),
                    None => format!("pg-{}", m.public_port),
                };
                match &m.source {
                    MappingSource::Serial { .. } => TunnelStanza {
                        name,
                        public_port: m.public_port,
                        local_host: self.config.bridge.bind.clone(),
                        local_port: m.local_port.unwrap_or_default(),
                    },
                    MappingSource::Tcp { host, port } => TunnelStanza {
                        name,
                        public_port: m.public_port,
                        local_host: host.clone(),
                        local_port: *port,
                    },
                }
            })
            .collect();
        stanzas.sort_by(|a, b| a.name.cmp(&b.name));
        stanzas
    }

    fn emit(&self, id: &str, state: MappingState, message: Option<String>) {
        let _ = self.events.send(Event::State {
            id: id.to_string(),
            state,
            message,
        });
    }

    #[cfg(test)]
    pub(crate) async fn port_reserved(&self, port: u16) -> bool {
        self.inner.lock().await.allocator.is_reserved(port)
    }

    #[cfg(test)]
    pub(crate) async fn tunnel_running(&self) -> bool {
        self.inner.lock().await.supervisor.is_running()
    }

    #[cfg(test)]
    pub(crate) async fn inject_bridge(&self, id: &str, bridge: Bridge) {
        self.inner.lock().await.bridges.insert(id.to_string(), bridge);
    }

    #[cfg(test)]
    pub(crate) async fn device_claimed(&self, device: &str) -> bool {
        self.inner
            .lock()
            .await
            .bridges
            .values()
            .any(|b| b.device == device)
    }

    #[cfg(test)]
    pub(crate) async fn config_path(&self) -> Option<std::path::PathBuf> {
        self.inner
            .lock()
            .await
            .writer
            .path()
            .map(std::path::Path::to_path_buf)
    }
}

fn info_for(id: &str, mapping: &Mapping) -> MappingInfo {
    MappingInfo {
        id: id.to_string(),
        name: mapping.name.clone(),
        source: mapping.source.clone(),
        public_port: mapping.public_port,
        local_port: mapping.local_port,
        state: mapping.state,
        last_error: mapping.last_error.clone(),
    }
}

fn validate(spec: &MappingSpec) -> Result<(), Error> {
    match &spec.source {
        MappingSource::Serial { device, baud } => {
            if device.is_empty() {
                return Err(Error::InvalidMapping("serial device must not be empty".into()));
            }
            if *baud == 0 {
                return Err(Error::InvalidMapping("baud rate must be non-zero".into()));
            }
        }
        MappingSource::Tcp { host, port } => {
            if host.is_empty() {
                return Err(Error::InvalidMapping("target host must not be empty".into()));
            }
            if *port == 0 {
                return Err(Error::InvalidMapping("target port must be non-zero".into()));
            }
        }
    }
    Ok(())
}
