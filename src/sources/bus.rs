//! jackdbus adapter
//!
//! Mirrors the JACK graph through `org.jackaudio.JackPatchbay` on the
//! session bus and asks a2jmidid for the name of its JACK client.
//!
//! Ordering: signal subscriptions are registered before the graph is
//! fetched; signals queued meanwhile carry a graph version and are dropped
//! unless newer than the fetched graph.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Instant;

use zbus::blocking::{Connection, MessageIterator};
use zbus::message::{Message, Type as MessageType};
use zbus::MatchRule;

use super::backoff::Backoff;
use super::error::{SourceError, SourceResult};
use super::events::{BusClient, BusConnection, BusEvent, BusPort, SourceEvent};

const JACK_SERVICE: &str = "org.jackaudio.service";
const JACK_PATH: &str = "/org/jackaudio/Controller";
const PATCHBAY_IFACE: &str = "org.jackaudio.JackPatchbay";
const CONTROL_IFACE: &str = "org.jackaudio.JackControl";

const BRIDGE_SERVICE: &str = "org.gna.home.a2jmidid";
const BRIDGE_PATH: &str = "/";
const BRIDGE_IFACE: &str = "org.gna.home.a2jmidid.control";

const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const DBUS_IFACE: &str = "org.freedesktop.DBus";

type RawPort = (u64, String, u32, u32);
type RawClient = (u64, String, Vec<RawPort>);
type RawConnection = (u64, String, u64, String, u64, String, u64, String, u64);

/// Reply of `GetGraph`: version, clients, connections
pub type RawGraph = (u64, Vec<RawClient>, Vec<RawConnection>);

fn connection_from_raw(raw: RawConnection) -> BusConnection {
    let (_, out_client, _, out_port, _, in_client, _, in_port, id) = raw;
    BusConnection {
        out_client,
        out_port,
        in_client,
        in_port,
        id,
    }
}

/// Convert a `GetGraph` reply into a [`BusEvent::Graph`].
pub fn graph_from_raw(raw: RawGraph) -> BusEvent {
    let (version, clients, connections) = raw;
    BusEvent::Graph {
        version,
        clients: clients
            .into_iter()
            .map(|(id, name, ports)| BusClient {
                id,
                name,
                ports: ports
                    .into_iter()
                    .map(|(id, name, flags, port_type)| BusPort {
                        id,
                        name,
                        flags,
                        port_type,
                    })
                    .collect(),
            })
            .collect(),
        connections: connections.into_iter().map(connection_from_raw).collect(),
    }
}

/// Drops signals that the fetched graph already reflects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VersionGate {
    version: u64,
}

impl VersionGate {
    pub fn reset(&mut self, version: u64) {
        self.version = version;
    }

    pub fn admit(&mut self, version: u64) -> bool {
        if version <= self.version {
            return false;
        }
        self.version = version;
        true
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PatchbaySignal {
    Event(BusEvent),
    /// Port renamed: refetch rather than patch the graph
    Refetch,
}

fn decode_patchbay(member: &str, msg: &Message) -> zbus::Result<Option<(u64, PatchbaySignal)>> {
    let body = msg.body();
    let decoded = match member {
        "ClientAppeared" => {
            let (v, _, client): (u64, u64, String) = body.deserialize()?;
            (v, PatchbaySignal::Event(BusEvent::ClientAppeared { client }))
        }
        "ClientDisappeared" => {
            let (v, _, client): (u64, u64, String) = body.deserialize()?;
            (v, PatchbaySignal::Event(BusEvent::ClientDisappeared { client }))
        }
        "ClientRenamed" => {
            let (v, _, old_name, new_name): (u64, u64, String, String) = body.deserialize()?;
            (
                v,
                PatchbaySignal::Event(BusEvent::ClientRenamed { old_name, new_name }),
            )
        }
        "PortAppeared" => {
            let (v, _, client, id, name, flags, port_type): (u64, u64, String, u64, String, u32, u32) =
                body.deserialize()?;
            let port = BusPort {
                id,
                name,
                flags,
                port_type,
            };
            (v, PatchbaySignal::Event(BusEvent::PortAppeared { client, port }))
        }
        "PortDisappeared" => {
            let (v, _, client, _, port): (u64, u64, String, u64, String) = body.deserialize()?;
            (v, PatchbaySignal::Event(BusEvent::PortDisappeared { client, port }))
        }
        "PortRenamed" => {
            let (v, ..): (u64, u64, u64, String, String, String) = body.deserialize()?;
            (v, PatchbaySignal::Refetch)
        }
        "PortsConnected" | "PortsDisconnected" => {
            let (v, a, b, c, d, e, f, g, h, id): (
                u64,
                u64,
                String,
                u64,
                String,
                u64,
                String,
                u64,
                String,
                u64,
            ) = body.deserialize()?;
            let connection = connection_from_raw((a, b, c, d, e, f, g, h, id));
            let event = if member == "PortsConnected" {
                BusEvent::PortsConnected(connection)
            } else {
                BusEvent::PortsDisconnected(connection)
            };
            (v, PatchbaySignal::Event(event))
        }
        _ => return Ok(None),
    };
    Ok(Some(decoded))
}

#[derive(Debug)]
enum Inbound {
    Signal(Message),
    Resync,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Mirror the JACK graph from jackdbus
    pub mirror_graph: bool,
    /// Track the a2jmidid client name
    pub track_bridge: bool,
    pub backoff: Backoff,
}

/// Handle to the bus thread
#[derive(Debug, Clone)]
pub struct BusHandle {
    inbound: Sender<Inbound>,
}

impl BusHandle {
    /// Refetch the graph and post it as a new snapshot.
    pub fn resync(&self) {
        let _ = self.inbound.send(Inbound::Resync);
    }
}

fn subscribe(conn: &Connection, rule: MatchRule<'static>, inbound: &Sender<Inbound>) -> SourceResult<()> {
    let iter = MessageIterator::for_match_rule(rule, conn, None)?;
    let inbound = inbound.clone();
    std::thread::Builder::new()
        .name("patchmirror-dbus-signals".into())
        .spawn(move || {
            for msg in iter {
                match msg {
                    Ok(msg) => {
                        if inbound.send(Inbound::Signal(msg)).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::debug!("D-Bus signal stream error: {}", e),
                }
            }
        })
        .map_err(|e| SourceError::Unavailable(format!("signal thread: {}", e)))?;
    Ok(())
}

fn owner_changed_rule(name: &'static str) -> zbus::Result<MatchRule<'static>> {
    Ok(MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender(DBUS_SERVICE)?
        .path(DBUS_PATH)?
        .interface(DBUS_IFACE)?
        .member("NameOwnerChanged")?
        .arg(0, name)?
        .build())
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    attempt: u32,
    at: Instant,
}

struct BusSession {
    conn: Connection,
    config: BusConfig,
    tx: Sender<SourceEvent>,
    gate: VersionGate,
    attached: bool,
    retry: Option<Retry>,
    /// Attempts made since the last successful attach
    attempts: u32,
}

impl BusSession {
    fn post(&self, event: BusEvent) -> bool {
        self.tx.send(SourceEvent::Bus(event)).is_ok()
    }

    fn call<B, R>(&self, service: &str, path: &str, iface: &str, method: &str, body: &B) -> SourceResult<R>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
        R: serde::de::DeserializeOwned + zbus::zvariant::Type,
    {
        let reply = self
            .conn
            .call_method(Some(service), path, Some(iface), method, body)?;
        Ok(reply.body().deserialize()?)
    }

    fn resolve_bridge_client_name(&self) -> Option<String> {
        match self.call::<_, String>(BRIDGE_SERVICE, BRIDGE_PATH, BRIDGE_IFACE, "get_jack_client_name", &()) {
            Ok(name) => Some(name),
            Err(e) => {
                log::debug!("a2jmidid client name unavailable: {}", e);
                None
            }
        }
    }

    fn refresh_bridge(&self) -> bool {
        if !self.config.track_bridge {
            return true;
        }
        self.post(BusEvent::BridgeClientName(self.resolve_bridge_client_name()))
    }

    fn fetch_graph(&mut self) -> SourceResult<()> {
        let raw: RawGraph = self.call(JACK_SERVICE, JACK_PATH, PATCHBAY_IFACE, "GetGraph", &(0u64,))?;
        self.gate.reset(raw.0);
        log::debug!("Fetched jackdbus graph version {}", raw.0);
        self.post(graph_from_raw(raw));
        Ok(())
    }

    fn attach(&mut self) -> SourceResult<()> {
        let started: bool = self.call(JACK_SERVICE, JACK_PATH, CONTROL_IFACE, "IsStarted", &())?;
        if !started {
            return Err(SourceError::Unavailable("JACK server".into()));
        }
        self.post(BusEvent::Attached);
        self.fetch_graph()?;
        self.attached = true;
        self.retry = None;
        self.attempts = 0;
        log::info!("Attached to jackdbus");
        Ok(())
    }

    /// Attach now; on failure schedule a retry if attempts are left.
    fn try_attach(&mut self) {
        if !self.config.mirror_graph || self.attached {
            return;
        }
        match self.attach() {
            Ok(()) => {}
            Err(e) => {
                if self.attempts == 0 {
                    log::info!("jackdbus not ready: {}", e);
                } else {
                    log::debug!("jackdbus attach attempt {} failed: {}", self.attempts, e);
                }
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        match self.config.backoff.delay(self.attempts) {
            Some(delay) => {
                self.retry = Some(Retry {
                    attempt: self.attempts,
                    at: Instant::now() + delay,
                });
                self.attempts += 1;
            }
            None => {
                log::warn!(
                    "jackdbus unavailable after {} attempts; waiting for the server to announce itself",
                    self.attempts
                );
                self.retry = None;
            }
        }
    }

    fn lose(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        self.gate.reset(0);
        log::info!("Lost jackdbus");
        self.post(BusEvent::Lost);
    }

    fn handle_patchbay(&mut self, member: &str, msg: &Message) {
        if !self.attached {
            return;
        }
        let (version, signal) = match decode_patchbay(member, msg) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return,
            Err(e) => {
                log::debug!("Malformed {} signal: {}", member, e);
                return;
            }
        };
        if !self.gate.admit(version) {
            log::debug!("Dropping stale {} (version {})", member, version);
            return;
        }
        match signal {
            PatchbaySignal::Event(event) => {
                self.post(event);
            }
            PatchbaySignal::Refetch => {
                if let Err(e) = self.fetch_graph() {
                    log::warn!("jackdbus refetch failed: {}", e);
                    self.lose();
                    self.schedule_retry();
                }
            }
        }
    }

    fn handle_owner_changed(&mut self, msg: &Message) {
        let Ok((name, _old, new_owner)) = msg.body().deserialize::<(String, String, String)>() else {
            return;
        };
        match name.as_str() {
            JACK_SERVICE if new_owner.is_empty() => self.lose(),
            JACK_SERVICE => {
                self.attempts = 0;
                self.try_attach();
            }
            BRIDGE_SERVICE if new_owner.is_empty() => {
                self.post(BusEvent::BridgeClientName(None));
            }
            BRIDGE_SERVICE => {
                self.refresh_bridge();
            }
            _ => {}
        }
    }

    fn handle(&mut self, msg: Message) {
        let header = msg.header();
        let iface = header.interface().map(|i| i.to_string()).unwrap_or_default();
        let member = header.member().map(|m| m.to_string()).unwrap_or_default();

        match iface.as_str() {
            PATCHBAY_IFACE => self.handle_patchbay(&member, &msg),
            CONTROL_IFACE => match member.as_str() {
                "ServerStarted" => {
                    self.attempts = 0;
                    self.try_attach();
                }
                "ServerStopped" => self.lose(),
                _ => {}
            },
            BRIDGE_IFACE => {
                self.refresh_bridge();
            }
            DBUS_IFACE if member == "NameOwnerChanged" => self.handle_owner_changed(&msg),
            _ => {}
        }
    }

    fn resync(&mut self) {
        if !self.attached {
            self.try_attach();
            return;
        }
        if let Err(e) = self.fetch_graph() {
            log::warn!("jackdbus resync failed: {}", e);
            self.lose();
            self.schedule_retry();
        }
    }
}

fn open(config: &BusConfig, inbound: &Sender<Inbound>) -> SourceResult<Connection> {
    let conn = Connection::session()?;

    if config.mirror_graph {
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender(JACK_SERVICE)?
            .path(JACK_PATH)?
            .build();
        subscribe(&conn, rule, inbound)?;
        subscribe(&conn, owner_changed_rule(JACK_SERVICE)?, inbound)?;
    }
    if config.track_bridge {
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender(BRIDGE_SERVICE)?
            .interface(BRIDGE_IFACE)?
            .build();
        subscribe(&conn, rule, inbound)?;
        subscribe(&conn, owner_changed_rule(BRIDGE_SERVICE)?, inbound)?;
    }

    Ok(conn)
}

fn run(config: BusConfig, tx: Sender<SourceEvent>, inbound_tx: Sender<Inbound>, inbound_rx: Receiver<Inbound>) {
    let conn = match open(&config, &inbound_tx) {
        Ok(conn) => conn,
        Err(e) => {
            log::warn!("Session bus unavailable, bus source disabled: {}", e);
            return;
        }
    };
    drop(inbound_tx);

    let mut session = BusSession {
        conn,
        config,
        tx,
        gate: VersionGate::default(),
        attached: false,
        retry: None,
        attempts: 0,
    };

    if !session.refresh_bridge() {
        return;
    }
    session.try_attach();

    loop {
        let next = match session.retry {
            Some(retry) => {
                let wait = retry.at.saturating_duration_since(Instant::now());
                match inbound_rx.recv_timeout(wait) {
                    Ok(next) => Some(next),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match inbound_rx.recv() {
                Ok(next) => Some(next),
                Err(_) => break,
            },
        };

        match next {
            Some(Inbound::Signal(msg)) => session.handle(msg),
            Some(Inbound::Resync) => session.resync(),
            None => {
                if let Some(retry) = session.retry.take() {
                    log::debug!("jackdbus retry {}", retry.attempt + 1);
                }
                session.try_attach();
            }
        }
    }
    log::debug!("Bus thread stopped");
}

/// Start the bus thread.
pub fn start(config: BusConfig, tx: Sender<SourceEvent>) -> std::io::Result<BusHandle> {
    let (inbound_tx, inbound_rx) = std::sync::mpsc::channel();
    let handle = BusHandle {
        inbound: inbound_tx.clone(),
    };

    std::thread::Builder::new()
        .name("patchmirror-dbus".into())
        .spawn(move || run(config, tx, inbound_tx, inbound_rx))?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_graph() -> RawGraph {
        (
            42,
            vec![
                (
                    1,
                    "system".to_string(),
                    vec![
                        (1, "capture_1".to_string(), 0x2 | 0x4, 0),
                        (2, "playback_1".to_string(), 0x1 | 0x4, 0),
                    ],
                ),
                (
                    2,
                    "synth".to_string(),
                    vec![(3, "out_L".to_string(), 0x2, 0)],
                ),
            ],
            vec![(
                2,
                "synth".to_string(),
                3,
                "out_L".to_string(),
                1,
                "system".to_string(),
                2,
                "playback_1".to_string(),
                9,
            )],
        )
    }

    #[test]
    fn test_graph_from_raw() {
        let BusEvent::Graph {
            version,
            clients,
            connections,
        } = graph_from_raw(raw_graph())
        else {
            panic!("expected graph");
        };
        assert_eq!(version, 42);
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].ports[1].name, "playback_1");
        assert_eq!(clients[0].ports[1].flags, 0x5);
        assert_eq!(
            connections,
            vec![BusConnection {
                out_client: "synth".to_string(),
                out_port: "out_L".to_string(),
                in_client: "system".to_string(),
                in_port: "playback_1".to_string(),
                id: 9,
            }]
        );
    }

    #[test]
    fn test_version_gate_drops_stale() {
        let mut gate = VersionGate::default();
        gate.reset(10);
        assert!(!gate.admit(9));
        assert!(!gate.admit(10));
        assert!(gate.admit(11));
        assert!(!gate.admit(11));
        assert!(gate.admit(15));
    }
}
