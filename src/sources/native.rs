//! In-process JACK client adapter
//!
//! Opens a JACK client without ports, registers notification callbacks and
//! posts one [`NativeEvent`] per callback. A supervisor thread owns the
//! client and reopens it with backoff after the server goes away.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};

use parking_lot::Mutex;

use super::backoff::Backoff;
use super::error::SourceResult;
use super::events::{JackPortInfo, NativeEvent, SourceEvent};

/// JACK port id → full name, so unregistrations and disconnects can be
/// resolved after the port is gone.
///
/// The mutex around it doubles as the gate that keeps callbacks from being
/// posted while an enumeration snapshot is being built.
type PortNames = HashMap<jack::PortId, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Server shut the client down
    Lost,
    /// Post a fresh snapshot
    Resync,
}

#[derive(Debug, Clone)]
pub struct NativeConfig {
    pub client_name: String,
    pub backoff: Backoff,
}

/// Handle to the supervisor thread
#[derive(Debug, Clone)]
pub struct NativeHandle {
    control: Sender<Control>,
}

impl NativeHandle {
    /// Re-enumerate and post a new snapshot, e.g. after the MIDI bridge
    /// client name became known.
    pub fn resync(&self) {
        let _ = self.control.send(Control::Resync);
    }
}

fn port_info(port: &jack::Port<jack::Unowned>) -> SourceResult<JackPortInfo> {
    let flags = port.flags();
    Ok(JackPortInfo {
        name: port.name()?,
        is_input: flags.contains(jack::PortFlags::IS_INPUT),
        is_physical: flags.contains(jack::PortFlags::IS_PHYSICAL),
        port_type: port.port_type()?,
        aliases: port.aliases().unwrap_or_default(),
    })
}

/// Current links of `port`, output side first.
fn connections_of(
    client: &jack::Client,
    port: &jack::Port<jack::Unowned>,
    info: &JackPortInfo,
) -> Vec<(String, String)> {
    let peer_flags = if info.is_input {
        jack::PortFlags::IS_OUTPUT
    } else {
        jack::PortFlags::IS_INPUT
    };
    client
        .ports(None, None, peer_flags)
        .into_iter()
        .filter(|peer| port.is_connected_to(peer).unwrap_or(false))
        .map(|peer| {
            if info.is_input {
                (peer, info.name.clone())
            } else {
                (info.name.clone(), peer)
            }
        })
        .collect()
}

/// Every port of the server and every link between them.
fn enumerate(client: &jack::Client) -> (Vec<JackPortInfo>, Vec<(String, String)>) {
    let mut ports = Vec::new();
    let mut linked = Vec::new();

    for name in client.ports(None, None, jack::PortFlags::empty()) {
        let Some(port) = client.port_by_name(&name) else {
            continue;
        };
        match port_info(&port) {
            Ok(info) => {
                if !info.is_input && port.connected_count().unwrap_or(0) > 0 {
                    linked.push((port, info.name.clone()));
                }
                ports.push(info);
            }
            Err(e) => log::debug!("Skipping JACK port {}: {}", name, e),
        }
    }

    let inputs: Vec<&str> = ports
        .iter()
        .filter(|p| p.is_input)
        .map(|p| p.name.as_str())
        .collect();
    let mut connections = Vec::new();
    for (port, output) in &linked {
        for input in &inputs {
            if port.is_connected_to(input).unwrap_or(false) {
                connections.push((output.clone(), input.to_string()));
            }
        }
    }

    (ports, connections)
}

fn publish_snapshot(client: &jack::Client, names: &Mutex<PortNames>, tx: &Sender<SourceEvent>) {
    let _gate = names.lock();
    let (ports, connections) = enumerate(client);
    log::debug!(
        "JACK enumeration: {} ports, {} connections",
        ports.len(),
        connections.len()
    );
    let _ = tx.send(SourceEvent::Native(NativeEvent::Snapshot { ports, connections }));
}

struct Notifications {
    tx: Sender<SourceEvent>,
    control: Sender<Control>,
    names: Arc<Mutex<PortNames>>,
}

impl Notifications {
    fn post(&self, event: NativeEvent) {
        let _ = self.tx.send(SourceEvent::Native(event));
    }

    fn resolve(&self, client: &jack::Client, names: &mut PortNames, id: jack::PortId) -> Option<String> {
        if let Some(name) = names.get(&id) {
            return Some(name.clone());
        }
        let name = client.port_by_id(id)?.name().ok()?;
        names.insert(id, name.clone());
        Some(name)
    }
}

impl jack::NotificationHandler for Notifications {
    fn shutdown(&mut self, _status: jack::ClientStatus, reason: &str) {
        self.post(NativeEvent::Shutdown {
            reason: reason.to_string(),
        });
        let _ = self.control.send(Control::Lost);
    }

    fn client_registration(&mut self, _: &jack::Client, name: &str, is_registered: bool) {
        let _gate = self.names.lock();
        self.post(NativeEvent::ClientRegistered {
            name: name.to_string(),
            registered: is_registered,
        });
    }

    fn port_registration(&mut self, client: &jack::Client, port_id: jack::PortId, is_registered: bool) {
        let names = self.names.clone();
        let mut names = names.lock();

        if is_registered {
            match client.port_by_id(port_id).map(|p| port_info(&p)) {
                Some(Ok(info)) => {
                    names.insert(port_id, info.name.clone());
                    self.post(NativeEvent::PortRegistered(info));
                }
                Some(Err(e)) => log::debug!("JACK port {} unreadable: {}", port_id, e),
                None => log::debug!("JACK port {} vanished before lookup", port_id),
            }
            return;
        }

        let name = names
            .remove(&port_id)
            .or_else(|| client.port_by_id(port_id).and_then(|p| p.name().ok()));
        match name {
            Some(name) => self.post(NativeEvent::PortUnregistered { name }),
            None => log::debug!("Unregistered JACK port {} has no known name", port_id),
        }
    }

    fn port_rename(
        &mut self,
        client: &jack::Client,
        port_id: jack::PortId,
        old_name: &str,
        new_name: &str,
    ) -> jack::Control {
        let names = self.names.clone();
        let mut names = names.lock();
        names.insert(port_id, new_name.to_string());

        let Some(port) = client.port_by_id(port_id) else {
            log::debug!("Renamed JACK port {} vanished", port_id);
            return jack::Control::Continue;
        };
        match port_info(&port) {
            Ok(info) => {
                let connections = connections_of(client, &port, &info);
                self.post(NativeEvent::PortRenamed {
                    old_name: old_name.to_string(),
                    port: info,
                    connections,
                });
            }
            Err(e) => log::debug!("Renamed JACK port {} unreadable: {}", new_name, e),
        }
        jack::Control::Continue
    }

    fn ports_connected(
        &mut self,
        client: &jack::Client,
        port_id_a: jack::PortId,
        port_id_b: jack::PortId,
        are_connected: bool,
    ) {
        let names = self.names.clone();
        let mut names = names.lock();
        let a = self.resolve(client, &mut names, port_id_a);
        let b = self.resolve(client, &mut names, port_id_b);
        let (Some(output), Some(input)) = (a, b) else {
            log::debug!("JACK connection {} -> {} has unknown ends", port_id_a, port_id_b);
            return;
        };
        self.post(NativeEvent::PortsConnected {
            output,
            input,
            connected: are_connected,
        });
    }
}

type ActiveClient = jack::AsyncClient<Notifications, ()>;

struct Session {
    client: ActiveClient,
    names: Arc<Mutex<PortNames>>,
}

fn attach(
    config: &NativeConfig,
    tx: &Sender<SourceEvent>,
    control: &Sender<Control>,
) -> SourceResult<Session> {
    let (client, status) =
        jack::Client::new(&config.client_name, jack::ClientOptions::NO_START_SERVER)?;
    log::info!("JACK client '{}' opened ({:?})", client.name(), status);
    let _ = tx.send(SourceEvent::Native(NativeEvent::Attached));

    let names = Arc::new(Mutex::new(PortNames::new()));
    let handler = Notifications {
        tx: tx.clone(),
        control: control.clone(),
        names: names.clone(),
    };
    let client = client.activate_async(handler, ())?;
    publish_snapshot(client.as_client(), &names, tx);

    Ok(Session { client, names })
}

/// Serve control messages until the client is lost. Returns false when the
/// handle side hung up.
fn serve(session: &Session, control_rx: &Receiver<Control>, tx: &Sender<SourceEvent>) -> bool {
    loop {
        match control_rx.recv() {
            Ok(Control::Resync) => publish_snapshot(session.client.as_client(), &session.names, tx),
            Ok(Control::Lost) => return true,
            Err(_) => return false,
        }
    }
}

fn supervise(
    config: NativeConfig,
    tx: Sender<SourceEvent>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
) {
    let mut attempt = 0;
    loop {
        match attach(&config, &tx, &control_tx) {
            Ok(session) => {
                attempt = 0;
                let lost = serve(&session, &control_rx, &tx);
                drop(session);
                if !lost {
                    return;
                }
                log::info!("JACK connection lost, reconnecting");
            }
            Err(e) if attempt == 0 => log::warn!("JACK unavailable: {}", e),
            Err(e) => log::debug!("JACK reconnect attempt {} failed: {}", attempt, e),
        }

        let Some(delay) = config.backoff.delay(attempt) else {
            log::error!("JACK still unavailable after {} attempts, native source disabled", attempt);
            return;
        };
        attempt += 1;
        if let Err(RecvTimeoutError::Disconnected) = control_rx.recv_timeout(delay) {
            return;
        }
    }
}

/// Start the JACK supervisor thread.
pub fn start(config: NativeConfig, tx: Sender<SourceEvent>) -> std::io::Result<NativeHandle> {
    let (control_tx, control_rx) = std::sync::mpsc::channel();
    let handle = NativeHandle {
        control: control_tx.clone(),
    };

    std::thread::Builder::new()
        .name("patchmirror-jack".into())
        .spawn(move || supervise(config, tx, control_tx, control_rx))?;

    Ok(handle)
}
