//! ALSA sequencer adapter
//!
//! The sequencer has no notification API we can reach from here, so the
//! topology is read from `aconnect` listings on every poll:
//!
//! - `aconnect -i` lists readable ports (they produce data: outputs)
//! - `aconnect -o` lists writable ports (they consume data: inputs)
//! - `aconnect -l` lists every port with its connection trailers
//!
//! ```text
//! client 14: 'Midi Through' [type=kernel]
//!     0 'Midi Through Port-0'
//! 	Connecting To: 128:0
//! 	Connected From: 20:0, 24:1[real:0]
//! ```
//!
//! A port that is both readable and writable shows up in both listings and
//! becomes two ports, one per direction, so raw names carry the direction:
//! `14:0/capture` and `14:0/playback`.

use std::collections::HashMap;
use std::process::Command;
use std::sync::mpsc::{Sender, SyncSender};

use super::error::{SourceError, SourceResult};
use super::events::{AlsaEvent, SourceEvent};
use crate::graph::PortDirection;

/// One client header and the ports listed under it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlsaClient {
    pub id: i32,
    pub name: String,
    pub is_kernel: bool,
    pub ports: Vec<AlsaPort>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlsaPort {
    pub id: i32,
    pub name: String,
    /// `client:port` addresses from `Connected From:` trailers
    pub connected_from: Vec<(i32, i32)>,
}

/// Parsed output of one `aconnect` invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlsaListing {
    pub clients: Vec<AlsaClient>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line<'a> {
    Client {
        id: i32,
        name: &'a str,
        is_kernel: bool,
    },
    Port {
        id: i32,
        name: &'a str,
    },
    ConnectedFrom(&'a str),
    ConnectingTo,
}

fn quoted(text: &str) -> Option<(&str, &str)> {
    let start = text.find('\'')?;
    let end = text.rfind('\'')?;
    (end > start).then(|| (&text[start + 1..end], &text[end + 1..]))
}

fn classify(line: &str) -> Option<Line<'_>> {
    if let Some(rest) = line.strip_prefix("client ") {
        let (id, rest) = rest.split_once(':')?;
        let id = id.trim().parse().ok()?;
        let (name, tail) = quoted(rest)?;
        return Some(Line::Client {
            id,
            name,
            is_kernel: tail.contains("type=kernel"),
        });
    }

    if line.starts_with('\t') {
        let trimmed = line.trim();
        if let Some(list) = trimmed.strip_prefix("Connected From:") {
            return Some(Line::ConnectedFrom(list));
        }
        if trimmed.starts_with("Connecting To:") {
            return Some(Line::ConnectingTo);
        }
        return None;
    }

    if line.starts_with(' ') {
        let trimmed = line.trim_start();
        let (id, rest) = trimmed.split_once(' ')?;
        let id = id.parse().ok()?;
        let (name, _) = quoted(rest)?;
        return Some(Line::Port { id, name });
    }

    None
}

/// Parse a `client:port` address, dropping decorations like `[real:0]`.
fn parse_address(text: &str) -> Option<(i32, i32)> {
    let text = text.trim();
    let text = match text.find('[') {
        Some(i) => &text[..i],
        None => text,
    };
    let (client, port) = text.split_once(':')?;
    Some((client.trim().parse().ok()?, port.trim().parse().ok()?))
}

/// Parse one listing. Malformed lines are skipped and reset the current
/// client/port context; parsing never fails as a whole.
pub fn parse_listing(text: &str) -> AlsaListing {
    let mut listing = AlsaListing::default();
    let mut in_client = false;
    let mut in_port = false;

    for (number, line) in text.lines().enumerate() {
        match classify(line) {
            Some(Line::Client {
                id,
                name,
                is_kernel,
            }) => {
                listing.clients.push(AlsaClient {
                    id,
                    name: name.trim().to_string(),
                    is_kernel,
                    ports: Vec::new(),
                });
                in_client = true;
                in_port = false;
            }
            Some(Line::Port { id, name }) if in_client => {
                if let Some(client) = listing.clients.last_mut() {
                    client.ports.push(AlsaPort {
                        id,
                        name: name.trim().to_string(),
                        connected_from: Vec::new(),
                    });
                    in_port = true;
                }
            }
            Some(Line::ConnectedFrom(list)) if in_port => {
                let Some(port) = listing
                    .clients
                    .last_mut()
                    .and_then(|c| c.ports.last_mut())
                else {
                    continue;
                };
                for entry in list.split(',') {
                    match parse_address(entry) {
                        Some(addr) => port.connected_from.push(addr),
                        None => log::debug!(
                            "aconnect line {}: bad address {:?}",
                            number + 1,
                            entry
                        ),
                    }
                }
            }
            // Mirror image of the peer's Connected From line
            Some(Line::ConnectingTo) if in_port => {}
            Some(_) => {
                log::debug!("aconnect line {}: out of context: {:?}", number + 1, line);
            }
            None => {
                if !line.trim().is_empty() {
                    log::debug!("aconnect line {}: skipped: {:?}", number + 1, line);
                }
                in_client = false;
                in_port = false;
            }
        }
    }

    listing
}

impl AlsaListing {
    /// Rewrite client names that other backends know under another name.
    pub fn canonicalize(&mut self, table: &HashMap<String, String>) {
        for client in &mut self.clients {
            if let Some(canonical) = table.get(&client.name) {
                client.name = canonical.clone();
            }
        }
    }
}

pub fn raw_port_name(client: i32, port: i32, direction: PortDirection) -> String {
    let side = match direction {
        PortDirection::Output => "capture",
        PortDirection::Input => "playback",
    };
    format!("{}:{}/{}", client, port, side)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlsaGroupEntry {
    pub client_id: i32,
    pub name: String,
    pub is_hardware: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlsaPortEntry {
    pub group_name: String,
    pub port_name: String,
    pub raw_name: String,
    pub direction: PortDirection,
    pub is_hardware: bool,
}

/// Result of one poll cycle: the capture and playback listings merged with
/// the connection listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlsaInventory {
    groups: Vec<AlsaGroupEntry>,
    ports: Vec<AlsaPortEntry>,
    connections: Vec<(String, String)>,
}

impl AlsaInventory {
    /// Merge a port listing; `direction` says which side it enumerates.
    pub fn add_ports(&mut self, direction: PortDirection, listing: &AlsaListing) {
        for client in &listing.clients {
            if !self.groups.iter().any(|g| g.client_id == client.id) {
                self.groups.push(AlsaGroupEntry {
                    client_id: client.id,
                    name: client.name.clone(),
                    is_hardware: client.is_kernel,
                });
            }
            for port in &client.ports {
                let raw_name = raw_port_name(client.id, port.id, direction);
                if self.ports.iter().any(|p| p.raw_name == raw_name) {
                    continue;
                }
                self.ports.push(AlsaPortEntry {
                    group_name: client.name.clone(),
                    port_name: port.name.clone(),
                    raw_name,
                    direction,
                    is_hardware: client.is_kernel,
                });
            }
        }
    }

    /// Merge the connection trailers of a full listing.
    pub fn add_connections(&mut self, listing: &AlsaListing) {
        for client in &listing.clients {
            for port in &client.ports {
                let input = raw_port_name(client.id, port.id, PortDirection::Input);
                for &(src_client, src_port) in &port.connected_from {
                    let output = raw_port_name(src_client, src_port, PortDirection::Output);
                    let pair = (output, input.clone());
                    if !self.connections.contains(&pair) {
                        self.connections.push(pair);
                    }
                }
            }
        }
    }

    pub fn poll_groups(&self) -> &[AlsaGroupEntry] {
        &self.groups
    }

    pub fn poll_ports(&self, direction: PortDirection) -> Vec<&AlsaPortEntry> {
        self.ports
            .iter()
            .filter(|p| p.direction == direction)
            .collect()
    }

    pub fn poll_connections(&self) -> &[(String, String)] {
        &self.connections
    }
}

/// Runs `aconnect` and parses its listings.
pub struct AlsaTextAdapter {
    command: String,
    canonical_names: HashMap<String, String>,
}

impl AlsaTextAdapter {
    pub fn new(command: impl Into<String>, canonical_names: HashMap<String, String>) -> Self {
        Self {
            command: command.into(),
            canonical_names,
        }
    }

    fn list(&self, flag: &str) -> SourceResult<AlsaListing> {
        let output = Command::new(&self.command)
            .arg(flag)
            .output()
            .map_err(|source| SourceError::Spawn {
                command: self.command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(SourceError::Command {
                command: format!("{} {}", self.command, flag),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let mut listing = parse_listing(&String::from_utf8_lossy(&output.stdout));
        listing.canonicalize(&self.canonical_names);
        Ok(listing)
    }

    /// One full poll: capture listing, playback listing, connection listing.
    pub fn poll(&self) -> SourceResult<AlsaInventory> {
        let capture = self.list("-i")?;
        let playback = self.list("-o")?;
        let all = self.list("-l")?;

        let mut inventory = AlsaInventory::default();
        inventory.add_ports(PortDirection::Output, &capture);
        inventory.add_ports(PortDirection::Input, &playback);
        inventory.add_connections(&all);
        Ok(inventory)
    }
}

/// Polls once per message on `trigger`; returns false when the worker
/// should stop.
fn run_poll(adapter: &AlsaTextAdapter, tx: &Sender<SourceEvent>, first: bool) -> bool {
    match adapter.poll() {
        Ok(inventory) => tx
            .send(SourceEvent::Alsa(AlsaEvent::Poll(inventory)))
            .is_ok(),
        Err(e) if first && e.is_absent() => {
            log::warn!("ALSA MIDI disabled: {}", e);
            let _ = tx.send(SourceEvent::Alsa(AlsaEvent::Poll(AlsaInventory::default())));
            false
        }
        Err(e) => {
            log::warn!("ALSA poll failed, retrying next cycle: {}", e);
            tx.send(SourceEvent::Alsa(AlsaEvent::Failed(e.to_string())))
                .is_ok()
        }
    }
}

/// Start the ALSA worker thread.
///
/// Returns the trigger for subsequent polls. It is a rendezvous channel:
/// `try_send` fails while a poll is still running, so polls never overlap.
pub fn start(adapter: AlsaTextAdapter, tx: Sender<SourceEvent>) -> std::io::Result<SyncSender<()>> {
    let (trigger_tx, trigger_rx) = std::sync::mpsc::sync_channel::<()>(0);

    std::thread::Builder::new()
        .name("patchmirror-alsa".into())
        .spawn(move || {
            if tx.send(SourceEvent::Alsa(AlsaEvent::Started)).is_err() {
                return;
            }
            if !run_poll(&adapter, &tx, true) {
                return;
            }
            while trigger_rx.recv().is_ok() {
                if !run_poll(&adapter, &tx, false) {
                    break;
                }
            }
            log::debug!("ALSA worker stopped");
        })?;

    Ok(trigger_tx)
}
