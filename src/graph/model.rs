use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::types::*;

pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.as_bytes().iter().peekable();
    let mut bi = b.as_bytes().iter().peekable();

    loop {
        match (ai.peek(), bi.peek()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&&ac), Some(&&bc)) => {
                if ac.is_ascii_digit() && bc.is_ascii_digit() {
                    let an = take_number(&mut ai);
                    let bn = take_number(&mut bi);
                    match an.cmp(&bn) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                } else {
                    match ac.cmp(&bc) {
                        Ordering::Equal => {
                            ai.next();
                            bi.next();
                        }
                        ord => return ord,
                    }
                }
            }
        }
    }
}

fn take_number<'a, I>(it: &mut std::iter::Peekable<I>) -> u64
where
    I: Iterator<Item = &'a u8>,
{
    let mut n: u64 = 0;
    while let Some(&&c) = it.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add((c - b'0') as u64);
        it.next();
    }
    n
}

/// Everything removed by one teardown, in the order the canvas must see it:
/// connections first, then ports, then emptied groups.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Teardown {
    pub connections: Vec<Connection>,
    pub ports: Vec<Port>,
    pub groups: Vec<Group>,
}

impl Teardown {
    fn extend(&mut self, other: Teardown) {
        self.connections.extend(other.connections);
        self.ports.extend(other.ports);
        self.groups.extend(other.groups);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphCounts {
    pub groups: usize,
    pub ports: usize,
    pub connections: usize,
}

/// Arena of groups, ports and connections plus the join-key indices.
///
/// Ids come from one counter per kind and are never handed out twice, so a
/// stale id held by the canvas can never resolve to a newer entity.
#[derive(Debug, Default)]
pub struct GraphModel {
    groups: HashMap<GroupId, Group>,
    ports: HashMap<PortId, Port>,
    connections: HashMap<ConnectionId, Connection>,

    group_by_name: HashMap<String, GroupId>,
    port_by_raw: HashMap<String, PortId>,
    connection_by_ports: HashMap<(PortId, PortId), ConnectionId>,
    group_ports: HashMap<GroupId, HashSet<PortId>>,
    port_connections: HashMap<PortId, HashSet<ConnectionId>>,

    next_group: u32,
    next_port: u32,
    next_connection: u32,
}

impl GraphModel {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queries ────────────────────────────────────────────────────────────

    pub fn counts(&self) -> GraphCounts {
        GraphCounts {
            groups: self.groups.len(),
            ports: self.ports.len(),
            connections: self.connections.len(),
        }
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn group_by_name(&self, name: &str) -> Option<&Group> {
        self.group_by_name.get(name).and_then(|id| self.groups.get(id))
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.ports.get(&id)
    }

    pub fn port_by_raw(&self, raw_name: &str) -> Option<&Port> {
        self.port_by_raw.get(raw_name).and_then(|id| self.ports.get(id))
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn find_connection(&self, output: PortId, input: PortId) -> Option<&Connection> {
        self.connection_by_ports
            .get(&(output, input))
            .and_then(|id| self.connections.get(id))
    }

    /// Groups ordered by name, numeric runs compared by value.
    pub fn groups(&self) -> Vec<&Group> {
        let mut groups: Vec<&Group> = self.groups.values().collect();
        groups.sort_by(|a, b| natural_cmp(&a.name, &b.name));
        groups
    }

    /// Ports of a group, inputs first, then by natural display-name order.
    pub fn ports_for_group(&self, group_id: GroupId) -> Vec<&Port> {
        let mut ports: Vec<&Port> = self
            .group_ports
            .get(&group_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.ports.get(id))
            .collect();
        ports.sort_by(|a, b| {
            a.direction
                .cmp(&b.direction)
                .then_with(|| natural_cmp(&a.display_name, &b.display_name))
        });
        ports
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    pub fn connections_for_port(&self, port_id: PortId) -> Vec<&Connection> {
        let mut conns: Vec<&Connection> = self
            .port_connections
            .get(&port_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
            .collect();
        conns.sort_by_key(|c| c.id);
        conns
    }

    pub fn port_ids_of_source(&self, source: Source) -> Vec<PortId> {
        let mut ids: Vec<PortId> = self
            .ports
            .values()
            .filter(|p| p.sources.contains(source))
            .map(|p| p.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn connection_ids_of_source(&self, source: Source) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.sources.contains(source))
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids
    }

    // ── Groups ─────────────────────────────────────────────────────────────

    /// Create a group. The caller guarantees the name is not taken.
    pub fn insert_group(&mut self, name: &str, origin: Origin, is_hardware: bool) -> GroupId {
        debug_assert!(!self.group_by_name.contains_key(name));
        self.next_group += 1;
        let id = GroupId(self.next_group);
        self.groups.insert(
            id,
            Group {
                id,
                name: name.to_string(),
                origin,
                is_hardware,
                is_split: false,
            },
        );
        self.group_by_name.insert(name.to_string(), id);
        self.group_ports.insert(id, HashSet::new());
        id
    }

    pub fn set_group_hardware(&mut self, id: GroupId) -> bool {
        match self.groups.get_mut(&id) {
            Some(group) if !group.is_hardware => {
                group.is_hardware = true;
                true
            }
            _ => false,
        }
    }

    /// Rename a group. Fails when another group already holds `new_name`.
    pub fn rename_group(&mut self, id: GroupId, new_name: &str) -> bool {
        if self.group_by_name.contains_key(new_name) {
            return false;
        }
        let Some(group) = self.groups.get_mut(&id) else {
            return false;
        };
        self.group_by_name.remove(&group.name);
        group.name = new_name.to_string();
        self.group_by_name.insert(new_name.to_string(), id);
        true
    }

    /// Remove a group together with its ports and their connections.
    pub fn remove_group(&mut self, id: GroupId) -> Teardown {
        let mut teardown = Teardown::default();
        let mut port_ids: Vec<PortId> = self
            .group_ports
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        port_ids.sort();
        for port_id in port_ids {
            teardown.extend(self.remove_port(port_id));
        }
        // A group without ports is removed by the last remove_port above;
        // this handles a group that never had any.
        if let Some(group) = self.detach_group(id) {
            teardown.groups.push(group);
        }
        teardown
    }

    fn detach_group(&mut self, id: GroupId) -> Option<Group> {
        let group = self.groups.remove(&id)?;
        self.group_by_name.remove(&group.name);
        self.group_ports.remove(&id);
        Some(group)
    }

    // ── Ports ──────────────────────────────────────────────────────────────

    /// Create a port in an existing group. Returns `None` when the group is
    /// unknown or the raw name is already taken.
    pub fn insert_port(&mut self, group_id: GroupId, record: &PortRecord) -> Option<PortId> {
        if !self.groups.contains_key(&group_id) || self.port_by_raw.contains_key(&record.raw_name)
        {
            return None;
        }
        self.next_port += 1;
        let id = PortId(self.next_port);
        self.ports.insert(
            id,
            Port {
                id,
                group_id,
                raw_name: record.raw_name.clone(),
                display_name: record.display_name.clone(),
                direction: record.direction,
                media_type: record.media_type,
                origin: record.origin,
                sources: SourceSet::only(record.source),
                is_physical: false,
            },
        );
        self.port_by_raw.insert(record.raw_name.clone(), id);
        self.group_ports.entry(group_id).or_default().insert(id);
        Some(id)
    }

    /// Record that another source also reports this port.
    pub fn claim_port(&mut self, id: PortId, source: Source) {
        if let Some(port) = self.ports.get_mut(&id) {
            port.sources.insert(source);
        }
    }

    /// Drop one source's claim. Returns true when no source reports the
    /// port any more.
    pub fn release_port(&mut self, id: PortId, source: Source) -> bool {
        match self.ports.get_mut(&id) {
            Some(port) => {
                port.sources.remove(source);
                port.sources.is_empty()
            }
            None => false,
        }
    }

    pub fn set_port_display_name(&mut self, id: PortId, display_name: &str) -> bool {
        match self.ports.get_mut(&id) {
            Some(port) if port.display_name != display_name => {
                port.display_name = display_name.to_string();
                true
            }
            _ => false,
        }
    }

    /// Flag a port physical. Returns `true` when this made its group split
    /// for the first time.
    pub fn mark_port_physical(&mut self, id: PortId) -> bool {
        let Some(port) = self.ports.get_mut(&id) else {
            return false;
        };
        port.is_physical = true;
        let group_id = port.group_id;
        match self.groups.get_mut(&group_id) {
            Some(group) if !group.is_split => {
                group.is_split = true;
                group.is_hardware = true;
                true
            }
            _ => false,
        }
    }

    /// Change a port's join key, keeping its id and connections.
    pub fn rekey_port(&mut self, id: PortId, new_raw_name: &str) -> bool {
        if self.port_by_raw.contains_key(new_raw_name) {
            return false;
        }
        let Some(port) = self.ports.get_mut(&id) else {
            return false;
        };
        self.port_by_raw.remove(&port.raw_name);
        port.raw_name = new_raw_name.to_string();
        self.port_by_raw.insert(new_raw_name.to_string(), id);
        true
    }

    /// Move a port into another group. An emptied group is removed.
    pub fn move_port(&mut self, id: PortId, group_id: GroupId) -> Teardown {
        let mut teardown = Teardown::default();
        if !self.groups.contains_key(&group_id) {
            return teardown;
        }
        let Some(port) = self.ports.get_mut(&id) else {
            return teardown;
        };
        let old_group = port.group_id;
        if old_group == group_id {
            return teardown;
        }
        port.group_id = group_id;
        self.group_ports.entry(group_id).or_default().insert(id);
        let emptied = match self.group_ports.get_mut(&old_group) {
            Some(members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        if emptied && let Some(group) = self.detach_group(old_group) {
            teardown.groups.push(group);
        }
        teardown
    }

    /// Remove a port, every connection touching it, and its group when it
    /// was the last port.
    pub fn remove_port(&mut self, id: PortId) -> Teardown {
        let mut teardown = Teardown::default();
        let mut conn_ids: Vec<ConnectionId> = self
            .port_connections
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        conn_ids.sort();
        for conn_id in conn_ids {
            if let Some(conn) = self.remove_connection(conn_id) {
                teardown.connections.push(conn);
            }
        }

        let Some(port) = self.ports.remove(&id) else {
            return teardown;
        };
        self.port_by_raw.remove(&port.raw_name);
        self.port_connections.remove(&id);

        let group_id = port.group_id;
        let emptied = match self.group_ports.get_mut(&group_id) {
            Some(members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        teardown.ports.push(port);
        if emptied && let Some(group) = self.detach_group(group_id) {
            teardown.groups.push(group);
        }
        teardown
    }

    // ── Connections ────────────────────────────────────────────────────────

    /// Create a connection between two existing ports. Returns the existing
    /// id when the pair is already connected.
    pub fn insert_connection(
        &mut self,
        output: PortId,
        input: PortId,
        source: Source,
    ) -> Option<(ConnectionId, bool)> {
        if !self.ports.contains_key(&output) || !self.ports.contains_key(&input) {
            return None;
        }
        if let Some(&id) = self.connection_by_ports.get(&(output, input)) {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.sources.insert(source);
            }
            return Some((id, false));
        }
        self.next_connection += 1;
        let id = ConnectionId(self.next_connection);
        self.connections.insert(
            id,
            Connection {
                id,
                output_port_id: output,
                input_port_id: input,
                sources: SourceSet::only(source),
            },
        );
        self.connection_by_ports.insert((output, input), id);
        self.port_connections.entry(output).or_default().insert(id);
        self.port_connections.entry(input).or_default().insert(id);
        Some((id, true))
    }

    /// Drop one source's claim on a connection. Returns true when no source
    /// reports it any more.
    pub fn release_connection(&mut self, id: ConnectionId, source: Source) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.sources.remove(source);
                conn.sources.is_empty()
            }
            None => false,
        }
    }

    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        self.connection_by_ports
            .remove(&(conn.output_port_id, conn.input_port_id));
        for port_id in [conn.output_port_id, conn.input_port_id] {
            if let Some(set) = self.port_connections.get_mut(&port_id) {
                set.remove(&id);
            }
        }
        Some(conn)
    }
}
