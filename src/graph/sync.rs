//! Graph synchronizer
//!
//! Owns the [`GraphModel`] and applies canonical [`GraphEvent`]s to it.
//!
//! ## Reconciliation
//! Snapshots and incremental events go through the same primitives
//! (`upsert_port`, `remove_port`, `add_connection`, ...), joined on the
//! port's raw name. Applying a snapshot twice, or an event that is already
//! reflected in the model, is a no-op.
//!
//! ## Pending connections
//! A connection may name a port that has not been reported yet (the ALSA
//! listings, or interleaved native callbacks). It is parked under the missing
//! raw name and retried whenever a port is created. Entries that survive a
//! full poll cycle are dropped, and a source that keeps reporting a dropped
//! connection does not park it again.
//!
//! ## Shared entities
//! The native and bus sources can both report the same port or link. Each
//! entity records every source that reports it and leaves the model only
//! when the last of them stops.
//!
//! ## Hardware split
//! The first physical port of a group marks it split for the rest of the
//! process. When that happens after the group was drawn, the group is
//! withdrawn and redrawn with the same ids.

use std::collections::{HashMap, HashSet};

use super::model::{GraphModel, Teardown};
use super::projection::CanvasProjection;
use super::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupHint {
    source: Source,
    is_hardware: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingConnection {
    source: Source,
    connection: ConnectionRecord,
    /// Poll cycle in which the entry was first parked
    born: u64,
}

pub struct GraphSynchronizer<P: CanvasProjection> {
    model: GraphModel,
    projection: P,
    states: HashMap<Source, SourceState>,
    group_hints: HashMap<String, GroupHint>,
    /// Keyed by the raw name that was missing when the entry was parked
    pending: HashMap<String, Vec<PendingConnection>>,
    /// Connections dropped from `pending`, not parked again while reported
    expired: HashSet<(Source, ConnectionRecord)>,
    cycle: u64,
}

impl<P: CanvasProjection> GraphSynchronizer<P> {
    pub fn new(projection: P) -> Self {
        Self {
            model: GraphModel::new(),
            projection,
            states: Source::ALL
                .iter()
                .map(|&s| (s, SourceState::Unattached))
                .collect(),
            group_hints: HashMap::new(),
            pending: HashMap::new(),
            expired: HashSet::new(),
            cycle: 0,
        }
    }

    pub fn model(&self) -> &GraphModel {
        &self.model
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn projection_mut(&mut self) -> &mut P {
        &mut self.projection
    }

    pub fn source_state(&self, source: Source) -> SourceState {
        self.states
            .get(&source)
            .copied()
            .unwrap_or(SourceState::Unattached)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Apply one canonical event.
    pub fn apply(&mut self, event: GraphEvent) {
        log::debug!("Applying {:?}", event);
        match event {
            GraphEvent::GroupAppeared { source, group } => self.note_group(source, &group),
            GraphEvent::GroupDisappeared { source, name } => self.forget_group(source, &name),
            GraphEvent::GroupRenamed {
                source,
                old_name,
                new_name,
            } => self.rename_group(source, &old_name, &new_name),
            GraphEvent::PortAppeared(record) => self.upsert_port(&record),
            GraphEvent::PortRenamed {
                raw_name,
                display_name,
            } => self.rename_port(&raw_name, &display_name),
            GraphEvent::PortDisappeared { raw_name } => self.remove_port_by_raw(&raw_name),
            GraphEvent::ConnectionAdded { source, connection } => {
                self.add_connection(source, connection, self.cycle)
            }
            GraphEvent::ConnectionRemoved { connection } => self.remove_connection(&connection),
            GraphEvent::SyncStarted(source) => self.set_state(source, SourceState::Syncing),
            GraphEvent::SourceLost(source) => self.lose_source(source),
            GraphEvent::FullSnapshot(snapshot) => self.apply_snapshot(snapshot),
            GraphEvent::PollCycle => self.expire_pending(),
        }
    }

    fn set_state(&mut self, source: Source, state: SourceState) {
        let previous = self.states.insert(source, state);
        if previous != Some(state) {
            log::info!("Source {}: {:?} -> {:?}", source, previous, state);
        }
    }

    // ── Snapshots ──────────────────────────────────────────────────────────

    fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let source = snapshot.source;

        // 1. Tear down what this source no longer reports
        let reported: HashSet<&str> = snapshot
            .ports
            .iter()
            .map(|p| p.raw_name.as_str())
            .collect();
        for port_id in self.model.port_ids_of_source(source) {
            let gone = self
                .model
                .port(port_id)
                .is_some_and(|p| !reported.contains(p.raw_name.as_str()));
            if gone && self.model.release_port(port_id, source) {
                let teardown = self.model.remove_port(port_id);
                self.project_teardown(&teardown);
            }
        }

        let reported_links: HashSet<(&str, &str)> = snapshot
            .connections
            .iter()
            .map(|c| (c.output.as_str(), c.input.as_str()))
            .collect();
        for conn_id in self.model.connection_ids_of_source(source) {
            let gone = self.connection_names(conn_id).is_some_and(|(out, inp)| {
                !reported_links.contains(&(out.as_str(), inp.as_str()))
            });
            if gone
                && self.model.release_connection(conn_id, source)
                && let Some(conn) = self.model.remove_connection(conn_id)
            {
                self.projection.disconnect(conn.id);
            }
        }

        // The snapshot supersedes whatever this source had parked; links it
        // still reports keep their age
        let mut parked: HashMap<ConnectionRecord, u64> = HashMap::new();
        for entries in self.pending.values_mut() {
            entries.retain(|e| {
                if e.source == source {
                    parked.insert(e.connection.clone(), e.born);
                    false
                } else {
                    true
                }
            });
        }
        self.pending.retain(|_, entries| !entries.is_empty());
        let reported_records: HashSet<&ConnectionRecord> = snapshot.connections.iter().collect();
        self.expired
            .retain(|(s, c)| *s != source || reported_records.contains(c));

        // 2. Groups, 3. ports, 4. connections
        self.group_hints.retain(|_, hint| hint.source != source);
        for group in &snapshot.groups {
            self.note_group(source, group);
        }
        for record in &snapshot.ports {
            self.upsert_port(record);
        }
        for connection in snapshot.connections {
            let born = parked.get(&connection).copied().unwrap_or(self.cycle);
            self.add_connection(source, connection, born);
        }

        let level = if self.source_state(source) == SourceState::Live {
            log::Level::Debug
        } else {
            log::Level::Info
        };
        self.set_state(source, SourceState::Live);
        let counts = self.model.counts();
        log::log!(
            level,
            "Applied {} snapshot: {} groups, {} ports, {} connections ({} pending)",
            source,
            counts.groups,
            counts.ports,
            counts.connections,
            self.pending_count()
        );
        if log::log_enabled!(log::Level::Debug) {
            let names: Vec<&str> = self.model.groups().iter().map(|g| g.name.as_str()).collect();
            log::debug!("Groups: {}", names.join(", "));
        }
    }

    fn connection_names(&self, id: ConnectionId) -> Option<(String, String)> {
        let conn = self.model.connection(id)?;
        let out = self.model.port(conn.output_port_id)?;
        let inp = self.model.port(conn.input_port_id)?;
        Some((out.raw_name.clone(), inp.raw_name.clone()))
    }

    fn lose_source(&mut self, source: Source) {
        let mut removed = Teardown::default();
        for conn_id in self.model.connection_ids_of_source(source) {
            if self.model.release_connection(conn_id, source)
                && let Some(conn) = self.model.remove_connection(conn_id)
            {
                removed.connections.push(conn);
            }
        }
        self.project_teardown(&removed);

        let mut lost_ports = 0;
        for port_id in self.model.port_ids_of_source(source) {
            if !self.model.release_port(port_id, source) {
                continue;
            }
            let teardown = self.model.remove_port(port_id);
            lost_ports += teardown.ports.len();
            self.project_teardown(&teardown);
        }

        for entries in self.pending.values_mut() {
            entries.retain(|e| e.source != source);
        }
        self.pending.retain(|_, entries| !entries.is_empty());
        self.expired.retain(|(s, _)| *s != source);
        self.group_hints.retain(|_, hint| hint.source != source);

        self.set_state(source, SourceState::Degraded);
        log::info!(
            "Source {} lost: removed {} ports, other sources untouched",
            source,
            lost_ports
        );
    }

    // ── Groups ─────────────────────────────────────────────────────────────

    fn note_group(&mut self, source: Source, group: &GroupRecord) {
        self.group_hints.insert(
            group.name.clone(),
            GroupHint {
                source,
                is_hardware: group.is_hardware,
            },
        );
        if group.is_hardware
            && let Some(existing) = self.model.group_by_name(&group.name)
        {
            let id = existing.id;
            if self.model.set_group_hardware(id) {
                // Already drawn with the application icon
                self.reproject_group(id);
            }
        }
    }

    fn forget_group(&mut self, source: Source, name: &str) {
        if self
            .group_hints
            .get(name)
            .is_some_and(|hint| hint.source == source)
        {
            log::debug!("Dropping {} hint for group {:?}", source, name);
            self.group_hints.remove(name);
        }
    }

    /// Create the group in the model if needed. Returns the id and whether
    /// it was created (and therefore not drawn yet).
    fn ensure_group(&mut self, name: &str, origin: Origin) -> (GroupId, bool) {
        if let Some(group) = self.model.group_by_name(name) {
            return (group.id, false);
        }
        let is_hardware = self
            .group_hints
            .get(name)
            .map(|h| h.is_hardware)
            .unwrap_or(false);
        (self.model.insert_group(name, origin, is_hardware), true)
    }

    fn rename_group(&mut self, source: Source, old_name: &str, new_name: &str) {
        if old_name == new_name {
            return;
        }
        if let Some(hint) = self.group_hints.remove(old_name) {
            self.group_hints.insert(new_name.to_string(), hint);
        }
        let Some(group_id) = self.model.group_by_name(old_name).map(|g| g.id) else {
            log::debug!("Rename of unknown group {:?} ignored", old_name);
            return;
        };

        let target = self.model.group_by_name(new_name).map(|g| g.id);
        match target {
            None => {
                self.model.rename_group(group_id, new_name);
                self.projection.rename_group(group_id, new_name);
            }
            Some(target_id) => {
                // Another record already owns the name: fold into it
                log::info!(
                    "Group {:?} renamed onto existing {:?}, merging",
                    old_name,
                    new_name
                );
                self.merge_group(group_id, target_id);
            }
        }

        self.rekey_ports_after_rename(source, old_name, new_name);
    }

    fn merge_group(&mut self, from: GroupId, into: GroupId) {
        let ports: Vec<PortId> = self
            .model
            .ports_for_group(from)
            .iter()
            .map(|p| p.id)
            .collect();
        let conns = self.connections_touching(&ports);
        for conn in &conns {
            self.projection.disconnect(conn.id);
        }
        for &port_id in &ports {
            self.projection.remove_port(port_id);
        }
        self.projection.remove_group(from);

        let mut split = false;
        for &port_id in &ports {
            let physical = self.model.port(port_id).is_some_and(|p| p.is_physical);
            self.model.move_port(port_id, into);
            if physical {
                split |= self.model.mark_port_physical(port_id);
            }
        }
        // A group left without ports by the moves is gone from the model
        // already; make sure one that never had any goes too.
        if self.model.group(from).is_some() {
            self.model.remove_group(from);
        }

        if split {
            self.reproject_group(into);
        } else {
            for &port_id in &ports {
                self.project_port(port_id);
            }
            for conn in &conns {
                self.projection
                    .connect(conn.id, conn.output_port_id, conn.input_port_id);
            }
        }
    }

    /// JACK full port names embed the client name, so a client rename
    /// changes the join key of each of its ports.
    fn rekey_ports_after_rename(&mut self, source: Source, old_name: &str, new_name: &str) {
        let prefix = format!("{}:", old_name);
        let affected: Vec<(PortId, String)> = self
            .model
            .ports()
            .filter(|p| p.sources.contains(source))
            .filter_map(|p| {
                p.raw_name
                    .strip_prefix(&prefix)
                    .map(|rest| (p.id, format!("{}:{}", new_name, rest)))
            })
            .collect();
        for (port_id, new_raw) in affected {
            if !self.model.rekey_port(port_id, &new_raw) {
                log::warn!(
                    "Port {} cannot take raw name {:?}, already in use",
                    port_id,
                    new_raw
                );
                continue;
            }
            self.resolve_pending(&new_raw);
        }
    }

    fn project_group(&mut self, group_id: GroupId) {
        if let Some(group) = self.model.group(group_id) {
            self.projection
                .add_group(group.id, &group.name, group.is_split, group.icon());
        }
    }

    /// Withdraw a drawn group and draw it again, keeping every id.
    fn reproject_group(&mut self, group_id: GroupId) {
        let ports: Vec<PortId> = self
            .model
            .ports_for_group(group_id)
            .iter()
            .map(|p| p.id)
            .collect();
        let conns = self.connections_touching(&ports);

        for conn in &conns {
            self.projection.disconnect(conn.id);
        }
        for &port_id in &ports {
            self.projection.remove_port(port_id);
        }
        self.projection.remove_group(group_id);

        self.project_group(group_id);
        for &port_id in &ports {
            self.project_port(port_id);
        }
        for conn in &conns {
            self.projection
                .connect(conn.id, conn.output_port_id, conn.input_port_id);
        }
    }

    fn connections_touching(&self, ports: &[PortId]) -> Vec<Connection> {
        let mut seen = HashSet::new();
        let mut conns = Vec::new();
        for &port_id in ports {
            for conn in self.model.connections_for_port(port_id) {
                if seen.insert(conn.id) {
                    conns.push(*conn);
                }
            }
        }
        conns.sort_by_key(|c| c.id);
        conns
    }

    // ── Ports ──────────────────────────────────────────────────────────────

    fn upsert_port(&mut self, record: &PortRecord) {
        let Some(existing) = self.model.port_by_raw(&record.raw_name) else {
            self.create_port(record);
            return;
        };
        let port_id = existing.id;
        let was_physical = existing.is_physical;
        let claimed = existing.sources.contains(record.source);
        let same_group = self
            .model
            .group(existing.group_id)
            .is_some_and(|g| g.name == record.group_name);

        if !same_group {
            // Same key, different owner: structural change
            log::debug!(
                "Port {:?} moved to group {:?}, recreating",
                record.raw_name,
                record.group_name
            );
            let teardown = self.model.remove_port(port_id);
            self.project_teardown(&teardown);
            self.create_port(record);
            return;
        }

        if !claimed {
            log::debug!("Port {:?} also reported by {}", record.raw_name, record.source);
            self.model.claim_port(port_id, record.source);
        }
        if self
            .model
            .set_port_display_name(port_id, &record.display_name)
        {
            self.projection.rename_port(port_id, &record.display_name);
        }
        if record.is_physical && !was_physical && self.model.mark_port_physical(port_id) {
            let group_id = self
                .model
                .port(port_id)
                .map(|p| p.group_id);
            if let Some(group_id) = group_id {
                self.reproject_group(group_id);
            }
        }
    }

    fn create_port(&mut self, record: &PortRecord) {
        let (group_id, created) = self.ensure_group(&record.group_name, record.origin);
        let Some(port_id) = self.model.insert_port(group_id, record) else {
            log::warn!("Could not insert port {:?}", record.raw_name);
            return;
        };
        let newly_split = record.is_physical && self.model.mark_port_physical(port_id);
        if let Some(port) = self.model.port(port_id) {
            log::debug!(
                "Port {} {:?} added from {:?}",
                port.id,
                port.raw_name,
                port.origin
            );
        }

        if created {
            self.project_group(group_id);
            self.project_port(port_id);
        } else {
            self.project_port(port_id);
            if newly_split {
                self.reproject_group(group_id);
            }
        }

        self.resolve_pending(&record.raw_name);
    }

    fn project_port(&mut self, port_id: PortId) {
        if let Some(port) = self.model.port(port_id) {
            self.projection.add_port(
                port.group_id,
                port.id,
                &port.display_name,
                port.direction,
                port.media_type,
            );
        }
    }

    fn rename_port(&mut self, raw_name: &str, display_name: &str) {
        let Some(port_id) = self.model.port_by_raw(raw_name).map(|p| p.id) else {
            log::debug!("Rename of unknown port {:?} ignored", raw_name);
            return;
        };
        if self.model.set_port_display_name(port_id, display_name) {
            self.projection.rename_port(port_id, display_name);
        }
    }

    fn remove_port_by_raw(&mut self, raw_name: &str) {
        let Some(port_id) = self.model.port_by_raw(raw_name).map(|p| p.id) else {
            return;
        };
        let teardown = self.model.remove_port(port_id);
        self.project_teardown(&teardown);
    }

    fn project_teardown(&mut self, teardown: &Teardown) {
        for conn in &teardown.connections {
            self.projection.disconnect(conn.id);
        }
        for port in &teardown.ports {
            self.projection.remove_port(port.id);
        }
        for group in &teardown.groups {
            self.projection.remove_group(group.id);
        }
    }

    // ── Connections ────────────────────────────────────────────────────────

    fn add_connection(&mut self, source: Source, connection: ConnectionRecord, born: u64) {
        let out = self.model.port_by_raw(&connection.output).map(|p| (p.id, p.direction));
        let inp = self.model.port_by_raw(&connection.input).map(|p| (p.id, p.direction));

        match (out, inp) {
            (Some((out_id, out_dir)), Some((in_id, in_dir))) => {
                let (out_id, in_id) =
                    if out_dir == PortDirection::Input && in_dir == PortDirection::Output {
                        (in_id, out_id)
                    } else {
                        (out_id, in_id)
                    };
                self.expired.remove(&(source, connection));
                if let Some((id, true)) = self.model.insert_connection(out_id, in_id, source) {
                    self.projection.connect(id, out_id, in_id);
                }
            }
            (None, _) => self.park(connection.output.clone(), source, connection, born),
            (_, None) => self.park(connection.input.clone(), source, connection, born),
        }
    }

    fn park(&mut self, missing: String, source: Source, connection: ConnectionRecord, born: u64) {
        if self.expired.contains(&(source, connection.clone())) {
            log::debug!(
                "Connection {} -> {} already dropped, not parking again",
                connection.output,
                connection.input
            );
            return;
        }
        log::debug!(
            "Connection {} -> {} waits for {:?}",
            connection.output,
            connection.input,
            missing
        );
        let entries = self.pending.entry(missing).or_default();
        if !entries.iter().any(|e| e.connection == connection) {
            entries.push(PendingConnection {
                source,
                connection,
                born,
            });
        }
    }

    fn resolve_pending(&mut self, raw_name: &str) {
        let Some(entries) = self.pending.remove(raw_name) else {
            return;
        };
        for entry in entries {
            self.add_connection(entry.source, entry.connection, entry.born);
        }
    }

    fn remove_connection(&mut self, connection: &ConnectionRecord) {
        for entries in self.pending.values_mut() {
            entries.retain(|e| {
                e.connection != *connection
                    && e.connection != ConnectionRecord::new(&connection.input, &connection.output)
            });
        }
        self.pending.retain(|_, entries| !entries.is_empty());
        let reversed = ConnectionRecord::new(&connection.input, &connection.output);
        self.expired
            .retain(|(_, c)| c != connection && *c != reversed);

        let (Some(a), Some(b)) = (
            self.model.port_by_raw(&connection.output).map(|p| p.id),
            self.model.port_by_raw(&connection.input).map(|p| p.id),
        ) else {
            return;
        };
        let id = self
            .model
            .find_connection(a, b)
            .or_else(|| self.model.find_connection(b, a))
            .map(|c| c.id);
        if let Some(id) = id
            && self.model.remove_connection(id).is_some()
        {
            self.projection.disconnect(id);
        }
    }

    fn expire_pending(&mut self) {
        let cycle = self.cycle;
        let expired = &mut self.expired;
        for (missing, entries) in self.pending.iter_mut() {
            entries.retain(|e| {
                let keep = e.born >= cycle;
                if !keep {
                    log::warn!(
                        "Dropping connection {} -> {}: {:?} never appeared",
                        e.connection.output,
                        e.connection.input,
                        missing
                    );
                    expired.insert((e.source, e.connection.clone()));
                }
                keep
            });
        }
        self.pending.retain(|_, entries| !entries.is_empty());
        self.cycle += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::projection::{ProjectionOp, Recorder};

    fn port(source: Source, raw: &str, direction: PortDirection, physical: bool) -> PortRecord {
        let (group, name) = raw.split_once(':').unwrap();
        PortRecord {
            source,
            origin: source.into(),
            group_name: group.to_string(),
            raw_name: raw.to_string(),
            display_name: name.to_string(),
            direction,
            media_type: MediaType::Audio,
            is_physical: physical,
        }
    }

    fn sync() -> GraphSynchronizer<Recorder> {
        GraphSynchronizer::new(Recorder::default())
    }

    fn fixture_snapshot() -> Snapshot {
        Snapshot {
            source: Source::Native,
            groups: vec![GroupRecord {
                name: "system".into(),
                is_hardware: true,
            }],
            ports: vec![
                port(Source::Native, "system:capture_1", PortDirection::Output, true),
                port(Source::Native, "system:playback_1", PortDirection::Input, true),
                port(Source::Native, "synth:out", PortDirection::Output, false),
            ],
            connections: vec![
                ConnectionRecord::new("system:capture_1", "system:playback_1"),
                ConnectionRecord::new("synth:out", "system:playback_1"),
            ],
        }
    }

    #[test]
    fn test_end_to_end_pending_and_split() {
        let mut s = sync();
        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "sys:in1",
            PortDirection::Input,
            true,
        )));
        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "sys:in2",
            PortDirection::Input,
            true,
        )));
        s.apply(GraphEvent::ConnectionAdded {
            source: Source::Native,
            connection: ConnectionRecord::new("other:out1", "sys:in1"),
        });
        assert_eq!(s.pending_count(), 1);
        assert_eq!(s.model().counts().connections, 0);

        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "other:out1",
            PortDirection::Output,
            false,
        )));

        let counts = s.model().counts();
        assert_eq!(counts.groups, 2);
        assert_eq!(counts.ports, 3);
        assert_eq!(counts.connections, 1);
        assert_eq!(s.pending_count(), 0);
        assert!(s.model().group_by_name("sys").unwrap().is_split);
        assert!(!s.model().group_by_name("other").unwrap().is_split);

        let out = s.model().port_by_raw("other:out1").unwrap().id;
        let inp = s.model().port_by_raw("sys:in1").unwrap().id;
        assert!(s.model().find_connection(out, inp).is_some());
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let mut s = sync();
        s.apply(GraphEvent::FullSnapshot(fixture_snapshot()));
        let counts = s.model().counts();
        let ids: Vec<PortId> = s.model().port_ids_of_source(Source::Native);
        s.projection_mut().take();

        s.apply(GraphEvent::FullSnapshot(fixture_snapshot()));
        assert_eq!(s.model().counts(), counts);
        assert_eq!(s.model().port_ids_of_source(Source::Native), ids);
        assert!(s.projection_mut().take().is_empty());
        assert_eq!(s.source_state(Source::Native), SourceState::Live);
    }

    #[test]
    fn test_snapshot_diff_preserves_ids() {
        let mut s = sync();
        s.apply(GraphEvent::FullSnapshot(fixture_snapshot()));
        let capture = s.model().port_by_raw("system:capture_1").unwrap().id;

        let mut next = fixture_snapshot();
        next.ports.retain(|p| p.raw_name != "synth:out");
        next.connections.retain(|c| c.output != "synth:out");
        next.ports[0].display_name = "Mic".into();
        s.projection_mut().take();
        s.apply(GraphEvent::FullSnapshot(next));

        assert!(s.model().group_by_name("synth").is_none());
        let kept = s.model().port_by_raw("system:capture_1").unwrap();
        assert_eq!(kept.id, capture);
        assert_eq!(kept.display_name, "Mic");
        let ops = s.projection_mut().take();
        assert!(ops.contains(&ProjectionOp::RenamePort {
            id: capture,
            name: "Mic".into()
        }));
        assert!(ops
            .iter()
            .any(|op| matches!(op, ProjectionOp::RemoveGroup { .. })));
    }

    #[test]
    fn test_source_lost_only_tears_down_that_source() {
        let mut s = sync();
        s.apply(GraphEvent::FullSnapshot(fixture_snapshot()));
        s.apply(GraphEvent::PortAppeared(port(
            Source::Alsa,
            "system:midi_in",
            PortDirection::Input,
            false,
        )));
        s.apply(GraphEvent::SourceLost(Source::Native));

        assert_eq!(s.source_state(Source::Native), SourceState::Degraded);
        let counts = s.model().counts();
        assert_eq!(counts.ports, 1);
        assert_eq!(counts.connections, 0);
        assert_eq!(counts.groups, 1);
        assert!(s.model().port_by_raw("system:midi_in").is_some());
    }

    #[test]
    fn test_group_teardown_cascades() {
        let mut s = sync();
        s.apply(GraphEvent::FullSnapshot(fixture_snapshot()));
        s.projection_mut().take();
        s.apply(GraphEvent::PortDisappeared {
            raw_name: "system:capture_1".into(),
        });
        s.apply(GraphEvent::PortDisappeared {
            raw_name: "system:playback_1".into(),
        });

        assert!(s.model().group_by_name("system").is_none());
        assert_eq!(s.model().counts().connections, 0);
        let ops = s.projection_mut().take();
        let disconnects = ops
            .iter()
            .filter(|op| matches!(op, ProjectionOp::Disconnect { .. }))
            .count();
        assert_eq!(disconnects, 2);
        assert!(matches!(ops.last(), Some(ProjectionOp::RemoveGroup { .. })));
    }

    #[test]
    fn test_alias_rename_preserves_identity() {
        let mut s = sync();
        s.apply(GraphEvent::FullSnapshot(fixture_snapshot()));
        let before = s.model().port_by_raw("synth:out").unwrap().clone();
        let links_before = s.model().connections_for_port(before.id).len();

        s.apply(GraphEvent::PortRenamed {
            raw_name: "synth:out".into(),
            display_name: "Lead L".into(),
        });

        let after = s.model().port_by_raw("synth:out").unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.raw_name, before.raw_name);
        assert_eq!(after.display_name, "Lead L");
        assert_eq!(s.model().connections_for_port(after.id).len(), links_before);
    }

    #[test]
    fn test_pending_dropped_after_full_cycle() {
        let mut s = sync();
        s.apply(GraphEvent::PortAppeared(port(
            Source::Alsa,
            "sys:in1",
            PortDirection::Input,
            false,
        )));
        s.apply(GraphEvent::ConnectionAdded {
            source: Source::Alsa,
            connection: ConnectionRecord::new("ghost:out", "sys:in1"),
        });
        s.apply(GraphEvent::PollCycle);
        assert_eq!(s.pending_count(), 1);
        s.apply(GraphEvent::PollCycle);
        assert_eq!(s.pending_count(), 0);

        s.apply(GraphEvent::PortAppeared(port(
            Source::Alsa,
            "ghost:out",
            PortDirection::Output,
            false,
        )));
        assert_eq!(s.model().counts().connections, 0);
    }

    #[test]
    fn test_split_is_sticky() {
        let mut s = sync();
        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "card:in",
            PortDirection::Input,
            false,
        )));
        assert!(!s.model().group_by_name("card").unwrap().is_split);
        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "card:out",
            PortDirection::Output,
            true,
        )));
        assert!(s.model().group_by_name("card").unwrap().is_split);

        s.apply(GraphEvent::PortDisappeared {
            raw_name: "card:out".into(),
        });
        assert!(s.model().group_by_name("card").unwrap().is_split);
    }

    #[test]
    fn test_late_split_redraws_with_same_ids() {
        let mut s = sync();
        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "card:in",
            PortDirection::Input,
            false,
        )));
        let group_id = s.model().group_by_name("card").unwrap().id;
        let in_id = s.model().port_by_raw("card:in").unwrap().id;
        s.projection_mut().take();

        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "card:out",
            PortDirection::Output,
            true,
        )));
        let ops = s.projection_mut().take();
        assert!(ops.contains(&ProjectionOp::RemoveGroup { id: group_id }));
        assert!(ops.contains(&ProjectionOp::AddGroup {
            id: group_id,
            name: "card".into(),
            split: true,
            icon: GroupIcon::Hardware,
        }));
        assert_eq!(s.model().port_by_raw("card:in").unwrap().id, in_id);
    }

    #[test]
    fn test_group_rename_rekeys_ports() {
        let mut s = sync();
        s.apply(GraphEvent::FullSnapshot(fixture_snapshot()));
        let out_id = s.model().port_by_raw("synth:out").unwrap().id;
        let group_id = s.model().group_by_name("synth").unwrap().id;

        s.apply(GraphEvent::GroupRenamed {
            source: Source::Native,
            old_name: "synth".into(),
            new_name: "lead".into(),
        });

        assert_eq!(s.model().group_by_name("lead").unwrap().id, group_id);
        assert_eq!(s.model().port_by_raw("lead:out").unwrap().id, out_id);
        assert!(s.model().port_by_raw("synth:out").is_none());
        assert_eq!(s.model().connections_for_port(out_id).len(), 1);
    }

    #[test]
    fn test_duplicate_group_name_merges() {
        let mut s = sync();
        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "a:out",
            PortDirection::Output,
            false,
        )));
        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "b:in",
            PortDirection::Input,
            false,
        )));
        let b_id = s.model().group_by_name("b").unwrap().id;
        s.apply(GraphEvent::GroupRenamed {
            source: Source::Native,
            old_name: "a".into(),
            new_name: "b".into(),
        });

        assert_eq!(s.model().counts().groups, 1);
        let merged = s.model().port_by_raw("b:out").unwrap();
        assert_eq!(merged.group_id, b_id);
    }

    #[test]
    fn test_connection_removed_and_pending_cancelled() {
        let mut s = sync();
        s.apply(GraphEvent::FullSnapshot(fixture_snapshot()));
        s.apply(GraphEvent::ConnectionRemoved {
            connection: ConnectionRecord::new("synth:out", "system:playback_1"),
        });
        assert_eq!(s.model().counts().connections, 1);

        s.apply(GraphEvent::ConnectionAdded {
            source: Source::Native,
            connection: ConnectionRecord::new("late:out", "system:playback_1"),
        });
        s.apply(GraphEvent::ConnectionRemoved {
            connection: ConnectionRecord::new("late:out", "system:playback_1"),
        });
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn test_state_machine() {
        let mut s = sync();
        assert_eq!(s.source_state(Source::Bus), SourceState::Unattached);
        s.apply(GraphEvent::SyncStarted(Source::Bus));
        assert_eq!(s.source_state(Source::Bus), SourceState::Syncing);
        s.apply(GraphEvent::FullSnapshot(Snapshot::empty(Source::Bus)));
        assert_eq!(s.source_state(Source::Bus), SourceState::Live);
        s.apply(GraphEvent::SourceLost(Source::Bus));
        assert_eq!(s.source_state(Source::Bus), SourceState::Degraded);
        s.apply(GraphEvent::SyncStarted(Source::Bus));
        assert_eq!(s.source_state(Source::Bus), SourceState::Syncing);
    }

    fn shared_snapshot(source: Source) -> Snapshot {
        Snapshot {
            source,
            groups: Vec::new(),
            ports: vec![
                port(source, "synth:out", PortDirection::Output, false),
                port(source, "fx:in", PortDirection::Input, false),
            ],
            connections: vec![ConnectionRecord::new("synth:out", "fx:in")],
        }
    }

    #[test]
    fn test_shared_port_survives_loss_of_one_source() {
        let mut s = sync();
        s.apply(GraphEvent::FullSnapshot(shared_snapshot(Source::Native)));
        s.apply(GraphEvent::FullSnapshot(shared_snapshot(Source::Bus)));
        let out_id = s.model().port_by_raw("synth:out").unwrap().id;
        s.projection_mut().take();

        s.apply(GraphEvent::SourceLost(Source::Native));
        let counts = s.model().counts();
        assert_eq!(counts.ports, 2);
        assert_eq!(counts.connections, 1);
        assert_eq!(s.model().port_by_raw("synth:out").unwrap().id, out_id);
        assert!(s.projection_mut().take().is_empty());

        s.apply(GraphEvent::SourceLost(Source::Bus));
        assert_eq!(s.model().counts(), Default::default());
    }

    #[test]
    fn test_shared_port_kept_when_one_snapshot_drops_it() {
        let mut s = sync();
        s.apply(GraphEvent::FullSnapshot(shared_snapshot(Source::Native)));
        s.apply(GraphEvent::FullSnapshot(shared_snapshot(Source::Bus)));
        s.apply(GraphEvent::FullSnapshot(Snapshot::empty(Source::Native)));
        assert_eq!(s.model().counts().ports, 2);
        assert_eq!(s.model().counts().connections, 1);

        s.apply(GraphEvent::FullSnapshot(Snapshot::empty(Source::Bus)));
        assert_eq!(s.model().counts().ports, 0);
    }

    #[test]
    fn test_dangling_alsa_connection_expires_across_polls() {
        let mut s = sync();
        let listing = || Snapshot {
            source: Source::Alsa,
            groups: vec![GroupRecord {
                name: "Synth".into(),
                is_hardware: false,
            }],
            ports: vec![PortRecord {
                group_name: "Synth".into(),
                ..port(Source::Alsa, "128:0/playback", PortDirection::Input, false)
            }],
            connections: vec![ConnectionRecord::new("99:0/capture", "128:0/playback")],
        };
        for _ in 0..5 {
            s.apply(GraphEvent::FullSnapshot(listing()));
            s.apply(GraphEvent::PollCycle);
        }
        assert_eq!(s.pending_count(), 0);
        assert_eq!(s.model().counts().connections, 0);

        // Once the link stops being reported it may be parked again
        let mut quiet = listing();
        quiet.connections.clear();
        s.apply(GraphEvent::FullSnapshot(quiet));
        s.apply(GraphEvent::FullSnapshot(listing()));
        assert_eq!(s.pending_count(), 1);
    }

    #[test]
    fn test_hardware_hint_redraws_drawn_group() {
        let mut s = sync();
        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "system:capture_1",
            PortDirection::Output,
            false,
        )));
        let group_id = s.model().group_by_name("system").unwrap().id;
        s.projection_mut().take();

        s.apply(GraphEvent::GroupAppeared {
            source: Source::Alsa,
            group: GroupRecord {
                name: "system".into(),
                is_hardware: true,
            },
        });
        let ops = s.projection_mut().take();
        assert!(ops.contains(&ProjectionOp::AddGroup {
            id: group_id,
            name: "system".into(),
            split: false,
            icon: GroupIcon::Hardware,
        }));

        // Hint already applied: nothing more to draw
        s.apply(GraphEvent::GroupAppeared {
            source: Source::Alsa,
            group: GroupRecord {
                name: "system".into(),
                is_hardware: true,
            },
        });
        assert!(s.projection_mut().take().is_empty());
    }

    #[test]
    fn test_hint_dropped_when_client_leaves() {
        let mut s = sync();
        let hint = GroupRecord {
            name: "card".into(),
            is_hardware: true,
        };
        s.apply(GraphEvent::GroupAppeared {
            source: Source::Native,
            group: hint.clone(),
        });
        // Another source cannot retire it
        s.apply(GraphEvent::GroupDisappeared {
            source: Source::Bus,
            name: "card".into(),
        });
        s.apply(GraphEvent::GroupDisappeared {
            source: Source::Native,
            name: "card".into(),
        });
        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "card:in",
            PortDirection::Input,
            false,
        )));
        assert!(!s.model().group_by_name("card").unwrap().is_hardware);

        s.apply(GraphEvent::PortDisappeared {
            raw_name: "card:in".into(),
        });
        s.apply(GraphEvent::GroupAppeared {
            source: Source::Native,
            group: hint,
        });
        s.apply(GraphEvent::GroupDisappeared {
            source: Source::Bus,
            name: "card".into(),
        });
        s.apply(GraphEvent::PortAppeared(port(
            Source::Native,
            "card:in",
            PortDirection::Input,
            false,
        )));
        assert!(s.model().group_by_name("card").unwrap().is_hardware);
    }

    #[test]
    fn test_hardware_hint_sets_icon() {
        let mut s = sync();
        s.apply(GraphEvent::GroupAppeared {
            source: Source::Bus,
            group: GroupRecord {
                name: "system".into(),
                is_hardware: true,
            },
        });
        s.apply(GraphEvent::PortAppeared(port(
            Source::Bus,
            "system:capture_1",
            PortDirection::Output,
            false,
        )));
        let ops = s.projection_mut().take();
        assert!(matches!(
            ops.first(),
            Some(ProjectionOp::AddGroup {
                icon: GroupIcon::Hardware,
                split: false,
                ..
            })
        ));
    }
}
