//! Maps adapter payloads onto canonical [`GraphEvent`]s.

use std::collections::BTreeMap;

use super::alsa::AlsaInventory;
use super::events::*;
use crate::graph::{
    ConnectionRecord, GraphEvent, GroupRecord, MediaType, Origin, PortDirection, PortRecord,
    Snapshot, Source,
};

/// jackdbus port flags
pub const BUS_PORT_IS_INPUT: u32 = 0x1;
pub const BUS_PORT_IS_OUTPUT: u32 = 0x2;
pub const BUS_PORT_IS_PHYSICAL: u32 = 0x4;

/// jackdbus port type for MIDI; everything else is audio
pub const BUS_PORT_TYPE_MIDI: u32 = 1;

/// Group and port name of a bridge port, decoded from
/// `<bridge>:<Client> [<id>] (capture|playback): <Port>`.
pub fn decode_bridge_name<'a>(bridge: &str, raw_name: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = raw_name.strip_prefix(bridge)?.strip_prefix(':')?;
    let (client, port) = rest
        .split_once(" (capture): ")
        .or_else(|| rest.split_once(" (playback): "))?;
    let client = match client.rfind(" [") {
        Some(i) if client.ends_with(']') => &client[..i],
        _ => client,
    };
    Some((client.trim(), port.trim()))
}

fn split_full_name(name: &str) -> (&str, &str) {
    name.split_once(':').unwrap_or(("", name))
}

/// Stateless apart from the bridge client name and the alias preference.
#[derive(Debug, Clone, Default)]
pub struct EventNormalizer {
    bridge_client: Option<String>,
    /// 0 disables aliases; 1 or 2 picks that JACK alias
    alias_index: usize,
}

impl EventNormalizer {
    pub fn new(alias_index: usize) -> Self {
        Self {
            bridge_client: None,
            alias_index,
        }
    }

    /// Returns true when the name actually changed; JACK-side sources must
    /// then resync so bridge ports get decoded.
    pub fn set_bridge_client(&mut self, name: Option<String>) -> bool {
        let name = name.filter(|n| !n.is_empty());
        if self.bridge_client == name {
            return false;
        }
        log::info!("MIDI bridge client: {:?}", name);
        self.bridge_client = name;
        true
    }

    pub fn normalize(&mut self, event: SourceEvent) -> Vec<GraphEvent> {
        match event {
            SourceEvent::Native(e) => self.native(e),
            SourceEvent::Bus(e) => self.bus(e),
            SourceEvent::Alsa(e) => self.alsa(e),
        }
    }

    /// Build a record for a JACK-namespace port (native or bus).
    fn jack_port(
        &self,
        source: Source,
        full_name: &str,
        direction: PortDirection,
        media_type: MediaType,
        is_physical: bool,
        aliases: &[String],
    ) -> PortRecord {
        if let Some(bridge) = &self.bridge_client
            && let Some((group, port)) = decode_bridge_name(bridge, full_name)
        {
            return PortRecord {
                source,
                origin: Origin::Bridge,
                group_name: group.to_string(),
                raw_name: full_name.to_string(),
                display_name: port.to_string(),
                direction,
                media_type: MediaType::Midi,
                is_physical,
            };
        }

        let (group, short) = split_full_name(full_name);
        let display = self
            .alias_index
            .checked_sub(1)
            .and_then(|i| aliases.get(i))
            .map(|alias| split_full_name(alias).1)
            .unwrap_or(short);

        PortRecord {
            source,
            origin: source.into(),
            group_name: group.to_string(),
            raw_name: full_name.to_string(),
            display_name: display.to_string(),
            direction,
            media_type,
            is_physical,
        }
    }

    fn native_port(&self, info: &JackPortInfo) -> PortRecord {
        let direction = if info.is_input {
            PortDirection::Input
        } else {
            PortDirection::Output
        };
        let media_type = if info.port_type.contains("midi") {
            MediaType::Midi
        } else {
            MediaType::Audio
        };
        self.jack_port(
            Source::Native,
            &info.name,
            direction,
            media_type,
            info.is_physical,
            &info.aliases,
        )
    }

    fn bus_port(&self, client: &str, port: &BusPort) -> Option<PortRecord> {
        let direction = if port.flags & BUS_PORT_IS_INPUT != 0 {
            PortDirection::Input
        } else if port.flags & BUS_PORT_IS_OUTPUT != 0 {
            PortDirection::Output
        } else {
            log::debug!(
                "jackdbus port {} ({}:{}) has no direction, skipped",
                port.id,
                client,
                port.name
            );
            return None;
        };
        let media_type = if port.port_type == BUS_PORT_TYPE_MIDI {
            MediaType::Midi
        } else {
            MediaType::Audio
        };
        Some(self.jack_port(
            Source::Bus,
            &format!("{}:{}", client, port.name),
            direction,
            media_type,
            port.flags & BUS_PORT_IS_PHYSICAL != 0,
            &[],
        ))
    }

    fn native(&mut self, event: NativeEvent) -> Vec<GraphEvent> {
        match event {
            NativeEvent::Attached => vec![GraphEvent::SyncStarted(Source::Native)],
            NativeEvent::Snapshot { ports, connections } => {
                let ports: Vec<PortRecord> = ports.iter().map(|p| self.native_port(p)).collect();
                let connections = connections
                    .into_iter()
                    .map(|(out, inp)| ConnectionRecord::new(out, inp))
                    .collect();
                vec![GraphEvent::FullSnapshot(Snapshot {
                    source: Source::Native,
                    groups: groups_of(&ports),
                    ports,
                    connections,
                })]
            }
            NativeEvent::PortRegistered(info) => {
                vec![GraphEvent::PortAppeared(self.native_port(&info))]
            }
            NativeEvent::PortUnregistered { name } => {
                vec![GraphEvent::PortDisappeared { raw_name: name }]
            }
            NativeEvent::PortRenamed {
                old_name,
                port,
                connections,
            } => {
                let record = self.native_port(&port);
                if old_name == record.raw_name {
                    // Same JACK name: only the alias-derived label moved
                    return vec![GraphEvent::PortRenamed {
                        raw_name: record.raw_name,
                        display_name: record.display_name,
                    }];
                }
                let mut events = vec![
                    GraphEvent::PortDisappeared { raw_name: old_name },
                    GraphEvent::PortAppeared(record),
                ];
                events.extend(
                    connections
                        .into_iter()
                        .map(|(out, inp)| GraphEvent::ConnectionAdded {
                            source: Source::Native,
                            connection: ConnectionRecord::new(out, inp),
                        }),
                );
                events
            }
            NativeEvent::PortsConnected {
                output,
                input,
                connected,
            } => {
                let connection = ConnectionRecord::new(output, input);
                if connected {
                    vec![GraphEvent::ConnectionAdded {
                        source: Source::Native,
                        connection,
                    }]
                } else {
                    vec![GraphEvent::ConnectionRemoved { connection }]
                }
            }
            NativeEvent::ClientRegistered { name, registered } => {
                if self.bridge_client.as_deref() == Some(name.as_str()) {
                    return Vec::new();
                }
                if !registered {
                    // The group itself goes away with its last port
                    return vec![GraphEvent::GroupDisappeared {
                        source: Source::Native,
                        name,
                    }];
                }
                vec![GraphEvent::GroupAppeared {
                    source: Source::Native,
                    group: GroupRecord {
                        name,
                        is_hardware: false,
                    },
                }]
            }
            NativeEvent::Shutdown { reason } => {
                log::info!("JACK shut down the client: {}", reason);
                vec![GraphEvent::SourceLost(Source::Native)]
            }
        }
    }

    fn bus(&mut self, event: BusEvent) -> Vec<GraphEvent> {
        match event {
            BusEvent::Attached => vec![GraphEvent::SyncStarted(Source::Bus)],
            BusEvent::Graph {
                version,
                clients,
                connections,
            } => {
                log::debug!("jackdbus graph version {}", version);
                let ports: Vec<PortRecord> = clients
                    .iter()
                    .flat_map(|c| c.ports.iter().filter_map(|p| self.bus_port(&c.name, p)))
                    .collect();
                let mut groups = groups_of(&ports);
                // Clients without ports still carry a hint
                for client in &clients {
                    log::trace!(
                        "jackdbus client {} {:?}: {} ports",
                        client.id,
                        client.name,
                        client.ports.len()
                    );
                    if client.ports.is_empty()
                        && self.bridge_client.as_deref() != Some(client.name.as_str())
                    {
                        groups.push(GroupRecord {
                            name: client.name.clone(),
                            is_hardware: false,
                        });
                    }
                }
                vec![GraphEvent::FullSnapshot(Snapshot {
                    source: Source::Bus,
                    groups,
                    ports,
                    connections: connections.iter().map(bus_connection).collect(),
                })]
            }
            BusEvent::ClientAppeared { client } => {
                if self.bridge_client.as_deref() == Some(client.as_str()) {
                    return Vec::new();
                }
                vec![GraphEvent::GroupAppeared {
                    source: Source::Bus,
                    group: GroupRecord {
                        name: client,
                        is_hardware: false,
                    },
                }]
            }
            BusEvent::ClientDisappeared { client } => vec![GraphEvent::GroupDisappeared {
                source: Source::Bus,
                name: client,
            }],
            BusEvent::ClientRenamed { old_name, new_name } => vec![GraphEvent::GroupRenamed {
                source: Source::Bus,
                old_name,
                new_name,
            }],
            BusEvent::PortAppeared { client, port } => self
                .bus_port(&client, &port)
                .map(GraphEvent::PortAppeared)
                .into_iter()
                .collect(),
            BusEvent::PortDisappeared { client, port } => vec![GraphEvent::PortDisappeared {
                raw_name: format!("{}:{}", client, port),
            }],
            BusEvent::PortsConnected(c) => {
                log::debug!("jackdbus connection {} added", c.id);
                vec![GraphEvent::ConnectionAdded {
                    source: Source::Bus,
                    connection: bus_connection(&c),
                }]
            }
            BusEvent::PortsDisconnected(c) => vec![GraphEvent::ConnectionRemoved {
                connection: bus_connection(&c),
            }],
            BusEvent::BridgeClientName(name) => {
                self.set_bridge_client(name);
                Vec::new()
            }
            BusEvent::Lost => vec![GraphEvent::SourceLost(Source::Bus)],
        }
    }

    fn alsa(&mut self, event: AlsaEvent) -> Vec<GraphEvent> {
        match event {
            AlsaEvent::Started => vec![GraphEvent::SyncStarted(Source::Alsa)],
            AlsaEvent::Poll(inventory) => vec![GraphEvent::FullSnapshot(alsa_snapshot(&inventory))],
            AlsaEvent::Failed(reason) => {
                log::debug!("ALSA poll failure: {}", reason);
                vec![GraphEvent::SourceLost(Source::Alsa)]
            }
        }
    }
}

/// One group record per distinct group name, hardware if any port is
/// physical, in first-seen order.
fn groups_of(ports: &[PortRecord]) -> Vec<GroupRecord> {
    let mut order = Vec::new();
    let mut hardware: BTreeMap<&str, bool> = BTreeMap::new();
    for port in ports {
        let entry = hardware.entry(port.group_name.as_str()).or_insert_with(|| {
            order.push(port.group_name.as_str());
            false
        });
        *entry |= port.is_physical;
    }
    order
        .into_iter()
        .map(|name| GroupRecord {
            name: name.to_string(),
            is_hardware: hardware.get(name).copied().unwrap_or(false),
        })
        .collect()
}

fn bus_connection(c: &BusConnection) -> ConnectionRecord {
    ConnectionRecord::new(
        format!("{}:{}", c.out_client, c.out_port),
        format!("{}:{}", c.in_client, c.in_port),
    )
}

fn alsa_snapshot(inventory: &AlsaInventory) -> Snapshot {
    let groups = inventory
        .poll_groups()
        .iter()
        .map(|g| GroupRecord {
            name: g.name.clone(),
            is_hardware: g.is_hardware,
        })
        .collect();
    let ports = [PortDirection::Output, PortDirection::Input]
        .into_iter()
        .flat_map(|direction| inventory.poll_ports(direction))
        .map(|p| PortRecord {
            source: Source::Alsa,
            origin: Origin::Alsa,
            group_name: p.group_name.clone(),
            raw_name: p.raw_name.clone(),
            display_name: p.port_name.clone(),
            direction: p.direction,
            media_type: MediaType::Midi,
            is_physical: p.is_hardware,
        })
        .collect();
    let connections = inventory
        .poll_connections()
        .iter()
        .map(|(out, inp)| ConnectionRecord::new(out.clone(), inp.clone()))
        .collect();
    Snapshot {
        source: Source::Alsa,
        groups,
        ports,
        connections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::alsa::parse_listing;

    fn info(name: &str, is_input: bool, physical: bool) -> JackPortInfo {
        JackPortInfo {
            name: name.to_string(),
            is_input,
            is_physical: physical,
            port_type: "32 bit float mono audio".to_string(),
            aliases: vec![
                "alsa_pcm:hw:0:in1".to_string(),
                "system:Mic Left".to_string(),
            ],
        }
    }

    fn port_record(events: &[GraphEvent]) -> &PortRecord {
        match &events[0] {
            GraphEvent::PortAppeared(record) => record,
            other => panic!("expected PortAppeared, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_bridge_name() {
        assert_eq!(
            decode_bridge_name("a2j", "a2j:Midi Through [14] (capture): Midi Through Port-0"),
            Some(("Midi Through", "Midi Through Port-0"))
        );
        assert_eq!(
            decode_bridge_name("a2j", "a2j:USB Keys [20] (playback): USB Keys MIDI 1"),
            Some(("USB Keys", "USB Keys MIDI 1"))
        );
        assert_eq!(decode_bridge_name("a2j", "system:capture_1"), None);
        assert_eq!(decode_bridge_name("a2j", "a2j:control"), None);
    }

    #[test]
    fn test_native_port_plain() {
        let mut n = EventNormalizer::new(0);
        let events = n.normalize(SourceEvent::Native(NativeEvent::PortRegistered(info(
            "system:capture_1",
            false,
            true,
        ))));
        let record = port_record(&events);
        assert_eq!(record.group_name, "system");
        assert_eq!(record.display_name, "capture_1");
        assert_eq!(record.direction, PortDirection::Output);
        assert_eq!(record.media_type, MediaType::Audio);
        assert_eq!(record.origin, Origin::Native);
        assert!(record.is_physical);
    }

    #[test]
    fn test_native_port_alias_display() {
        let mut n = EventNormalizer::new(2);
        let events = n.normalize(SourceEvent::Native(NativeEvent::PortRegistered(info(
            "system:capture_1",
            false,
            true,
        ))));
        let record = port_record(&events);
        assert_eq!(record.raw_name, "system:capture_1");
        assert_eq!(record.display_name, "Mic Left");

        // Out of range falls back to the short name
        let mut n = EventNormalizer::new(5);
        let events = n.normalize(SourceEvent::Native(NativeEvent::PortRegistered(info(
            "system:capture_1",
            false,
            true,
        ))));
        assert_eq!(port_record(&events).display_name, "capture_1");
    }

    #[test]
    fn test_bridge_port_tagging() {
        let mut n = EventNormalizer::new(0);
        assert!(n.set_bridge_client(Some("a2j".to_string())));
        assert!(!n.set_bridge_client(Some("a2j".to_string())));

        let events = n.normalize(SourceEvent::Bus(BusEvent::PortAppeared {
            client: "a2j".to_string(),
            port: BusPort {
                id: 7,
                name: "USB Keys [20] (capture): USB Keys MIDI 1".to_string(),
                flags: BUS_PORT_IS_OUTPUT | BUS_PORT_IS_PHYSICAL,
                port_type: 0,
            },
        }));
        let record = port_record(&events);
        assert_eq!(record.origin, Origin::Bridge);
        assert_eq!(record.source, Source::Bus);
        assert_eq!(record.media_type, MediaType::Midi);
        assert_eq!(record.group_name, "USB Keys");
        assert_eq!(record.display_name, "USB Keys MIDI 1");
        assert_eq!(record.raw_name, "a2j:USB Keys [20] (capture): USB Keys MIDI 1");
        assert_eq!(record.direction, PortDirection::Output);

        // The bridge client itself never becomes a group hint
        let events = n.normalize(SourceEvent::Bus(BusEvent::ClientAppeared {
            client: "a2j".to_string(),
        }));
        assert!(events.is_empty());
    }

    #[test]
    fn test_structural_rename_reannounces_connections() {
        let mut n = EventNormalizer::new(0);
        let events = n.normalize(SourceEvent::Native(NativeEvent::PortRenamed {
            old_name: "synth:out".to_string(),
            port: info("synth:out_L", false, false),
            connections: vec![("synth:out_L".to_string(), "system:playback_1".to_string())],
        }));
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            GraphEvent::PortDisappeared {
                raw_name: "synth:out".to_string()
            }
        );
        assert!(matches!(&events[1], GraphEvent::PortAppeared(p) if p.raw_name == "synth:out_L"));
        assert_eq!(
            events[2],
            GraphEvent::ConnectionAdded {
                source: Source::Native,
                connection: ConnectionRecord::new("synth:out_L", "system:playback_1"),
            }
        );
    }

    #[test]
    fn test_same_name_rename_only_relabels() {
        let mut n = EventNormalizer::new(2);
        let events = n.normalize(SourceEvent::Native(NativeEvent::PortRenamed {
            old_name: "system:capture_1".to_string(),
            port: info("system:capture_1", false, true),
            connections: vec![("system:capture_1".to_string(), "synth:in".to_string())],
        }));
        assert_eq!(
            events,
            vec![GraphEvent::PortRenamed {
                raw_name: "system:capture_1".to_string(),
                display_name: "Mic Left".to_string(),
            }]
        );
    }

    #[test]
    fn test_client_departure_retires_hint() {
        let mut n = EventNormalizer::new(0);
        let events = n.normalize(SourceEvent::Native(NativeEvent::ClientRegistered {
            name: "synth".to_string(),
            registered: false,
        }));
        assert_eq!(
            events,
            vec![GraphEvent::GroupDisappeared {
                source: Source::Native,
                name: "synth".to_string(),
            }]
        );

        let events = n.normalize(SourceEvent::Bus(BusEvent::ClientDisappeared {
            client: "synth".to_string(),
        }));
        assert_eq!(
            events,
            vec![GraphEvent::GroupDisappeared {
                source: Source::Bus,
                name: "synth".to_string(),
            }]
        );
    }

    #[test]
    fn test_bus_port_without_direction_skipped() {
        let mut n = EventNormalizer::new(0);
        let events = n.normalize(SourceEvent::Bus(BusEvent::PortAppeared {
            client: "odd".to_string(),
            port: BusPort {
                id: 4,
                name: "x".to_string(),
                flags: BUS_PORT_IS_PHYSICAL,
                port_type: 0,
            },
        }));
        assert!(events.is_empty());
    }

    #[test]
    fn test_bus_graph_snapshot() {
        let mut n = EventNormalizer::new(0);
        let events = n.normalize(SourceEvent::Bus(BusEvent::Graph {
            version: 12,
            clients: vec![
                BusClient {
                    id: 1,
                    name: "system".to_string(),
                    ports: vec![BusPort {
                        id: 1,
                        name: "playback_1".to_string(),
                        flags: BUS_PORT_IS_INPUT | BUS_PORT_IS_PHYSICAL,
                        port_type: 0,
                    }],
                },
                BusClient {
                    id: 2,
                    name: "synth".to_string(),
                    ports: vec![BusPort {
                        id: 2,
                        name: "midi_in".to_string(),
                        flags: BUS_PORT_IS_INPUT,
                        port_type: BUS_PORT_TYPE_MIDI,
                    }],
                },
                BusClient {
                    id: 3,
                    name: "idle".to_string(),
                    ports: Vec::new(),
                },
            ],
            connections: Vec::new(),
        }));
        let GraphEvent::FullSnapshot(snapshot) = &events[0] else {
            panic!("expected snapshot");
        };
        assert_eq!(snapshot.source, Source::Bus);
        assert_eq!(
            snapshot.groups,
            vec![
                GroupRecord {
                    name: "system".to_string(),
                    is_hardware: true
                },
                GroupRecord {
                    name: "synth".to_string(),
                    is_hardware: false
                },
                GroupRecord {
                    name: "idle".to_string(),
                    is_hardware: false
                },
            ]
        );
        assert_eq!(snapshot.ports[1].media_type, MediaType::Midi);
        assert_eq!(snapshot.ports[0].raw_name, "system:playback_1");
    }

    #[test]
    fn test_alsa_poll_snapshot() {
        let mut inventory = AlsaInventory::default();
        inventory.add_ports(
            PortDirection::Output,
            &parse_listing("client 20: 'Keys' [type=kernel,card=1]\n    0 'Keys MIDI 1'\n"),
        );
        let mut n = EventNormalizer::new(0);
        let events = n.normalize(SourceEvent::Alsa(AlsaEvent::Poll(inventory)));
        let GraphEvent::FullSnapshot(snapshot) = &events[0] else {
            panic!("expected snapshot");
        };
        assert_eq!(snapshot.source, Source::Alsa);
        assert_eq!(snapshot.ports[0].raw_name, "20:0/capture");
        assert_eq!(snapshot.ports[0].media_type, MediaType::Midi);
        assert!(snapshot.ports[0].is_physical);
        assert!(snapshot.groups[0].is_hardware);

        assert_eq!(
            n.normalize(SourceEvent::Alsa(AlsaEvent::Failed("boom".into()))),
            vec![GraphEvent::SourceLost(Source::Alsa)]
        );
    }
}
