//! Raw adapter payloads
//!
//! These are the shapes each adapter posts onto the inbound channel. They
//! stay close to what the backend reports; the normalizer turns them into
//! [`GraphEvent`](crate::graph::GraphEvent)s.

use super::alsa::AlsaInventory;

/// Everything posted onto the synchronizer's inbound channel
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Native(NativeEvent),
    Bus(BusEvent),
    Alsa(AlsaEvent),
}

/// A JACK port as seen through the client API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JackPortInfo {
    /// Full `client:port` name
    pub name: String,
    pub is_input: bool,
    pub is_physical: bool,
    /// JACK type string, e.g. `8 bit raw midi`
    pub port_type: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    /// Client opened, enumeration follows
    Attached,
    /// Ports and (output, input) connections present at attach time
    Snapshot {
        ports: Vec<JackPortInfo>,
        connections: Vec<(String, String)>,
    },
    PortRegistered(JackPortInfo),
    PortUnregistered {
        name: String,
    },
    /// Full-name change; `connections` are the renamed port's current links
    PortRenamed {
        old_name: String,
        port: JackPortInfo,
        connections: Vec<(String, String)>,
    },
    PortsConnected {
        output: String,
        input: String,
        connected: bool,
    },
    ClientRegistered {
        name: String,
        registered: bool,
    },
    Shutdown {
        reason: String,
    },
}

/// One port entry of the jackdbus graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusPort {
    pub id: u64,
    pub name: String,
    pub flags: u32,
    pub port_type: u32,
}

/// One client entry of the jackdbus graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusClient {
    pub id: u64,
    pub name: String,
    pub ports: Vec<BusPort>,
}

/// One connection entry of the jackdbus graph, source side first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConnection {
    pub out_client: String,
    pub out_port: String,
    pub in_client: String,
    pub in_port: String,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Server reachable, graph fetch follows
    Attached,
    Graph {
        version: u64,
        clients: Vec<BusClient>,
        connections: Vec<BusConnection>,
    },
    ClientAppeared {
        client: String,
    },
    ClientDisappeared {
        client: String,
    },
    ClientRenamed {
        old_name: String,
        new_name: String,
    },
    PortAppeared {
        client: String,
        port: BusPort,
    },
    PortDisappeared {
        client: String,
        port: String,
    },
    PortsConnected(BusConnection),
    PortsDisconnected(BusConnection),
    /// Result of asking the MIDI bridge for its JACK client name
    BridgeClientName(Option<String>),
    /// Server stopped or jackdbus went away
    Lost,
}

#[derive(Debug, Clone)]
pub enum AlsaEvent {
    /// Worker started; first poll follows
    Started,
    Poll(AlsaInventory),
    Failed(String),
}
