use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Synthesized group identifier, never reused within a process
    GroupId
);
entity_id!(
    /// Synthesized port identifier, never reused within a process
    PortId
);
entity_id!(
    /// Synthesized connection identifier, never reused within a process
    ConnectionId
);

/// Media type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Midi,
}

/// Port direction (Input sorts before Output for display)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

/// The adapter that delivered an entity.
///
/// Every entity belongs to exactly one source; losing a source tears down
/// only what it delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// In-process JACK client
    Native,
    /// jackdbus on the session bus
    Bus,
    /// `aconnect` polling
    Alsa,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Native, Source::Bus, Source::Alsa];

    pub fn label(self) -> &'static str {
        match self {
            Source::Native => "native",
            Source::Bus => "bus",
            Source::Alsa => "alsa",
        }
    }
}

/// The sources currently reporting an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceSet(u8);

impl SourceSet {
    fn bit(source: Source) -> u8 {
        match source {
            Source::Native => 0b001,
            Source::Bus => 0b010,
            Source::Alsa => 0b100,
        }
    }

    pub fn only(source: Source) -> Self {
        Self(Self::bit(source))
    }

    pub fn contains(self, source: Source) -> bool {
        self.0 & Self::bit(source) != 0
    }

    pub fn insert(&mut self, source: Source) {
        self.0 |= Self::bit(source);
    }

    pub fn remove(&mut self, source: Source) {
        self.0 &= !Self::bit(source);
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which backend produced an entity.
///
/// Differs from [`Source`] only for bridge ports: a2j re-exposes ALSA
/// ports inside the JACK namespace, so they are delivered by the native or
/// bus source but originate from the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Native,
    Bus,
    Alsa,
    Bridge,
}

impl From<Source> for Origin {
    fn from(source: Source) -> Self {
        match source {
            Source::Native => Origin::Native,
            Source::Bus => Origin::Bus,
            Source::Alsa => Origin::Alsa,
        }
    }
}

/// Icon hint passed to the canvas when a group is added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupIcon {
    Application,
    Hardware,
    MidiBridge,
}

/// Per-source synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceState {
    /// Never attached (or disabled)
    Unattached,
    /// Attached, waiting for the first full snapshot
    Syncing,
    /// Snapshot applied, incremental events flowing
    Live,
    /// Lost mid-session; entities torn down, reconnect pending
    Degraded,
}

/// A routing-graph client node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub origin: Origin,
    pub is_hardware: bool,
    /// Sticky once set: the group renders as capture and playback halves
    pub is_split: bool,
}

impl Group {
    pub fn icon(&self) -> GroupIcon {
        if self.origin == Origin::Bridge {
            GroupIcon::MidiBridge
        } else if self.is_hardware {
            GroupIcon::Hardware
        } else {
            GroupIcon::Application
        }
    }
}

/// A port on a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub id: PortId,
    pub group_id: GroupId,
    /// Backend-qualified name, the join key across snapshots and events
    pub raw_name: String,
    pub display_name: String,
    pub direction: PortDirection,
    pub media_type: MediaType,
    pub origin: Origin,
    /// Every adapter that currently reports the port
    pub sources: SourceSet,
    pub is_physical: bool,
}

/// A directed link from an output port to an input port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub output_port_id: PortId,
    pub input_port_id: PortId,
    pub sources: SourceSet,
}

/// A group as reported by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub name: String,
    pub is_hardware: bool,
}

/// A port as reported by a backend, already normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    pub source: Source,
    pub origin: Origin,
    pub group_name: String,
    pub raw_name: String,
    pub display_name: String,
    pub direction: PortDirection,
    pub media_type: MediaType,
    pub is_physical: bool,
}

/// A connection as reported by a backend, by raw port names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionRecord {
    pub output: String,
    pub input: String,
}

impl ConnectionRecord {
    pub fn new(output: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            input: input.into(),
        }
    }
}

/// Full enumeration of one source's current graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub source: Source,
    pub groups: Vec<GroupRecord>,
    pub ports: Vec<PortRecord>,
    pub connections: Vec<ConnectionRecord>,
}

impl Snapshot {
    #[cfg(test)]
    pub fn empty(source: Source) -> Self {
        Self {
            source,
            groups: Vec::new(),
            ports: Vec::new(),
            connections: Vec::new(),
        }
    }
}

/// Canonical events consumed by the synchronizer.
///
/// Every adapter payload is mapped onto this enum by the normalizer; no
/// backend-specific shape crosses that boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    /// A client was announced; carries hints used when its group is created
    GroupAppeared { source: Source, group: GroupRecord },
    /// A client went away; its group leaves with its last port, this only
    /// retires the hint
    GroupDisappeared { source: Source, name: String },
    /// A client changed its name
    GroupRenamed {
        source: Source,
        old_name: String,
        new_name: String,
    },
    PortAppeared(PortRecord),
    /// Alias rename: only the display name changes
    PortRenamed {
        raw_name: String,
        display_name: String,
    },
    PortDisappeared { raw_name: String },
    ConnectionAdded {
        source: Source,
        connection: ConnectionRecord,
    },
    ConnectionRemoved { connection: ConnectionRecord },
    /// The adapter attached and is fetching a snapshot
    SyncStarted(Source),
    /// The backend went away mid-session
    SourceLost(Source),
    FullSnapshot(Snapshot),
    /// One ALSA poll interval elapsed
    PollCycle,
}
