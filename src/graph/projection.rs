//! Canvas projection
//!
//! The synchronizer reports every visible change through [`CanvasProjection`].
//! The canvas itself lives in another process; the binary streams the calls
//! as JSON lines.

use std::io::Write;

use serde::Serialize;

use super::types::*;

/// Receiver of graph changes, in the order they must be drawn.
pub trait CanvasProjection {
    fn add_group(&mut self, id: GroupId, name: &str, split: bool, icon: GroupIcon);
    fn remove_group(&mut self, id: GroupId);
    fn rename_group(&mut self, id: GroupId, name: &str);
    fn add_port(
        &mut self,
        group_id: GroupId,
        id: PortId,
        name: &str,
        direction: PortDirection,
        media_type: MediaType,
    );
    fn remove_port(&mut self, id: PortId);
    fn rename_port(&mut self, id: PortId, name: &str);
    fn connect(&mut self, id: ConnectionId, output: PortId, input: PortId);
    fn disconnect(&mut self, id: ConnectionId);
}

/// One projection call as data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProjectionOp {
    AddGroup {
        id: GroupId,
        name: String,
        split: bool,
        icon: GroupIcon,
    },
    RemoveGroup {
        id: GroupId,
    },
    RenameGroup {
        id: GroupId,
        name: String,
    },
    AddPort {
        group_id: GroupId,
        id: PortId,
        name: String,
        direction: PortDirection,
        media_type: MediaType,
    },
    RemovePort {
        id: PortId,
    },
    RenamePort {
        id: PortId,
        name: String,
    },
    Connect {
        id: ConnectionId,
        output: PortId,
        input: PortId,
    },
    Disconnect {
        id: ConnectionId,
    },
}

/// Anything that consumes projection calls as [`ProjectionOp`] values gets
/// [`CanvasProjection`] for free.
pub trait OpSink {
    fn push_op(&mut self, op: ProjectionOp);
}

impl<T: OpSink> CanvasProjection for T {
    fn add_group(&mut self, id: GroupId, name: &str, split: bool, icon: GroupIcon) {
        self.push_op(ProjectionOp::AddGroup {
            id,
            name: name.to_string(),
            split,
            icon,
        });
    }
    fn remove_group(&mut self, id: GroupId) {
        self.push_op(ProjectionOp::RemoveGroup { id });
    }
    fn rename_group(&mut self, id: GroupId, name: &str) {
        self.push_op(ProjectionOp::RenameGroup {
            id,
            name: name.to_string(),
        });
    }
    fn add_port(
        &mut self,
        group_id: GroupId,
        id: PortId,
        name: &str,
        direction: PortDirection,
        media_type: MediaType,
    ) {
        self.push_op(ProjectionOp::AddPort {
            group_id,
            id,
            name: name.to_string(),
            direction,
            media_type,
        });
    }
    fn remove_port(&mut self, id: PortId) {
        self.push_op(ProjectionOp::RemovePort { id });
    }
    fn rename_port(&mut self, id: PortId, name: &str) {
        self.push_op(ProjectionOp::RenamePort {
            id,
            name: name.to_string(),
        });
    }
    fn connect(&mut self, id: ConnectionId, output: PortId, input: PortId) {
        self.push_op(ProjectionOp::Connect { id, output, input });
    }
    fn disconnect(&mut self, id: ConnectionId) {
        self.push_op(ProjectionOp::Disconnect { id });
    }
}

/// Collects ops in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub struct Recorder {
    pub ops: Vec<ProjectionOp>,
}

#[cfg(test)]
impl Recorder {
    pub fn take(&mut self) -> Vec<ProjectionOp> {
        std::mem::take(&mut self.ops)
    }
}

#[cfg(test)]
impl OpSink for Recorder {
    fn push_op(&mut self, op: ProjectionOp) {
        self.ops.push(op);
    }
}

/// Writes one JSON object per op, flushing after each line
pub struct JsonLinesProjection<W: Write> {
    out: W,
    failed: bool,
}

impl<W: Write> JsonLinesProjection<W> {
    pub fn new(out: W) -> Self {
        Self { out, failed: false }
    }
}

impl<W: Write> OpSink for JsonLinesProjection<W> {
    fn push_op(&mut self, op: ProjectionOp) {
        if self.failed {
            return;
        }
        let result = serde_json::to_writer(&mut self.out, &op)
            .map_err(std::io::Error::from)
            .and_then(|_| self.out.write_all(b"\n"))
            .and_then(|_| self.out.flush());
        if let Err(e) = result {
            // Reader went away: keep synchronizing, stop writing.
            log::error!("Projection output failed, further ops dropped: {}", e);
            self.failed = true;
        }
    }
}
