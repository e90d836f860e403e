// graph.rs — Dependency graph between launches and transfers.
//
// Every operation that produces a completion signal becomes a node holding
// the buffers it read, the buffers it wrote, and the signals it waited on.
// The graph answers one question for the orchestrator: which signals must a
// new launch wait on?
//
//   read-after-write   the latest writer of every buffer the launch reads
//   write-after-write  the latest writer of every buffer it writes
//   write-after-read   every reader of a written buffer since its last write
//
// The last two are only added while still in flight: a signal that has been
// retired (the host blocked on it or on a descendant), or that is already an
// ancestor of a read-after-write dependency, is implied and left out. In the
// three segmentation pipelines this leaves exactly the read-after-write set.
//
// Nodes are appended in issue order and may only wait on earlier nodes, so
// the graph is acyclic by construction; `validate()` re-checks that.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::buffers::BufferId;
use crate::dispatch::Signal;
use crate::error::{Result, SegmentError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Kernel launch.
    Dispatch,
    /// Host → device upload.
    Transfer,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub label: String,
    pub signal: Signal,
    pub kind: NodeKind,
    pub reads: Vec<BufferId>,
    pub writes: Vec<BufferId>,
    pub waits: Vec<Signal>,
}

#[derive(Debug, Clone, Default)]
pub struct WaitGraph {
    nodes: Vec<Node>,
    index: HashMap<Signal, usize>,
    last_writer: HashMap<BufferId, Signal>,
    /// Readers of each buffer since its last write.
    readers: HashMap<BufferId, Vec<Signal>>,
    retired: HashSet<Signal>,
}

impl WaitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait list for an operation that reads `reads` and writes `writes`.
    pub fn plan(&self, reads: &[BufferId], writes: &[BufferId]) -> Vec<Signal> {
        let mut waits: Vec<Signal> = Vec::new();
        for buffer in reads {
            if let Some(&writer) = self.last_writer.get(buffer) {
                if !waits.contains(&writer) {
                    waits.push(writer);
                }
            }
        }

        let implied = self.ancestors(&waits);
        let mut hazards: Vec<Signal> = Vec::new();
        for buffer in writes {
            let readers = self.readers.get(buffer).into_iter().flatten();
            let previous = self.last_writer.get(buffer).into_iter();
            for &signal in readers.chain(previous) {
                if self.retired.contains(&signal)
                    || implied.contains(&signal)
                    || hazards.contains(&signal)
                {
                    continue;
                }
                hazards.push(signal);
            }
        }

        // A hazard that another hazard already waits on is redundant.
        let covered: HashSet<Signal> = hazards
            .iter()
            .filter_map(|&h| self.node(h))
            .flat_map(|node| self.ancestors(&node.waits))
            .collect();
        waits.extend(hazards.into_iter().filter(|h| !covered.contains(h)));
        waits
    }

    /// Append a node. `waits` must only name signals already recorded.
    pub fn record(
        &mut self,
        label: impl Into<String>,
        signal: Signal,
        kind: NodeKind,
        reads: &[BufferId],
        writes: &[BufferId],
        waits: &[Signal],
    ) {
        for buffer in reads {
            if !writes.contains(buffer) {
                self.readers.entry(*buffer).or_default().push(signal);
            }
        }
        for buffer in writes {
            self.last_writer.insert(*buffer, signal);
            self.readers.remove(buffer);
        }
        self.index.insert(signal, self.nodes.len());
        self.nodes.push(Node {
            label: label.into(),
            signal,
            kind,
            reads: reads.to_vec(),
            writes: writes.to_vec(),
            waits: waits.to_vec(),
        });
    }

    /// Mark `signals` and everything they transitively waited on complete.
    pub fn retire(&mut self, signals: &[Signal]) {
        let done = self.ancestors(signals);
        self.retired.extend(done);
    }

    pub fn is_retired(&self, signal: Signal) -> bool {
        self.retired.contains(&signal)
    }

    /// Most recent writer of `buffer`.
    pub fn last_writer(&self, buffer: BufferId) -> Option<Signal> {
        self.last_writer.get(&buffer).copied()
    }

    pub fn node(&self, signal: Signal) -> Option<&Node> {
        self.index.get(&signal).map(|&i| &self.nodes[i])
    }

    /// Nodes in issue order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `signals` plus every node they transitively wait on.
    fn ancestors(&self, signals: &[Signal]) -> HashSet<Signal> {
        let mut seen = HashSet::new();
        let mut stack: Vec<Signal> = signals.to_vec();
        while let Some(s) = stack.pop() {
            if !seen.insert(s) {
                continue;
            }
            if let Some(node) = self.node(s) {
                stack.extend(node.waits.iter().copied());
            }
        }
        seen
    }

    /// Check that every wait names an earlier node.
    pub fn validate(&self) -> Result<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            for wait in &node.waits {
                match self.index.get(wait) {
                    Some(&j) if j < i => {}
                    _ => return Err(SegmentError::UnknownSignal(*wait)),
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for WaitGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            write!(f, "{} {}", node.signal, node.label)?;
            if !node.waits.is_empty() {
                let waits: Vec<String> = node.waits.iter().map(|s| s.to_string()).collect();
                write!(f, " <- {}", waits.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
