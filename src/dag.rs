use crate::error::{CoreError, Result};
use std::collections::VecDeque;

/// Sentinel in-degree value for a node that has been removed via
/// `remove_finished_node`. Distinguishes "done" from "in-degree genuinely 0
/// but not yet removed".
const DONE: i64 = -1;

/// One DAG vertex: successor/predecessor indices plus the
/// in-degree counter the scheduler drains as predecessors complete.
#[derive(Debug, Clone)]
struct NodeEntry {
    successors: Vec<usize>,
    predecessors: Vec<usize>,
    in_degree: i64,
    started: bool,
}

/// Dependency oracle for the Job Tracker. Built once from the
/// submitted successor lists at job-submit time; node count and edges are
/// immutable thereafter, only the in-degree/started bookkeeping mutates.
#[derive(Debug, Clone)]
pub struct DagScheduler {
    nodes: Vec<NodeEntry>,
    unfinished: usize,
}

impl DagScheduler {
    /// `successors[i]` lists the direct successors of node `i`. Predecessor
    /// lists and in-degree counters are derived here.
    pub fn new(successors: Vec<Vec<usize>>) -> Result<Self> {
        let n = successors.len();
        let mut nodes: Vec<NodeEntry> = (0..n)
            .map(|_| NodeEntry {
                successors: Vec::new(),
                predecessors: Vec::new(),
                in_degree: 0,
                started: false,
            })
            .collect();

        for (i, succs) in successors.into_iter().enumerate() {
            for s in succs {
                if s >= n {
                    return Err(CoreError::InvalidDescriptor(format!(
                        "node {i} lists out-of-range successor {s}"
                    )));
                }
                nodes[i].successors.push(s);
                nodes[s].predecessors.push(i);
                nodes[s].in_degree += 1;
            }
        }

        let scheduler = Self { nodes, unfinished: n };
        if !scheduler.validate() {
            return Err(CoreError::DagCycle);
        }
        Ok(scheduler)
    }

    /// Kahn's-algorithm cycle check: drain nodes with in-degree 0,
    /// decrementing successors, until no more can be drained. Acyclic iff
    /// every node was drained.
    pub fn validate(&self) -> bool {
        let mut in_degree: Vec<i64> = self.nodes.iter().map(|n| n.in_degree).collect();
        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut drained = 0;
        while let Some(node) = queue.pop_front() {
            drained += 1;
            for &succ in &self.nodes[node].successors {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    queue.push_back(succ);
                }
            }
        }
        drained == self.nodes.len()
    }

    /// Nodes whose in-degree is 0 and that have not yet been started.
    pub fn available_nodes(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.in_degree == 0 && !n.started)
            .map(|(i, _)| i)
            .collect()
    }

    /// Marks `node` as started so it is no longer returned by
    /// `available_nodes`. Distinct from completion: a node can be started
    /// (workers provisioned) well before it is finished.
    pub fn mark_started(&mut self, node: usize) -> Result<()> {
        self.nodes
            .get_mut(node)
            .ok_or(CoreError::StageNotFound(node))?
            .started = true;
        Ok(())
    }

    /// Direct successors of `node`. `None` conventionally means "the
    /// virtual root" and returns `sources()`.
    pub fn next_nodes(&self, node: Option<usize>) -> Vec<usize> {
        match node {
            None => self.sources(),
            Some(n) => self.nodes.get(n).map(|e| e.successors.clone()).unwrap_or_default(),
        }
    }

    pub fn predecessors(&self, node: usize) -> Vec<usize> {
        self.nodes.get(node).map(|e| e.predecessors.clone()).unwrap_or_default()
    }

    /// Nodes with no predecessors.
    pub fn sources(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.predecessors.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Nodes with no successors.
    pub fn destinations(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.successors.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Sets `node`'s in-degree to the `DONE` sentinel and decrements every
    /// successor's in-degree, returning the successors whose in-degree just
    /// hit 0 (those become eligible for `Start()` by the caller). Idempotent
    /// per node: a second call on an already-done node is a no-op returning
    /// an empty vec, not an error, since concurrent finished-callbacks can
    /// race on siblings.
    pub fn remove_finished_node(&mut self, node: usize) -> Result<Vec<usize>> {
        let entry = self.nodes.get(node).ok_or(CoreError::StageNotFound(node))?;
        if entry.in_degree == DONE {
            return Ok(Vec::new());
        }
        let successors = entry.successors.clone();
        self.nodes[node].in_degree = DONE;
        self.unfinished -= 1;

        let mut newly_available = Vec::new();
        for succ in successors {
            let d = &mut self.nodes[succ].in_degree;
            if *d > 0 {
                *d -= 1;
                if *d == 0 {
                    newly_available.push(succ);
                }
            }
        }
        Ok(newly_available)
    }

    /// Count of nodes not yet removed via `remove_finished_node`.
    pub fn unfinished_nodes(&self) -> usize {
        self.unfinished
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Current in-degree, or `None` if `node` is out of range. `DONE` (-1)
    /// means already removed. Used by the Job Tracker's nearly-finished
    /// handler: a successor with in-degree 1 has no unfinished predecessor
    /// other than the node that just fired the callback.
    pub fn in_degree(&self, node: usize) -> Option<i64> {
        self.nodes.get(node).map(|n| n.in_degree)
    }

    pub fn is_started(&self, node: usize) -> bool {
        self.nodes.get(node).map(|n| n.started).unwrap_or(false)
    }

    /// Raw in-degree/started vectors, for checkpointing.
    pub fn snapshot(&self) -> (Vec<i64>, Vec<bool>) {
        (
            self.nodes.iter().map(|n| n.in_degree).collect(),
            self.nodes.iter().map(|n| n.started).collect(),
        )
    }

    /// Rebuilds a scheduler from the original successor lists plus a prior
    /// snapshot's in-degree/started vectors, restoring exactly the
    /// progress recorded at checkpoint time (the edges themselves are
    /// immutable and are always reconstructed fresh from `successors`).
    pub fn restore(successors: Vec<Vec<usize>>, in_degree: Vec<i64>, started: Vec<bool>) -> Result<Self> {
        let mut scheduler = Self::new(successors)?;
        if in_degree.len() != scheduler.nodes.len() || started.len() != scheduler.nodes.len() {
            return Err(CoreError::PersistedStateCorrupted(
                "dag snapshot length mismatch".to_string(),
            ));
        }
        let mut unfinished = 0;
        for (i, node) in scheduler.nodes.iter_mut().enumerate() {
            node.in_degree = in_degree[i];
            node.started = started[i];
            if in_degree[i] != DONE {
                unfinished += 1;
            }
        }
        scheduler.unfinished = unfinished;
        Ok(scheduler)
    }
}
