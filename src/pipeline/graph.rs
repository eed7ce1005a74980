//! Topology snapshots using daggy.
//!
//! Stages link to each other directly; a [`Topology`] is a read-only
//! snapshot of everything reachable downstream of one stage, used for
//! start/stop ordering and the diagnostic dumps.

use crate::stage::Stage;
use daggy::petgraph::algo::toposort;
use daggy::{Dag, NodeIndex, Walker};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt::Write;

/// The subgraph below a root stage.
pub struct Topology {
    graph: Dag<Stage, ()>,
    root: NodeIndex,
}

impl Topology {
    /// Snapshot `root` and every stage reachable from it.
    pub fn from_root(root: &Stage) -> Self {
        let mut graph = Dag::new();
        let mut index: HashMap<u64, NodeIndex> = HashMap::new();
        let root_idx = graph.add_node(root.clone());
        index.insert(root.id(), root_idx);

        let mut pending = VecDeque::from([root.clone()]);
        while let Some(stage) = pending.pop_front() {
            let parent = index[&stage.id()];
            for child in stage.consumers() {
                if index.contains_key(&child.id()) {
                    continue;
                }
                let (_, child_idx) = graph.add_child(parent, (), child.clone());
                index.insert(child.id(), child_idx);
                pending.push_back(child);
            }
        }

        Self {
            graph,
            root: root_idx,
        }
    }

    /// The stage the snapshot was taken from.
    pub fn root(&self) -> &Stage {
        &self.graph[self.root]
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Every stage, producers before consumers.
    pub fn stop_order(&self) -> Vec<Stage> {
        let order = toposort(self.graph.graph(), None)
            .unwrap_or_else(|_| self.graph.graph().node_indices().collect());
        order.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }

    /// Every stage, consumers before producers.
    pub fn start_order(&self) -> Vec<Stage> {
        let mut order = self.stop_order();
        order.reverse();
        order
    }

    /// Stages with no consumers.
    pub fn sinks(&self) -> Vec<Stage> {
        self.graph
            .graph()
            .node_indices()
            .filter(|&idx| self.children(idx).is_empty())
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Children in link order.
    fn children(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut children: Vec<NodeIndex> = self
            .graph
            .children(idx)
            .iter(&self.graph)
            .map(|(_, child)| child)
            .collect();
        children.reverse();
        children
    }

    /// One line per stage, indented by depth.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        self.render_node(self.root, 0, &mut out);
        out
    }

    fn render_node(&self, idx: NodeIndex, depth: usize, out: &mut String) {
        let stage = &self.graph[idx];
        let indent = if depth == 0 {
            String::new()
        } else {
            format!("{}`-> ", "    ".repeat(depth - 1))
        };
        let para = stage
            .output_para()
            .map(|p| p.to_string())
            .unwrap_or_else(|_| "not negotiated".to_string());
        let buffers = stage.options().buffer_count;
        let _ = writeln!(
            out,
            "{indent}{} [{} {}] {para} buffers={buffers}",
            stage.name(),
            stage.kind(),
            stage.state()
        );
        for child in self.children(idx) {
            self.render_node(child, depth + 1, out);
        }
    }

    /// One row per stage with its counters and pool usage.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<24} {:<14} {:<12} {:>9} {:>9} {:>8} {:>7} {:>7} {:>9}",
            "stage", "kind", "state", "produced", "consumed", "dropped", "errors", "queued", "pool"
        );
        for stage in self.stop_order() {
            let stats = stage.stats();
            let pool = match &stats.pool {
                Some(pool) => format!("{}/{}", pool.free, pool.capacity),
                None => "-".to_string(),
            };
            let _ = writeln!(
                out,
                "{:<24} {:<14} {:<12} {:>9} {:>9} {:>8} {:>7} {:>7} {:>9}",
                stage.name(),
                stage.kind().name(),
                stage.state().name(),
                stats.produced,
                stats.consumed,
                stats.dropped,
                stats.errors,
                stats.queued,
                pool
            );
        }
        out
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("root", &self.root().name())
            .field("stages", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{NullSink, PatternSource};
    use crate::format::{ImagePara, PixelFormat};
    use crate::stage::StageOptions;

    fn tree() -> (Stage, Stage, Stage, Stage) {
        let src = Stage::new(
            "src",
            PatternSource::new(ImagePara::new(8, 8, PixelFormat::Gray8)),
        );
        let a = Stage::with_options("a", NullSink::forwarding(), StageOptions::pass_through());
        let b = Stage::with_options("b", NullSink::new(), StageOptions::pass_through());
        let c = Stage::with_options("c", NullSink::new(), StageOptions::pass_through());
        a.set_productor(&src).unwrap();
        b.set_productor(&a).unwrap();
        c.set_productor(&src).unwrap();
        (src, a, b, c)
    }

    #[test]
    fn test_ordering() {
        let (src, a, b, c) = tree();
        let topology = Topology::from_root(&src);
        assert_eq!(topology.len(), 4);

        let stop = topology.stop_order();
        let pos = |s: &Stage| stop.iter().position(|x| x == s).unwrap();
        assert_eq!(pos(&src), 0);
        assert!(pos(&a) < pos(&b));

        let start = topology.start_order();
        assert_eq!(start.last(), Some(&src));

        let sinks = topology.sinks();
        assert_eq!(sinks.len(), 2);
        assert!(sinks.contains(&b) && sinks.contains(&c));
    }

    #[test]
    fn test_render_tree() {
        let (src, ..) = tree();
        let dump = Topology::from_root(&src).render_tree();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("src [source Created]"));
        assert!(lines[1].starts_with("`-> a [sink"));
        assert!(lines[2].starts_with("    `-> b [sink"));
        assert!(lines[3].starts_with("`-> c [sink"));
    }

    #[test]
    fn test_render_summary() {
        let (src, ..) = tree();
        src.init().unwrap();
        let summary = Topology::from_root(&src).render_summary();
        assert_eq!(summary.lines().count(), 5);
        assert!(summary.contains("0/4") || summary.contains("4/4"));
    }
}
