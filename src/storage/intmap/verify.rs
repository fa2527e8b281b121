use serde::Serialize;
use tracing::error;

use super::engine::probe;
use super::header::TreeHeader;
use super::node::{corrupted, BufferMode, NodeCtx, NodeKind, NodeView, HASH_FREE};
use crate::types::{PageAddress, Result};

const MAX_FINDINGS: usize = 32;

/// Counts gathered by a full structural walk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Nodes reachable from the root.
    pub nodes: u64,
    /// Interior nodes reachable from the root.
    pub interior_nodes: u64,
    /// Sorted leaves reachable from the root.
    pub leaves: u64,
    /// Hashed leaves reachable from the root.
    pub hashed_leaves: u64,
    /// Records found in leaves; the header-held key 0 is not among them.
    pub records: u64,
    /// Depth shared by every leaf.
    pub leaf_depth: u32,
}

#[derive(Clone, Copy)]
struct Bounds {
    lower: Option<i32>,
    upper: Option<i32>,
}

impl Bounds {
    fn admits(&self, key: i32) -> bool {
        self.lower.map_or(true, |lower| key >= lower) && self.upper.map_or(true, |upper| key < upper)
    }
}

struct Walk<'h> {
    header: &'h TreeHeader,
    report: ConsistencyReport,
    findings: Vec<&'static str>,
}

impl Walk<'_> {
    fn push(&mut self, reason: &'static str) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(reason);
        }
    }

    fn visit(&mut self, ctx: NodeCtx<'_>, address: PageAddress, depth: u32, bounds: Bounds) -> Result<()> {
        if depth > self.header.height {
            self.push("node below the recorded height");
            return Ok(());
        }
        let mut node = NodeView::open(ctx, address, BufferMode::Regular)?;
        self.report.nodes += 1;
        match node.kind() {
            NodeKind::Interior => self.visit_interior(ctx, &mut node, depth, bounds),
            NodeKind::Leaf => {
                self.check_leaf_depth(depth);
                self.report.leaves += 1;
                let keys = node.sorted_keys()?;
                self.report.records += keys.len() as u64;
                if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
                    self.push("leaf keys out of order");
                }
                if keys.iter().any(|&key| !bounds.admits(key)) {
                    self.push("leaf key outside its separator bounds");
                }
                Ok(())
            }
            NodeKind::HashedLeaf => {
                self.check_leaf_depth(depth);
                self.report.hashed_leaves += 1;
                let pairs = node.leaf_pairs()?;
                self.report.records += pairs.len() as u64;
                if pairs.len() != node.children_count() as usize {
                    self.push("hashed leaf occupancy disagrees with its count");
                }
                for (key, _) in pairs {
                    if key == HASH_FREE {
                        self.push("key 0 stored in a hashed leaf");
                    }
                    if !bounds.admits(key) {
                        self.push("leaf key outside its separator bounds");
                    }
                    if probe(&mut node, key)?.0.is_err() {
                        self.push("hashed key unreachable by probing");
                    }
                }
                Ok(())
            }
        }
    }

    fn visit_interior(
        &mut self,
        ctx: NodeCtx<'_>,
        node: &mut NodeView<'_>,
        depth: u32,
        bounds: Bounds,
    ) -> Result<()> {
        self.report.interior_nodes += 1;
        let keys = node.sorted_keys()?;
        if keys.is_empty() {
            self.push("interior node without separators");
        }
        if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            self.push("separators out of order");
        }
        if keys.iter().any(|&key| !bounds.admits(key)) {
            self.push("separator outside its parent bounds");
        }
        let children = node.child_addresses()?;
        node.dispose();
        for (i, child) in children.into_iter().enumerate() {
            let child_bounds = Bounds {
                lower: if i == 0 { bounds.lower } else { keys.get(i - 1).copied() },
                upper: keys.get(i).copied().or(bounds.upper),
            };
            self.visit(ctx, child, depth + 1, child_bounds)?;
        }
        Ok(())
    }

    fn check_leaf_depth(&mut self, depth: u32) {
        if depth != self.header.height {
            self.push("leaf depth differs from the recorded height");
        }
        self.report.leaf_depth = depth;
    }
}

/// Walks the whole tree and checks it against `header`.
///
/// Every problem found is logged; the first one is returned as a
/// corruption error.
pub(crate) fn check_consistency(ctx: NodeCtx<'_>, header: &TreeHeader) -> Result<ConsistencyReport> {
    let mut walk = Walk {
        header,
        report: ConsistencyReport::default(),
        findings: Vec::new(),
    };
    if let Some(root) = header.root {
        let unbounded = Bounds {
            lower: None,
            upper: None,
        };
        walk.visit(ctx, root, 1, unbounded)?;
    } else if header.height != 0 {
        walk.push("height recorded without a root");
    }
    if walk.report.records != u64::from(header.count) {
        walk.push("record count disagrees with the header");
    }
    if walk.report.nodes > u64::from(header.pages_count) {
        walk.push("more reachable nodes than allocated pages");
    }
    if walk.report.hashed_leaves != u64::from(header.hashed_pages_count) {
        walk.push("hashed leaf count disagrees with the header");
    }
    match walk.findings.first() {
        None => Ok(walk.report),
        Some(&first) => {
            for reason in &walk.findings {
                error!(
                    target: "sombra_intmap::search",
                    file = %ctx.file().display(),
                    reason,
                    "consistency check failed"
                );
            }
            Err(corrupted(ctx.file(), first))
        }
    }
}
