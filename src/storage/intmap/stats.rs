use crate::primitives::pager::PagerStats;

/// Snapshot of index usage counters at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq)]
pub struct IntMapStatistics {
    /// Node pages appended to the file
    pub pages: u32,
    /// Records stored in tree nodes, key 0 excluded
    pub count: u32,
    /// Levels from root to leaves
    pub height: u32,
    /// Records shifted by sorted insertions
    pub moved_members: u32,
    /// Estimated number of leaf pages
    pub leaf_pages: u32,
    /// Leaves organised as hash tables
    pub hashed_pages: u32,
    /// Longest hashed-leaf probe sequence
    pub max_steps_searched_in_hash: u32,
    /// Hashed-leaf probes performed
    pub hash_search_requests: u32,
    /// Probe steps beyond the home slot, summed
    pub total_hash_steps_searched: u32,
    /// Inserts that reused a vacant slot from a previous lookup
    pub optimized_inserts: u64,
    /// Size of one node page in bytes
    pub node_size: u32,
    /// Logical length of the index file
    pub file_size: u64,
    /// Page-cache counters
    pub pager: PagerStats,
}

impl IntMapStatistics {
    /// Mean number of extra probe steps per hashed-leaf search.
    pub fn average_probe_steps(&self) -> f64 {
        if self.hash_search_requests == 0 {
            return 0.0;
        }
        f64::from(self.total_hash_steps_searched) / f64::from(self.hash_search_requests)
    }

    /// Emits the snapshot to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        tracing::info!(
            target: "sombra_intmap::stats",
            pages = self.pages,
            count = self.count,
            height = self.height,
            moved_members = self.moved_members,
            leaf_pages = self.leaf_pages,
            hashed_pages = self.hashed_pages,
            max_steps_searched_in_hash = self.max_steps_searched_in_hash,
            hash_search_requests = self.hash_search_requests,
            total_hash_steps_searched = self.total_hash_steps_searched,
            optimized_inserts = self.optimized_inserts,
            node_size = self.node_size,
            file_size = self.file_size,
            cache_hits = self.pager.hits,
            cache_misses = self.pager.misses,
            cache_evictions = self.pager.evictions,
            "intmap stats snapshot"
        );
    }
}

/// Leaf-page estimate from the page count.
///
/// Exact up to height 2 and at height 3. Taller trees reuse the height-3
/// formula: only the root's direct children are subtracted, so interior
/// levels below them are counted as leaves and the result overestimates.
pub(crate) fn estimate_leaf_pages(height: u32, pages: u32, root_children: u32) -> u32 {
    match height {
        0 => 0,
        1 => 1,
        2 => pages.saturating_sub(1),
        _ => pages.saturating_sub(1 + root_children + 1),
    }
}
