// src/resources.rs
//
// =============================================================================
// TDLC: RESOURCE PACKING & NODE LAYOUT (v 0.1 )
// =============================================================================
//
// Turns a `spawn` (ordered MPI rank blocks) into a scheduler resource request.
//
// Responsibilities:
// 1. Resolve rank blocks from spawn values and merge adjacent identical ones.
// 2. Decide per-node capacity from the node shape (cores, hardware threads).
// 3. Pack ranks onto nodes as evenly as possible.
// 4. Render the Rocoto `<nodes>` request.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Location, Result, TdlError};
use crate::model::{Arena, Spawn};

// ============================================================================
// 1. DATA STRUCTURES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerFamily {
    Slurm,
    Lsf,
    PbsPro,
    MoabTorque,
}

impl SchedulerFamily {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "slurm" => Some(Self::Slurm),
            "lsf" | "lsfcray" => Some(Self::Lsf),
            "pbspro" | "pbs" => Some(Self::PbsPro),
            "moabtorque" | "moab" | "torque" => Some(Self::MoabTorque),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Slurm => "slurm",
            Self::Lsf => "lsf",
            Self::PbsPro => "pbspro",
            Self::MoabTorque => "moabtorque",
        }
    }

    /// Scheduler flags for an MPI job that `<nodes>` alone does not carry:
    /// threads per rank, or exclusive node placement.
    pub fn native_hint(self, layout: Option<&Layout>) -> Option<String> {
        let threads = layout?.max_threads();
        Some(match self {
            Self::Slurm => format!("--cpus-per-task={threads}"),
            Self::Lsf => format!("-R 'affinity[core({threads})]'"),
            Self::PbsPro => "-l place=excl".to_string(),
            Self::MoabTorque => "-l naccesspolicy=singlejob".to_string(),
        })
    }
}

impl fmt::Display for SchedulerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one compute node offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeShape {
    pub cores_per_node: u32,
    /// Hardware threads per core.
    pub cpus_per_core: u32,
}

impl Default for NodeShape {
    fn default() -> Self {
        Self {
            cores_per_node: 1,
            cpus_per_core: 1,
        }
    }
}

/// One block of identically launched ranks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankBlock {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub ranks: u32,
    pub ppn: Option<u32>,
    pub threads: u32,
    pub hyperthreads: Option<u32>,
}

impl RankBlock {
    fn same_launch(&self, other: &RankBlock) -> bool {
        self.command == other.command
            && self.ppn == other.ppn
            && self.threads == other.threads
            && self.hyperthreads == other.hyperthreads
    }
}

/// `nodes` nodes, each running `ranks_per_node` ranks of `threads` threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeGroup {
    pub nodes: u32,
    pub ranks_per_node: u32,
    pub threads: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockLayout {
    pub block: RankBlock,
    pub groups: Vec<NodeGroup>,
    /// Set when the block had to oversubscribe its nodes.
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Layout {
    pub blocks: Vec<BlockLayout>,
}

impl Layout {
    pub fn total_ranks(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.block.ranks)).sum()
    }

    pub fn total_nodes(&self) -> u64 {
        self.groups().map(|g| u64::from(g.nodes)).sum()
    }

    /// Widest thread count of any block; at least 1.
    pub fn max_threads(&self) -> u32 {
        self.blocks.iter().map(|b| b.block.threads).max().unwrap_or(1)
    }

    fn groups(&self) -> impl Iterator<Item = &NodeGroup> {
        self.blocks.iter().flat_map(|b| b.groups.iter())
    }

    /// Rocoto node request: `n:ppn=p:tpp=t+...`.
    pub fn rocoto_nodes(&self) -> String {
        self.groups()
            .map(|g| format!("{}:ppn={}:tpp={}", g.nodes, g.ranks_per_node, g.threads))
            .collect::<Vec<_>>()
            .join("+")
    }
}

// ============================================================================
// 2. PACKING
// ============================================================================

/// Merges neighbouring blocks that launch identically. Order is preserved.
pub fn merge_adjacent(blocks: Vec<RankBlock>) -> Result<Vec<RankBlock>> {
    let mut merged: Vec<RankBlock> = Vec::with_capacity(blocks.len());
    for block in blocks {
        match merged.last_mut() {
            Some(prev) if prev.same_launch(&block) => {
                prev.ranks = prev.ranks.checked_add(block.ranks).ok_or_else(|| {
                    TdlError::ResourceLayout {
                        message: format!(
                            "`{}` requests more than {} ranks in total",
                            block.command.join(" "),
                            u32::MAX
                        ),
                        loc: None,
                    }
                })?;
            }
            _ => merged.push(block),
        }
    }
    Ok(merged)
}

/// Spreads `ranks` over nodes holding at most `per_node` each.
///
/// Returns `(node count, ranks per node)` groups that sum to exactly `ranks`
/// and whose per-node counts differ by at most one.
pub fn pack(ranks: u32, per_node: u32) -> Result<Vec<(u32, u32)>> {
    if ranks == 0 || per_node == 0 {
        return Err(TdlError::ResourceLayout {
            message: format!("cannot pack {ranks} ranks at {per_node} per node"),
            loc: None,
        });
    }
    if ranks % per_node == 0 {
        return Ok(vec![(ranks / per_node, per_node)]);
    }
    let nodes = ranks.div_ceil(per_node);
    let base = ranks / nodes;
    let extra = ranks % nodes;
    Ok([(extra, base + 1), (nodes - extra, base)]
        .into_iter()
        .filter(|&(n, _)| n > 0)
        .collect())
}

/// Lays out one (merged) block on nodes of the given shape.
fn layout_block(block: RankBlock, shape: NodeShape, loc: Option<&Location>) -> Result<BlockLayout> {
    let fail = |message: String| TdlError::ResourceLayout {
        message,
        loc: loc.cloned(),
    };
    if block.ranks == 0 {
        return Err(fail(format!("`{}` requests zero ranks", block.command.join(" "))));
    }
    if block.threads == 0 {
        return Err(fail(format!("`{}` requests zero threads", block.command.join(" "))));
    }

    let cpus_per_core = block.hyperthreads.unwrap_or(shape.cpus_per_core).max(1);
    let escalated = shape.cores_per_node.checked_mul(cpus_per_core).ok_or_else(|| {
        fail(format!(
            "{} cores x {cpus_per_core} cpus per core is too many cpus per node",
            shape.cores_per_node
        ))
    })?;
    let mut note = None;

    let per_node = match block.ppn {
        Some(0) => return Err(fail("ranks per node must be at least 1".into())),
        Some(ppn) => {
            let need = ppn.checked_mul(block.threads).ok_or_else(|| {
                fail(format!(
                    "{ppn} ranks x {} threads per node is too many cpus",
                    block.threads
                ))
            })?;
            if need > escalated {
                let msg = format!(
                    "{ppn} ranks x {} threads needs {need} cpus per node \
                     but nodes have {escalated}; oversubscribing",
                    block.threads
                );
                log::warn!("{msg}");
                note = Some(msg);
            }
            ppn
        }
        None => {
            let mut per_node = shape.cores_per_node / block.threads;
            if per_node == 0 {
                per_node = escalated / block.threads;
            }
            if per_node == 0 {
                return Err(fail(format!(
                    "{} threads per rank do not fit on a node with {escalated} cpus",
                    block.threads
                )));
            }
            per_node
        }
    };

    let groups = pack(block.ranks, per_node)
        .map_err(|e| match loc {
            Some(l) => e.or_at(l),
            None => e,
        })?
        .into_iter()
        .map(|(nodes, ranks_per_node)| NodeGroup {
            nodes,
            ranks_per_node,
            threads: block.threads,
        })
        .collect();
    Ok(BlockLayout {
        block,
        groups,
        note,
    })
}

/// Merges adjacent blocks and lays each one out.
pub fn layout(blocks: Vec<RankBlock>, shape: NodeShape, loc: Option<&Location>) -> Result<Layout> {
    let blocks = merge_adjacent(blocks)
        .map_err(|e| match loc {
            Some(l) => e.or_at(l),
            None => e,
        })?
        .into_iter()
        .map(|b| layout_block(b, shape, loc))
        .collect::<Result<Vec<_>>>()?;
    let layout = Layout { blocks };
    log::debug!(
        "layout: {} ranks on {} nodes ({})",
        layout.total_ranks(),
        layout.total_nodes(),
        layout.rocoto_nodes()
    );
    Ok(layout)
}

// ============================================================================
// 3. FROM SPAWN VALUES
// ============================================================================

/// Evaluates the rank entries of a spawn. Ranks default to 1, threads to 1.
pub fn rank_blocks(arena: &Arena, spawn: &Spawn) -> Result<Vec<RankBlock>> {
    spawn
        .ranks
        .iter()
        .map(|rank| {
            let count = |v: &Option<crate::model::Value>, what: &str| -> Result<Option<u32>> {
                v.as_ref()
                    .map(|v| arena.whole_number(v, what).map_err(|e| e.or_at(&rank.loc)))
                    .transpose()
            };
            let mut command = vec![arena.text(&rank.program).map_err(|e| e.or_at(&rank.loc))?];
            for arg in &rank.args {
                command.push(arena.text(arg).map_err(|e| e.or_at(&rank.loc))?);
            }
            Ok(RankBlock {
                command,
                ranks: count(&rank.ranks, "ranks")?.unwrap_or(1),
                ppn: count(&rank.ppn, "ppn")?,
                threads: count(&rank.threads, "threads")?.unwrap_or(1),
                hyperthreads: count(&rank.hyperthreads, "hyperthreads")?,
            })
        })
        .collect()
}
