//! The SRAM slicing pass driver.

use std::collections::BTreeSet;
use std::fmt;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::bundle::{assign_shared_operands, Bundle, BundleExpander, StitchRole};
use crate::config::SlicerConfig;
use crate::emit::deps::DepTracker;
use crate::emit::{
    emit_bundle, order_units, BundleOps, BundleSummary, EmitContext, EmittedOp, Location,
    OpKind, SlicedProgram, SramAllocation, Unit,
};
use crate::error::Result;
use crate::graph::topology::topological_order;
use crate::graph::{Graph, NodeId};
use crate::hal::HardwareCaps;
use crate::slicing::{scan_candidates, SlicingSolver};

/// Counters reported by a [`SramSlicingPass`] run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassStats {
    /// MME operators whose unsliced working set exceeds the budget.
    pub candidates: usize,
    /// Bundles present in the emitted program.
    pub sliced_bundles: usize,
    /// Candidates without any fitting partition.
    pub unsliceable: usize,
    /// Bundles that fell back to direct execution after planning.
    pub demoted_bundles: usize,
    /// Stitched neighbors dropped to make a bundle emit.
    pub dropped_neighbors: usize,
    pub stitched_producers: usize,
    pub stitched_consumers: usize,
    pub mme_slices: usize,
    pub fills: usize,
    pub spills: usize,
    pub fused_fills: usize,
    pub fused_spills: usize,
}

impl fmt::Display for PassStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidates {}, sliced {}, unsliceable {}, demoted {}, stitched {}+{}, \
             mme slices {}, fills {} (+{} fused), spills {} (+{} fused)",
            self.candidates,
            self.sliced_bundles,
            self.unsliceable,
            self.demoted_bundles,
            self.stitched_producers,
            self.stitched_consumers,
            self.mme_slices,
            self.fills,
            self.fused_fills,
            self.spills,
            self.fused_spills
        )
    }
}

/// Rewrites MME operators that overflow SRAM into sliced, SRAM-addressed op sequences.
pub struct SramSlicingPass<'a> {
    caps: &'a dyn HardwareCaps,
    config: SlicerConfig,
}

impl<'a> SramSlicingPass<'a> {
    pub const NAME: &'static str = "sram-slicing";

    pub fn new(caps: &'a dyn HardwareCaps, config: SlicerConfig) -> Self {
        Self { caps, config }
    }

    pub fn name(&self) -> &'static str {
        Self::NAME
    }

    pub fn config(&self) -> &SlicerConfig {
        &self.config
    }

    pub fn run(&self, graph: &Graph) -> Result<SlicedProgram> {
        let topo = topological_order(graph)?;
        let mut topo_position = vec![0; graph.nodes().len()];
        for (position, node) in topo.iter().enumerate() {
            topo_position[node.index()] = position;
        }

        let budget = self.config.sram_budget(self.caps);
        let solver = SlicingSolver::new(self.caps, &self.config, budget);
        let align = solver.alignment();
        let mut stats = PassStats::default();

        let scan = scan_candidates(graph, &topo, &solver, &self.config);
        stats.candidates = scan.candidates;
        stats.unsliceable = scan.unsliceable.len();

        let owners = assign_shared_operands(graph, &scan.sliced);
        let expander = BundleExpander::new(graph, &self.config, self.caps, budget, align);
        let mut claimed: BTreeSet<NodeId> = scan.sliced.iter().map(|s| s.geometry.node).collect();
        let mut planned = Vec::with_capacity(scan.sliced.len());
        for (id, strategy) in scan.sliced.into_iter().enumerate() {
            let mut bundle = Bundle::new(id as u32, strategy);
            expander.expand(&mut bundle, &claimed, &owners);
            claimed.extend(bundle.nodes());
            planned.push(bundle);
        }

        let ctx = EmitContext {
            graph,
            config: &self.config,
            caps: self.caps,
            budget,
            align,
            topo_position: &topo_position,
        };
        let mut bundles: Vec<Bundle> = Vec::new();
        let mut emitted: Vec<BundleOps> = Vec::new();
        for mut bundle in planned {
            loop {
                match emit_bundle(&ctx, &bundle) {
                    Ok(ops) => {
                        bundles.push(bundle);
                        emitted.push(ops);
                        break;
                    }
                    Err(reason) => match bundle.pop() {
                        Some(dropped) => {
                            warn!(
                                "bundle {}: dropping `{}`: {reason}",
                                bundle.id,
                                graph.node(dropped.node).name
                            );
                            stats.dropped_neighbors += 1;
                        }
                        None => {
                            warn!(
                                "bundle {} (`{}`) runs unsliced: {reason}",
                                bundle.id,
                                graph.node(bundle.anchor).name
                            );
                            stats.demoted_bundles += 1;
                            break;
                        }
                    },
                }
            }
        }

        let units = loop {
            match order_units(graph, &topo, &bundles) {
                Ok(units) => break units,
                Err(index) => {
                    let bundle = bundles.remove(index);
                    emitted.remove(index);
                    warn!(
                        "bundle {} (`{}`) closes a cycle between bundles and runs unsliced",
                        bundle.id,
                        graph.node(bundle.anchor).name
                    );
                    stats.demoted_bundles += 1;
                }
            }
        };

        let program = self.assemble(graph, units, &bundles, emitted, budget, stats)?;
        info!("{}: {}", Self::NAME, program.stats);
        Ok(program)
    }

    fn assemble(
        &self,
        graph: &Graph,
        units: Vec<Unit>,
        bundles: &[Bundle],
        mut emitted: Vec<BundleOps>,
        budget: u64,
        mut stats: PassStats,
    ) -> Result<SlicedProgram> {
        let base = self.caps.sram_base_address();
        let mut tracker = DepTracker::new();
        let mut ops: Vec<EmittedOp> = Vec::new();
        let mut summaries: Vec<BundleSummary> = Vec::new();
        let mut push = |ops: &mut Vec<EmittedOp>, name: String, bundle: Option<u32>, kind: OpKind| {
            let index = ops.len();
            let deps = tracker.record(index, &kind, graph);
            ops.push(EmittedOp {
                index,
                name,
                bundle,
                kind,
                deps,
            });
        };

        for unit in units {
            match unit {
                Unit::Node(node) => {
                    let name = graph.node(node).name.clone();
                    push(&mut ops, name, None, OpKind::Node { node });
                }
                Unit::Bundle(index) => {
                    let bundle = &bundles[index];
                    let body = std::mem::take(&mut emitted[index].ops);
                    let first = ops.len();
                    for (name, kind) in body {
                        push(&mut ops, name, Some(bundle.id), kind);
                    }
                    let result = &emitted[index];
                    debug!(
                        "bundle {} (`{}`): ops {first}..{}, peak {} bytes",
                        bundle.id,
                        graph.node(bundle.anchor).name,
                        ops.len(),
                        result.peak
                    );
                    summaries.push(BundleSummary {
                        id: bundle.id,
                        anchor: bundle.anchor,
                        anchor_name: graph.node(bundle.anchor).name.clone(),
                        stitched: bundle.stitched.clone(),
                        axes: bundle.strategy.summary(),
                        reduction: bundle.strategy.active_reduction(),
                        strategy: bundle.strategy.clone(),
                        movement: result
                            .movement
                            .tensors
                            .iter()
                            .map(|(tensor, movement)| (*tensor, *movement))
                            .collect(),
                        allocations: result
                            .placements
                            .iter()
                            .map(|placement| SramAllocation {
                                tensor: placement.key.tensor,
                                copy: placement.key.copy,
                                address: base + placement.offset,
                                bytes: placement.bytes,
                                first_op: first + placement.live.start,
                                last_op: first + placement.live.end,
                            })
                            .collect(),
                        peak_bytes: result.peak,
                        ops: (first, ops.len()),
                    });
                }
            }
        }
        summaries.sort_by_key(|summary| summary.id);

        stats.sliced_bundles = bundles.len();
        for bundle in bundles {
            stats.stitched_producers += bundle
                .stitched
                .iter()
                .filter(|s| s.role.is_producer())
                .count();
            stats.stitched_consumers += bundle.count(StitchRole::Consumer);
        }
        for summary in &summaries {
            for (_, movement) in &summary.movement {
                stats.fused_fills += usize::from(movement.fused_fill);
                stats.fused_spills += usize::from(movement.fused_spill);
            }
        }
        for op in &ops {
            match &op.kind {
                OpKind::MmeSlice { .. } => stats.mme_slices += 1,
                OpKind::Fill { .. } => stats.fills += 1,
                OpKind::Spill { target, .. } if target.location == Location::Hbm => stats.spills += 1,
                _ => {}
            }
        }

        let mut program = SlicedProgram {
            device: self.caps.name().to_string(),
            sram_budget: budget,
            ops,
            bundles: summaries,
            stats,
            fingerprint: 0,
        };
        program.seal()?;
        Ok(program)
    }
}
