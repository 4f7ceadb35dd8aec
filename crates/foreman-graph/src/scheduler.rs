use crate::graph::DepGraph;
use foreman_core::{Lane, WpId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Work packages runnable right now: every dependency is `done` and the
/// package itself is still `planned`.
///
/// Stateless by design — the lanes argument is current reducer output, and
/// each call recomputes from scratch. Packages missing from the map are
/// treated as `planned`, matching the reducer's default.
pub fn ready_set(graph: &DepGraph, lanes: &BTreeMap<WpId, Lane>) -> BTreeSet<WpId> {
    let lane_of = |id: &WpId| lanes.get(id).copied().unwrap_or(Lane::Planned);

    let ready: BTreeSet<WpId> = graph
        .packages()
        .filter(|id| lane_of(id) == Lane::Planned)
        .filter(|id| {
            graph
                .dependencies_of(id)
                .iter()
                .all(|dep| lane_of(dep) == Lane::Done)
        })
        .cloned()
        .collect();

    debug!(ready = ready.len(), total = graph.len(), "ready set computed");
    ready
}

/// Partitions the DAG into maximal concurrently-runnable sets by repeated
/// removal of the ready set, assuming every package starts `planned`.
///
/// Construction already rejected cycles, so the partition always covers the
/// whole graph.
pub fn waves(graph: &DepGraph) -> Vec<BTreeSet<WpId>> {
    let mut lanes: BTreeMap<WpId, Lane> = graph
        .packages()
        .map(|id| (id.clone(), Lane::Planned))
        .collect();

    let mut result = Vec::new();
    loop {
        let wave = ready_set(graph, &lanes);
        if wave.is_empty() {
            break;
        }
        for id in &wave {
            lanes.insert(id.clone(), Lane::Done);
        }
        result.push(wave);
    }
    result
}
