use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::registry::ChangeSetId;

use super::{Cluster, ClusterError, ClusterId};

/// `earlier` must resolve before `later`
fn precedes(earlier: &Cluster, later: &Cluster, owner: &HashMap<ChangeSetId, usize>, earlier_index: usize) -> bool {
    let stacked = later
        .members
        .iter()
        .flat_map(|m| m.prerequisites.iter())
        .any(|p| owner.get(p) == Some(&earlier_index));
    let base_subset = !earlier.shared_files.is_empty() && earlier.shared_files.is_subset(&later.required_base);
    stacked || base_subset
}

/// Fill in `depends_on` and layer clusters into waves. A cycle is an error.
pub fn order_waves(clusters: &mut [Cluster]) -> Result<Vec<Vec<ClusterId>>, ClusterError> {
    let owner: HashMap<ChangeSetId, usize> = clusters
        .iter()
        .enumerate()
        .flat_map(|(index, cluster)| cluster.members.iter().map(move |m| (m.id.clone(), index)))
        .collect();

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..clusters.len()).map(|i| graph.add_node(i)).collect();
    let mut edges = Vec::new();
    for (a, earlier) in clusters.iter().enumerate() {
        for (b, later) in clusters.iter().enumerate() {
            if a != b && precedes(earlier, later, &owner, a) {
                edges.push((a, b));
            }
        }
    }
    for &(a, b) in &edges {
        graph.add_edge(nodes[a], nodes[b], ());
    }

    let order = match toposort(&graph, None) {
        Ok(order) => order,
        Err(_) => {
            let mut cyclic: Vec<ClusterId> = tarjan_scc(&graph)
                .into_iter()
                .filter(|component| component.len() > 1)
                .flatten()
                .map(|ix| clusters[graph[ix]].id.clone())
                .collect();
            cyclic.sort();
            warn!(clusters = ?cyclic, "Cluster dependency cycle");
            return Err(ClusterError::DependencyCycle { clusters: cyclic });
        }
    };

    for &(a, b) in &edges {
        let id = clusters[a].id.clone();
        clusters[b].depends_on.insert(id);
    }

    let mut level = vec![0usize; clusters.len()];
    for ix in order {
        let index = graph[ix];
        level[index] = graph
            .neighbors_directed(ix, Direction::Incoming)
            .map(|pred| level[graph[pred]] + 1)
            .max()
            .unwrap_or(0);
    }

    let mut waves: BTreeMap<usize, Vec<ClusterId>> = BTreeMap::new();
    for (index, cluster) in clusters.iter().enumerate() {
        waves.entry(level[index]).or_default().push(cluster.id.clone());
    }
    Ok(waves
        .into_values()
        .map(|mut ids| {
            ids.sort();
            ids
        })
        .collect())
}
