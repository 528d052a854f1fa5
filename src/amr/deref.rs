use std::collections::{BTreeSet, HashSet};

use crate::error::{Error, Result};
use crate::geometry::{in_box, Point, Tet};

use super::{edge_error, Criterion, Edge, Family};

/// The outcome of [`apply_derefinement`]. `node_map[old]` is the new local
/// index of an old node, or `None` for removed midpoint nodes; `restored`
/// lists the indexes (into the family list) of the families undone.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Derefinement {
    pub inpoel: Vec<Tet>,
    pub coord: Vec<Point>,
    pub node_map: Vec<Option<usize>>,
    pub removed_nodes: Vec<usize>,
    pub restored: Vec<usize>,
}

fn sorted(mut tet: Tet) -> Tet {
    tet.sort_unstable();
    tet
}

/// A family is a leaf when all of its children are still elements of the
/// mesh, i.e. none of them has been refined further.
fn leaves(inpoel: &[Tet], families: &[Family]) -> Vec<bool> {
    let present: HashSet<Tet> = inpoel.iter().map(|t| sorted(*t)).collect();
    families
        .iter()
        .map(|f| f.children.iter().all(|c| present.contains(&sorted(*c))))
        .collect()
}

/// Select split edges (edges with a midpoint node recorded in some family)
/// that the criterion would like to un-split. For the error indicator the
/// selection is the edges whose jump is below the threshold.
///
pub fn derefinement_candidates(
    families: &[Family],
    coord: &[Point],
    criterion: &Criterion,
) -> Result<BTreeSet<Edge>> {
    let split: BTreeSet<Edge> = families.iter().flat_map(|f| f.splits.iter().map(|(e, _)| *e)).collect();

    match criterion {
        Criterion::Uniform => Ok(split),
        Criterion::ErrorIndicator { field, threshold } => {
            if field.len() != coord.len() {
                return Err(Error::InvalidMesh(format!(
                    "error indicator has {} values for {} nodes",
                    field.len(),
                    coord.len()
                )));
            }
            Ok(split.into_iter().filter(|e| edge_error(field, e) < *threshold).collect())
        }
        Criterion::EdgeList(list) => Ok(list.iter().filter(|e| split.contains(e)).copied().collect()),
        Criterion::Region { lower, upper } => Ok(split
            .into_iter()
            .filter(|e| {
                let (a, b) = e.nodes();
                in_box(coord[a], *lower, *upper) && in_box(coord[b], *lower, *upper)
            })
            .collect()),
    }
}

/// Reduce a candidate set to the edges that can actually be un-split: an
/// edge survives only if every family that split it is a leaf and has all
/// of its split edges in the set. Dropping an edge can disqualify other
/// families, so this iterates to a fixed point.
///
pub fn deref_closure(inpoel: &[Tet], families: &[Family], candidates: &BTreeSet<Edge>) -> BTreeSet<Edge> {
    let leaf = leaves(inpoel, families);
    let mut keep = candidates.clone();

    loop {
        let restorable: Vec<bool> = families
            .iter()
            .zip(&leaf)
            .map(|(f, &is_leaf)| is_leaf && f.splits.iter().all(|(e, _)| keep.contains(e)))
            .collect();

        let next: BTreeSet<Edge> = keep
            .iter()
            .filter(|e| {
                let mut users = families
                    .iter()
                    .zip(&restorable)
                    .filter(|(f, _)| f.splits.iter().any(|(s, _)| s == *e))
                    .peekable();
                users.peek().is_some() && users.all(|(_, &ok)| ok)
            })
            .copied()
            .collect();

        if next == keep {
            return keep;
        }
        keep = next;
    }
}

/// Undo every leaf family whose split edges are all in `unsplit`: its
/// children are replaced by the parent element and the midpoint nodes are
/// removed. The remaining nodes are renumbered compactly in their previous
/// order. Every edge in `unsplit` must belong to a restored family.
///
pub fn apply_derefinement(
    inpoel: &[Tet],
    coord: &[Point],
    families: &[Family],
    unsplit: &BTreeSet<Edge>,
) -> Result<Derefinement> {
    let leaf = leaves(inpoel, families);

    let restored: Vec<usize> = families
        .iter()
        .enumerate()
        .filter(|(i, f)| leaf[*i] && !f.splits.is_empty() && f.splits.iter().all(|(e, _)| unsplit.contains(e)))
        .map(|(i, _)| i)
        .collect();

    let covered: BTreeSet<Edge> = restored
        .iter()
        .flat_map(|&i| families[i].splits.iter().map(|(e, _)| *e))
        .collect();

    if let Some(e) = unsplit.iter().find(|e| !covered.contains(e)) {
        return Err(Error::InvalidMesh(format!("edge {:?} cannot be un-split", e.nodes())));
    }

    let removed_children: HashSet<Tet> = restored
        .iter()
        .flat_map(|&i| families[i].children.iter().map(|c| sorted(*c)))
        .collect();

    let mut elements: Vec<Tet> = inpoel
        .iter()
        .filter(|t| !removed_children.contains(&sorted(**t)))
        .copied()
        .collect();
    elements.extend(restored.iter().map(|&i| families[i].parent));

    let removed_nodes: BTreeSet<usize> = restored
        .iter()
        .flat_map(|&i| families[i].splits.iter().map(|(_, m)| *m))
        .collect();

    if let Some(tet) = elements.iter().find(|t| t.iter().any(|n| removed_nodes.contains(n))) {
        return Err(Error::InvalidMesh(format!(
            "element {:?} still references a removed midpoint node",
            tet
        )));
    }

    let mut node_map = vec![None; coord.len()];
    let mut new_coord = Vec::with_capacity(coord.len());

    for (old, x) in coord.iter().enumerate() {
        if !removed_nodes.contains(&old) {
            node_map[old] = Some(new_coord.len());
            new_coord.push(*x);
        }
    }

    let renumber = |n: usize| {
        node_map
            .get(n)
            .copied()
            .flatten()
            .ok_or_else(|| Error::InvalidMesh(format!("element references unknown node {}", n)))
    };
    let inpoel = elements
        .iter()
        .map(|t| Ok([renumber(t[0])?, renumber(t[1])?, renumber(t[2])?, renumber(t[3])?]))
        .collect::<Result<Vec<Tet>>>()?;

    Ok(Derefinement {
        inpoel,
        coord: new_coord,
        node_map,
        removed_nodes: removed_nodes.into_iter().collect(),
        restored,
    })
}
