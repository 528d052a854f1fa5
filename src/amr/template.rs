use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{Error, Result};
use crate::geometry::{midpoint, orient, Point, Tet};

use super::{edges, Edge, Family};

/// Local vertex pairs of the six edges of a tetrahedron. Bit `k` of an
/// element's refinement pattern refers to `TET_EDGES[k]`.
///
pub const TET_EDGES: [(usize, usize); 6] = [(0, 1), (1, 2), (2, 0), (0, 3), (1, 3), (2, 3)];

/// Pattern bits of the three edges of each face, indexed by the vertex
/// opposite the face.
const FACE_MASKS: [u8; 4] = [
    0b110010, // (1,2) (1,3) (2,3)
    0b101100, // (2,0) (0,3) (2,3)
    0b011001, // (0,1) (0,3) (1,3)
    0b000111, // (0,1) (1,2) (2,0)
];




/// The subdivision applied to one element.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Template {
    /// Not refined.
    Keep,
    /// 1:2 split of the edge `TET_EDGES[k]`.
    Bisect(usize),
    /// 1:4 split of the face opposite local vertex `v`.
    Quadrisect(usize),
    /// Regular 1:8 subdivision.
    Octasect,
}

/// Return the refinement pattern of an element: bit `k` is set when edge
/// `TET_EDGES[k]` is marked.
///
pub fn pattern(tet: &Tet, marked: &BTreeSet<Edge>) -> u8 {
    TET_EDGES
        .iter()
        .enumerate()
        .filter(|&(_, &(i, j))| marked.contains(&Edge::new(tet[i], tet[j])))
        .fold(0u8, |bits, (k, _)| bits | (1u8 << k))
}

/// Return the template for a pattern, or `None` if the pattern is not one of
/// the valid ones and has to be promoted.
///
pub fn classify(bits: u8) -> Option<Template> {
    match bits.count_ones() {
        0 => Some(Template::Keep),
        1 => Some(Template::Bisect(bits.trailing_zeros() as usize)),
        3 => FACE_MASKS.iter().position(|&m| m == bits).map(Template::Quadrisect),
        6 => Some(Template::Octasect),
        _ => None,
    }
}

/// Close a set of marked edges under the refinement templates: every element
/// whose pattern is not a valid template gets all six edges marked. This
/// repeats until no element changes, since promoting one element can break
/// the pattern of its neighbors. Returns the edges that were added.
///
pub fn conform(inpoel: &[Tet], marked: &mut BTreeSet<Edge>) -> BTreeSet<Edge> {
    let mut added = BTreeSet::new();

    loop {
        let promoted: Vec<Edge> = inpoel
            .iter()
            .filter(|tet| classify(pattern(tet, marked)).is_none())
            .flat_map(|tet| TET_EDGES.iter().map(move |&(i, j)| Edge::new(tet[i], tet[j])))
            .filter(|e| !marked.contains(e))
            .collect();

        if promoted.is_empty() {
            return added;
        }
        for e in promoted {
            marked.insert(e);
            added.insert(e);
        }
    }
}

fn edge_index(p: usize, q: usize) -> usize {
    TET_EDGES
        .iter()
        .position(|&(i, j)| (i, j) == (p, q) || (j, i) == (p, q))
        .unwrap_or_else(|| unreachable!("local vertexes {} and {} do not form an edge", p, q))
}

/// Children of one element, before orientation. `mid[k]` is the node at the
/// midpoint of `TET_EDGES[k]`; entries for unmarked edges are not read.
fn subdivide(tet: &Tet, template: Template, mid: &[usize; 6]) -> Vec<Tet> {
    match template {
        Template::Keep => vec![*tet],
        Template::Bisect(k) => {
            let (i, j) = TET_EDGES[k];
            let mut a = *tet;
            let mut b = *tet;
            a[j] = mid[k];
            b[i] = mid[k];
            vec![a, b]
        }
        Template::Quadrisect(o) => {
            let face: Vec<usize> = (0..4).filter(|&v| v != o).collect();
            let m = |p: usize, q: usize| mid[edge_index(p, q)];
            let mut children: Vec<Tet> = face
                .iter()
                .map(|&corner| {
                    let mut child = *tet;
                    for &other in face.iter().filter(|&&v| v != corner) {
                        child[other] = m(corner, other);
                    }
                    child
                })
                .collect();
            children.push([
                tet[o],
                m(face[0], face[1]),
                m(face[1], face[2]),
                m(face[2], face[0]),
            ]);
            children
        }
        Template::Octasect => {
            let [v0, v1, v2, v3] = *tet;
            let [m01, m12, m20, m03, m13, m23] = *mid;
            vec![
                [v0, m01, m20, m03],
                [v1, m12, m01, m13],
                [v2, m20, m12, m23],
                [v3, m03, m13, m23],
                [m01, m12, m13, m23],
                [m01, m13, m03, m23],
                [m01, m03, m20, m23],
                [m01, m20, m12, m23],
            ]
        }
    }
}




/// The outcome of [`apply_refinement`]. Element indexes in
/// `removed_elements` refer to the input connectivity, those in
/// `added_elements` to the output.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Refinement {
    pub inpoel: Vec<Tet>,
    pub coord: Vec<Point>,
    pub added_nodes: BTreeMap<usize, Edge>,
    pub removed_elements: Vec<usize>,
    pub added_elements: Vec<usize>,
    pub families: Vec<Family>,
}

/// Refine a mesh along a conforming set of marked edges. One node is
/// inserted at the midpoint of every marked edge, appended after the
/// existing nodes in ascending edge order. Unrefined elements keep their
/// positions; the children of refined elements follow them, each oriented to
/// positive volume.
///
pub fn apply_refinement(inpoel: &[Tet], coord: &[Point], marked: &BTreeSet<Edge>) -> Result<Refinement> {
    let present = edges(inpoel);

    if let Some(e) = marked.iter().find(|e| !present.contains(e)) {
        return Err(Error::InvalidMesh(format!("marked edge {:?} is not in the mesh", e.nodes())));
    }

    let mut coord = coord.to_vec();
    let mut added_nodes = BTreeMap::new();
    let mut mid_of = HashMap::new();

    for e in marked {
        let (a, b) = e.nodes();
        let node = coord.len();
        coord.push(midpoint(coord[a], coord[b]));
        added_nodes.insert(node, *e);
        mid_of.insert(*e, node);
    }

    let mut kept = Vec::with_capacity(inpoel.len());
    let mut refined = Vec::new();
    let mut removed_elements = Vec::new();
    let mut families = Vec::new();

    for (el, tet) in inpoel.iter().enumerate() {
        let bits = pattern(tet, marked);
        let template = classify(bits).ok_or_else(|| {
            Error::InvalidMesh(format!("element {} has non-conforming pattern {:06b}", el, bits))
        })?;

        if template == Template::Keep {
            kept.push(*tet);
            continue;
        }

        let mut mid = [usize::MAX; 6];
        let mut splits = Vec::new();

        for (k, &(i, j)) in TET_EDGES.iter().enumerate() {
            let e = Edge::new(tet[i], tet[j]);
            if let Some(&m) = mid_of.get(&e) {
                mid[k] = m;
                splits.push((e, m));
            }
        }
        let children: Vec<Tet> = subdivide(tet, template, &mid)
            .into_iter()
            .map(|child| orient(child, &coord))
            .collect();

        removed_elements.push(el);
        refined.extend(children.iter().copied());
        families.push(Family {
            parent: *tet,
            children,
            splits,
        });
    }

    let added_elements = (kept.len()..kept.len() + refined.len()).collect();
    kept.extend(refined);

    Ok(Refinement {
        inpoel: kept,
        coord,
        added_nodes,
        removed_elements,
        added_elements,
        families,
    })
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::geometry::tet_volume;

    fn unit_tet() -> (Vec<Tet>, Vec<Point>) {
        let coord = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ];
        (vec![[0, 1, 2, 3]], coord)
    }

    fn total_volume(inpoel: &[Tet], coord: &[Point]) -> f64 {
        inpoel.iter().map(|t| tet_volume(t, coord)).sum()
    }

    fn check_refinement(marked: BTreeSet<Edge>, nchildren: usize) {
        let (inpoel, coord) = unit_tet();
        let r = apply_refinement(&inpoel, &coord, &marked).unwrap();

        assert_eq!(r.inpoel.len(), nchildren);
        assert_eq!(r.coord.len(), 4 + marked.len());
        assert!(r.inpoel.iter().all(|t| tet_volume(t, &r.coord) > 0.0));
        assert!((total_volume(&r.inpoel, &r.coord) - 1.0 / 6.0).abs() < 1e-14);
        assert_eq!(r.families.len(), 1);
        assert_eq!(r.families[0].splits.len(), marked.len());
    }

    #[test]
    fn face_masks_match_the_edge_table() {
        for (o, mask) in FACE_MASKS.iter().enumerate() {
            for (k, &(i, j)) in TET_EDGES.iter().enumerate() {
                let on_face = i != o && j != o;
                assert_eq!(mask & (1u8 << k) != 0, on_face);
            }
        }
    }

    #[test]
    fn classify_recognizes_valid_templates() {
        assert_eq!(classify(0), Some(Template::Keep));
        assert_eq!(classify(0b000100), Some(Template::Bisect(2)));
        assert_eq!(classify(0b000111), Some(Template::Quadrisect(3)));
        assert_eq!(classify(0b111111), Some(Template::Octasect));
        assert_eq!(classify(0b000011), None);
        assert_eq!(classify(0b111000), None);
    }

    #[test]
    fn bisection_conserves_volume() {
        check_refinement([Edge::new(1, 3)].into_iter().collect(), 2);
    }

    #[test]
    fn quadrisection_conserves_volume() {
        let marked = [Edge::new(0, 1), Edge::new(0, 3), Edge::new(1, 3)];
        check_refinement(marked.into_iter().collect(), 4);
    }

    #[test]
    fn octasection_conserves_volume() {
        let (inpoel, _) = unit_tet();
        check_refinement(edges(&inpoel), 8);
    }

    #[test]
    fn two_marked_edges_are_promoted_to_all_six() {
        let (inpoel, _) = unit_tet();
        let mut marked: BTreeSet<Edge> = [Edge::new(0, 1), Edge::new(2, 3)].into_iter().collect();
        let added = conform(&inpoel, &mut marked);
        assert_eq!(added.len(), 4);
        assert_eq!(marked.len(), 6);
    }

    #[test]
    fn promotion_propagates_to_neighbors() {
        // Two tets sharing the face (1, 2, 3).
        let inpoel = vec![[0, 1, 2, 3], [4, 1, 3, 2]];
        let mut marked: BTreeSet<Edge> = [Edge::new(0, 1), Edge::new(0, 2), Edge::new(4, 1)]
            .into_iter()
            .collect();
        conform(&inpoel, &mut marked);
        assert!(inpoel.iter().all(|t| classify(pattern(t, &marked)).is_some()));
        assert_eq!(marked.len(), edges(&inpoel).len());
    }

    #[test]
    fn empty_mark_set_leaves_the_mesh_unchanged() {
        let (inpoel, coord) = unit_tet();
        let r = apply_refinement(&inpoel, &coord, &BTreeSet::new()).unwrap();
        assert_eq!(r.inpoel, inpoel);
        assert_eq!(r.coord, coord);
        assert!(r.families.is_empty());
    }

    #[test]
    fn new_nodes_are_appended_in_edge_order() {
        let (inpoel, coord) = unit_tet();
        let r = apply_refinement(&inpoel, &coord, &edges(&inpoel)).unwrap();
        let parents: Vec<Edge> = r.added_nodes.values().copied().collect();
        let mut sorted = parents.clone();
        sorted.sort();
        assert_eq!(parents, sorted);
        assert_eq!(r.coord[4], [0.5, 0.0, 0.0]);
    }

    #[test]
    fn non_conforming_marks_are_rejected() {
        let (inpoel, coord) = unit_tet();
        let marked = [Edge::new(0, 1), Edge::new(2, 3)].into_iter().collect();
        assert!(apply_refinement(&inpoel, &coord, &marked).is_err());
    }
}
