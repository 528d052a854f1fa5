/**
 * Tetrahedron connectivity: four local node indexes.
 */
pub type Tet = [usize; 4];

/**
 * Node coordinates.
 */
pub type Point = [f64; 3];




/**
 * Triple product a . (b x c)
 */
pub fn triple(a: Point, b: Point, c: Point) -> f64 {
    a[0] * (b[1] * c[2] - b[2] * c[1])
        + a[1] * (b[2] * c[0] - b[0] * c[2])
        + a[2] * (b[0] * c[1] - b[1] * c[0])
}

fn sub(a: Point, b: Point) -> Point {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/**
 * Signed volume of the tetrahedron with the given vertex coordinates. It is
 * positive when the vertices are ordered such that (x1 - x0, x2 - x0, x3 -
 * x0) is a right-handed triple.
 */
pub fn signed_volume(x: [Point; 4]) -> f64 {
    triple(sub(x[1], x[0]), sub(x[2], x[0]), sub(x[3], x[0])) / 6.0
}

/**
 * Signed volume of a tetrahedron given as node indexes into a coordinate
 * array.
 */
pub fn tet_volume(tet: &Tet, coord: &[Point]) -> f64 {
    signed_volume([coord[tet[0]], coord[tet[1]], coord[tet[2]], coord[tet[3]]])
}

/**
 * Midpoint of two nodes. The sum is formed in a fixed order so every
 * partition computes a bit-identical result for the same pair.
 */
pub fn midpoint(a: Point, b: Point) -> Point {
    [
        0.5 * (a[0] + b[0]),
        0.5 * (a[1] + b[1]),
        0.5 * (a[2] + b[2]),
    ]
}

/**
 * Swap the last two vertexes of a tetrahedron if its signed volume is
 * negative.
 */
pub fn orient(mut tet: Tet, coord: &[Point]) -> Tet {
    if tet_volume(&tet, coord) < 0.0 {
        tet.swap(2, 3);
    }
    tet
}

/**
 * Return true if the point lies in the closed box [lower, upper].
 */
pub fn in_box(x: Point, lower: Point, upper: Point) -> bool {
    (0..3).all(|i| lower[i] <= x[i] && x[i] <= upper[i])
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    const UNIT: [Point; 4] = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
    ];

    #[test]
    fn unit_tet_has_volume_one_sixth() {
        assert!((signed_volume(UNIT) - 1.0 / 6.0).abs() < 1e-15);
    }

    #[test]
    fn orient_fixes_inverted_tets() {
        let coord = UNIT.to_vec();
        let inverted = [0, 2, 1, 3];
        assert!(tet_volume(&inverted, &coord) < 0.0);
        assert!(tet_volume(&orient(inverted, &coord), &coord) > 0.0);
    }

    #[test]
    fn midpoint_is_symmetric() {
        let a = [0.1, 0.7, 0.3];
        let b = [0.9, 0.2, 0.6];
        assert_eq!(midpoint(a, b), midpoint(b, a));
    }
}
