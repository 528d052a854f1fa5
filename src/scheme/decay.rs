use log::{debug, warn};

use super::{MeshChange, Scheme, SchemeAdapter};
use crate::error::Result;
use crate::mesh::Partition;

/// Reference scheme for the ODE du/dt = -k u at every node, discretized
/// with a lumped mass matrix and forward Euler. The lhs is the nodal volume
/// and the rhs is -k dt u times the nodal volume, so after merging across
/// partitions the solve yields du = -k dt u exactly. The initial condition
/// is a bump centered in the unit cube, which gives the error indicator
/// something to refine on.
///
pub struct Decay {
    rate: f64,
    u: Vec<f64>,
}

impl Decay {
    pub fn new(rate: f64, nnodes: usize) -> Self {
        Self {
            rate,
            u: vec![0.0; nnodes],
        }
    }

    pub fn initial(x: [f64; 3]) -> f64 {
        let r2: f64 = x.iter().map(|xi| (xi - 0.5) * (xi - 0.5)).sum();
        1.0 + (-20.0 * r2).exp()
    }
}

impl SchemeAdapter for Decay {
    fn on_mesh_changed(&mut self, change: &MeshChange) {
        if change.node_map.len() != self.u.len() {
            warn!(
                "decay: solution has {} nodes but the old mesh had {}; resetting",
                self.u.len(),
                change.node_map.len()
            );
            self.u = change.coordinates.iter().map(|&x| Self::initial(x)).collect();
            return;
        }
        self.u = change.interpolate(&self.u, 1);
        debug!("decay: solution carried over to {} nodes", self.u.len());
    }
}

impl Scheme for Decay {
    fn names(&self) -> Vec<String> {
        vec!["u".to_string()]
    }

    fn nprop(&self) -> usize {
        1
    }

    fn initialize(&mut self, partition: &Partition, _t: f64) {
        self.u = partition.coord().iter().map(|&x| Self::initial(x)).collect();
    }

    fn lhs(&self, partition: &Partition) -> Result<Vec<f64>> {
        partition.nodal_volumes()
    }

    fn rhs(&self, partition: &Partition, _t: f64, dt: f64) -> Result<Vec<f64>> {
        let vol = partition.nodal_volumes()?;
        Ok(self.u.iter().zip(&vol).map(|(u, v)| -self.rate * dt * u * v).collect())
    }

    fn suggest_dt(&self, _partition: &Partition) -> f64 {
        if self.rate > 0.0 {
            1.0 / self.rate
        } else {
            f64::INFINITY
        }
    }

    fn update(&mut self, du: &[f64]) {
        for (u, d) in self.u.iter_mut().zip(du) {
            *u += d;
        }
    }

    fn solution(&self) -> &[f64] {
        &self.u
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::mesh::{distribute, GlobalMesh};

    #[test]
    fn lumped_solve_gives_forward_euler() {
        let mesh = GlobalMesh::cube(2);
        let parts = distribute(&mesh, &vec![0; mesh.num_elements()], 1).unwrap();
        let partition = &parts[0].0;

        let mut scheme = Decay::new(0.5, partition.num_nodes());
        scheme.initialize(partition, 0.0);
        let u0 = scheme.solution().to_vec();

        let lhs = scheme.lhs(partition).unwrap();
        let rhs = scheme.rhs(partition, 0.0, 0.1).unwrap();
        let du: Vec<f64> = rhs.iter().zip(&lhs).map(|(r, l)| r / l).collect();
        scheme.update(&du);

        for (u, u0) in scheme.solution().iter().zip(&u0) {
            assert!((u - u0 * 0.95).abs() < 1e-12);
        }
    }

    #[test]
    fn bump_peaks_at_the_center() {
        assert!((Decay::initial([0.5, 0.5, 0.5]) - 2.0).abs() < 1e-15);
        assert!(Decay::initial([0.0, 0.0, 0.0]) < 1.01);
    }
}
