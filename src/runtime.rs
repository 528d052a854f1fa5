//! The runtime: one long-lived actor per partition, each on its own scoped
//! thread, talking over an in-process channel host. An actor owns its
//! partition's mesh store, adjacency map, halo exchange, driver, refiner and
//! scheme, and nothing else; everything it learns about the other partitions
//! arrives through its link.
//!
//! The first fatal error on any partition triggers the host's teardown
//! signal, which wakes every other actor blocked on a receive with
//! `Error::Aborted`. The group then returns the error that started it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};

use crate::adjacency::AdjacencyMap;
use crate::amr::{Criterion, Edge, EdgeState};
use crate::config::Config;
use crate::driver::{Driver, FieldWriter, Frame, LumpedSolver, Phase, TimeState};
use crate::error::{Error, Result};
use crate::geometry::Point;
use crate::halo::{exchange, HaloExchange, QuantityKey};
use crate::message::{ChannelComm, ChannelHost, Communicator, Link, Teardown};
use crate::mesh::{Generation, Partition};
use crate::refiner::{refinement_fields, Refiner};
use crate::scheme::{MeshChange, Scheme, SchemeAdapter};




/// What one partition looks like at the end of a run.
///
#[derive(Clone, Debug)]
pub struct Report {
    pub rank: usize,
    pub time: TimeState,
    pub generation: Generation,
    /// Elements in global node IDs.
    pub elements: Vec<[u64; 4]>,
    pub coord: Vec<Point>,
    pub gid: Vec<u64>,
    /// Merged nodal volumes.
    pub volume: Vec<f64>,
    pub total_volume: f64,
    pub solution: Vec<f64>,
    /// Final state of every edge shared with another partition.
    pub boundary: BTreeMap<Edge<u64>, EdgeState>,
}




/// Triggers the teardown if the actor thread unwinds, so that nobody stays
/// blocked waiting for a partition that is gone.
///
struct PanicGuard {
    rank: usize,
    teardown: Teardown,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("[rank {}] actor panicked", self.rank);
            self.teardown.trigger();
        }
    }
}




/// The field output of one partition.
///
fn frame(partition: &Partition, scheme: &dyn Scheme, time: &TimeState, volume: &[f64]) -> Frame {
    let n = scheme.nprop().max(1);
    let solution = scheme.solution();

    let mut node_fields: Vec<(String, Vec<f64>)> = scheme
        .names()
        .into_iter()
        .enumerate()
        .map(|(c, name)| (name, solution.iter().skip(c).step_by(n).copied().collect()))
        .collect();
    node_fields.push(("volume".to_string(), volume.to_vec()));

    Frame {
        rank: partition.rank(),
        generation: partition.generation(),
        it: time.it,
        t: time.t,
        connectivity: (0..partition.num_elements()).map(|e| partition.global_element(e)).collect(),
        coordinates: partition.coord().to_vec(),
        node_fields,
        element_fields: vec![("refinement_level".to_string(), refinement_fields(partition))],
    }
}




/// Everything an actor owns.
///
struct Actor<C> {
    rank: usize,
    partition: Partition,
    adjacency: AdjacencyMap,
    link: Link<C>,
    halo: HaloExchange,
    driver: Driver,
    refiner: Refiner,
}

impl<C: Communicator> Actor<C> {
    fn new(config: &Config, partition: Partition, adjacency: AdjacencyMap, link: Link<C>) -> Result<Self> {
        let rank = partition.rank();
        Ok(Self {
            rank,
            halo: HaloExchange::new(&partition, &adjacency)?,
            driver: Driver::new(&config.driver, rank),
            refiner: Refiner::new(rank, &config.refine),
            partition,
            adjacency,
            link,
        })
    }

    /// Enter `ComputeVolume`: merge the nodal volumes over the halo and sum
    /// the mesh volume over all partitions.
    fn compute_volume(&mut self) -> Result<()> {
        let contribution = self.driver.volume(&self.partition)?;
        let [merged]: [Vec<f64>; 1] = self.exchange(vec![(QuantityKey::Volume, 1, contribution)])?;
        let total = self.link.sum_f64(self.partition.element_volumes().iter().sum())?;
        self.driver.set_volume(merged, total);
        Ok(())
    }

    fn exchange<const N: usize>(&mut self, rounds: Vec<(QuantityKey, usize, Vec<f64>)>) -> Result<[Vec<f64>; N]> {
        let rank = self.rank;
        exchange(&mut self.link, &mut self.halo, rounds)?
            .try_into()
            .map_err(|merged: Vec<Vec<f64>>| Error::Channel(format!("[rank {}] expected {} merged arrays, got {}", rank, N, merged.len())))
    }

    /// Tell everyone holding per-node state that the mesh changed.
    fn mesh_changed<S: Scheme + ?Sized>(&mut self, change: &MeshChange, scheme: &mut Option<&mut S>) -> Result<()> {
        if let Some(scheme) = scheme {
            scheme.on_mesh_changed(change);
        }
        self.driver.on_mesh_changed(change);
        self.halo.rebuild(&self.partition, &self.adjacency)
    }

    /// Run one refinement pass with the given criterion. With `derefine`
    /// set and a scheme present, follow it with a derefinement pass whose
    /// criterion is read from the scheme on the refined mesh. Returns true
    /// if the mesh changed.
    fn adapt<S: Scheme + ?Sized>(&mut self, criterion: &Criterion, derefine: bool, mut scheme: Option<&mut S>) -> Result<bool> {
        let mut changed = false;

        if let Some(change) = self.refiner.refine(&mut self.link, &mut self.partition, &mut self.adjacency, criterion)? {
            self.mesh_changed(&change, &mut scheme)?;
            changed = true;
        }
        let deref = match &scheme {
            Some(scheme) if derefine => self.refiner.deref_criterion(&scheme.error_indicator()),
            _ => None,
        };
        if let Some(deref) = deref {
            if let Some(change) = self.refiner.derefine(&mut self.link, &mut self.partition, &mut self.adjacency, &deref)? {
                self.mesh_changed(&change, &mut scheme)?;
                changed = true;
            }
        }
        Ok(changed)
    }

    fn stop_requested(&self, stop: &AtomicBool) -> Result<bool> {
        Ok(self.link.max_u64(stop.load(Ordering::Relaxed) as u64)? > 0)
    }

    /// The whole life of a partition: initial refinement, then time steps
    /// until the end time, the step limit or a stop request.
    fn run(&mut self, config: &Config, scheme: &mut dyn Scheme, writer: &mut dyn FieldWriter, stop: &AtomicBool) -> Result<()> {
        let t0 = self.driver.time().t;
        scheme.initialize(&self.partition, t0);

        for &kind in &config.refine.initial {
            self.driver.transition(Phase::Refine)?;
            let criterion = self.refiner.criterion(kind, &self.partition, Some(scheme.error_indicator().as_slice()))?;

            if self.adapt(&criterion, false, Some(&mut *scheme))? {
                scheme.initialize(&self.partition, t0);
            }
        }

        self.compute_volume()?;
        let partition = &self.partition;
        self.driver.output(writer, |time, volume| frame(partition, &*scheme, time, volume))?;

        while !self.driver.end_step(self.stop_requested(stop)?)? {
            let suggestion = scheme.suggest_dt(&self.partition);
            let link = &self.link;
            let dt = self.driver.next_dt(suggestion, |dt| link.min_f64(dt))?;
            let t = self.driver.time().t;
            let nprop = scheme.nprop();

            self.driver.transition(Phase::ComputeLhs)?;
            let lhs = scheme.lhs(&self.partition)?;
            self.driver.transition(Phase::ComputeRhs)?;
            let rhs = scheme.rhs(&self.partition, t, dt)?;

            let [lhs, rhs]: [Vec<f64>; 2] = self.exchange(vec![(QuantityKey::Lhs, nprop, lhs), (QuantityKey::Rhs, nprop, rhs)])?;
            let du = self.driver.solve(&LumpedSolver, &lhs, &rhs)?;
            scheme.update(&du);
            self.driver.advance()?;

            if self.driver.wants_refine() {
                self.driver.transition(Phase::Refine)?;
                let indicator = scheme.error_indicator();
                let criterion = self.refiner.criterion(config.refine.criterion, &self.partition, Some(indicator.as_slice()))?;

                if self.adapt(&criterion, true, Some(&mut *scheme))? {
                    self.compute_volume()?;
                }
            }
            let partition = &self.partition;
            self.driver.output(writer, |time, volume| frame(partition, &*scheme, time, volume))?;

            if self.rank == 0 {
                info!("{}", self.driver.status());
            }
        }
        Ok(())
    }

    fn report(&self, solution: Vec<f64>) -> Report {
        Report {
            rank: self.rank,
            time: self.driver.time(),
            generation: self.partition.generation(),
            elements: (0..self.partition.num_elements()).map(|e| self.partition.global_element(e)).collect(),
            coord: self.partition.coord().to_vec(),
            gid: self.partition.gid().to_vec(),
            volume: self.driver.merged_volume().to_vec(),
            total_volume: self.driver.total_volume(),
            solution,
            boundary: self.refiner.boundary_states().clone(),
        }
    }
}




/// A group of partitions run in this process, one actor thread each.
///
pub struct Group {
    parts: Vec<(Partition, AdjacencyMap)>,
    config: Config,
}

impl Group {
    /// Partition `i` of `parts` must have rank `i`, and the adjacency maps
    /// must agree with each other.
    ///
    pub fn new(parts: Vec<(Partition, AdjacencyMap)>, config: Config) -> Result<Self> {
        config.validate()?;

        if parts.is_empty() {
            return Err(Error::Config("a group needs at least one partition".into()));
        }
        for (i, (partition, adjacency)) in parts.iter().enumerate() {
            if partition.rank() != i || adjacency.rank() != i {
                return Err(Error::InvalidMesh(format!(
                    "slot {} holds partition {} with the adjacency of rank {}",
                    i,
                    partition.rank(),
                    adjacency.rank()
                )));
            }
            partition.check()?;
        }
        let maps: Vec<AdjacencyMap> = parts.iter().map(|(_, a)| a.clone()).collect();
        AdjacencyMap::check_symmetric(&maps)?;

        Ok(Self { parts, config })
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Run the time loop on every partition. `scheme` builds the scheme of
    /// a partition and `writer` its field output. Setting `stop` ends the
    /// run at the next step boundary on all partitions.
    ///
    pub fn run<S, W>(self, scheme: S, writer: W, stop: Arc<AtomicBool>) -> Result<Vec<Report>>
    where
        S: Fn(&Partition) -> Result<Box<dyn Scheme>> + Sync,
        W: Fn(usize) -> Result<Box<dyn FieldWriter>> + Sync,
    {
        let config = self.config.clone();

        self.launch(|mut actor| {
            let mut scheme = scheme(&actor.partition)?;
            let mut writer = writer(actor.rank)?;
            actor.run(&config, scheme.as_mut(), writer.as_mut(), &stop)?;
            Ok(actor.report(scheme.solution().to_vec()))
        })
    }

    /// Run a single refinement pass with a per-partition criterion and
    /// merge the nodal volumes of the result.
    ///
    pub fn refine_with<F>(self, criterion: F) -> Result<Vec<Report>>
    where
        F: Fn(usize, &Partition) -> Criterion + Sync,
    {
        self.launch(|mut actor| {
            actor.driver.transition(Phase::Refine)?;
            let criterion = criterion(actor.rank, &actor.partition);
            actor.adapt(&criterion, false, None::<&mut dyn Scheme>)?;
            actor.compute_volume()?;
            Ok(actor.report(Vec::new()))
        })
    }

    fn launch<T, F>(self, body: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(Actor<ChannelComm>) -> Result<T> + Sync,
    {
        let size = self.parts.len();
        let host = ChannelHost::new();
        let collective = host.plane(size);
        let data = host.plane(size);
        let config = &self.config;
        let body = &body;

        info!("starting {} partition actors", size);

        let results: Vec<Result<T>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .parts
                .into_iter()
                .zip(collective.into_iter().zip(data))
                .map(|((partition, adjacency), (collective, data))| {
                    let teardown = host.teardown().clone();

                    scope.spawn(move || {
                        let rank = partition.rank();
                        let _guard = PanicGuard {
                            rank,
                            teardown: teardown.clone(),
                        };
                        debug!(
                            "[rank {}] actor up: {} elements, {} nodes, {} neighbors",
                            rank,
                            partition.num_elements(),
                            partition.num_nodes(),
                            adjacency.len()
                        );
                        let link = Link::new(collective, data, partition.generation());
                        let result = Actor::new(config, partition, adjacency, link).and_then(body);

                        match &result {
                            Err(e) if e.is_secondary() => debug!("[rank {}] {}", rank, e),
                            Err(e) => {
                                error!("[rank {}] {}", rank, e);
                                teardown.trigger();
                            }
                            Ok(_) => debug!("[rank {}] actor done", rank),
                        }
                        result
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| handle.join().unwrap_or(Err(Error::Aborted { rank })))
                .collect()
        });

        let mut first = None;

        for result in &results {
            if let Err(e) = result {
                if !e.is_secondary() {
                    first = Some(e.clone());
                    break;
                }
                first.get_or_insert_with(|| e.clone());
            }
        }
        match first {
            Some(e) => Err(e),
            None => results.into_iter().collect(),
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::config::SchemeKind;
    use crate::driver::{MemoryWriter, NullWriter};
    use crate::mesh::{distribute, GlobalMesh};
    use crate::scheme::registry;

    fn group(n: usize, nparts: usize, config: Config) -> Group {
        let mesh = GlobalMesh::cube(n);
        Group::new(distribute(&mesh, &mesh.slabs(nparts), nparts).unwrap(), config).unwrap()
    }

    fn short_run() -> Config {
        let mut config = Config::default();
        config.driver.dt = 0.1;
        config.driver.term = 1.0;
        config.driver.nstep = 3;
        config.scheme = SchemeKind::Decay { rate: 0.5 };
        config
    }

    #[test]
    fn mismatched_adjacency_is_rejected() {
        let mesh = GlobalMesh::cube(2);
        let mut parts = distribute(&mesh, &mesh.slabs(2), 2).unwrap();
        parts[1].1 = AdjacencyMap::new(1);
        assert!(Group::new(parts, Config::default()).is_err());
    }

    #[test]
    fn decay_run_matches_forward_euler_everywhere() {
        let config = short_run();
        let kind = config.scheme.clone();
        let reports = group(2, 3, config)
            .run(|p| registry::build(&kind, p), |_| Ok(Box::new(NullWriter) as Box<dyn FieldWriter>), Arc::new(AtomicBool::new(false)))
            .unwrap();

        for report in &reports {
            assert_eq!(report.time.it, 3);
            assert!((report.total_volume - 1.0).abs() < 1e-12);

            for (u, x) in report.solution.iter().zip(&report.coord) {
                let expected = crate::scheme::Decay::initial(*x) * 0.95f64.powi(3);
                assert!((u - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn stop_flag_ends_the_run_before_the_first_step() {
        let config = short_run();
        let kind = config.scheme.clone();
        let writer = MemoryWriter::new();
        let frames = writer.clone();

        let reports = group(1, 2, config)
            .run(
                |p| registry::build(&kind, p),
                move |_| Ok(Box::new(writer.clone()) as Box<dyn FieldWriter>),
                Arc::new(AtomicBool::new(true)),
            )
            .unwrap();

        assert!(reports.iter().all(|r| r.time.it == 0));
        assert_eq!(frames.frames().len(), 2);
    }

    #[test]
    fn scheme_failure_tears_down_the_group() {
        let result = group(2, 3, short_run()).run(
            |p| {
                if p.rank() == 1 {
                    Err(Error::Config("no scheme for rank 1".into()))
                } else {
                    registry::build(&SchemeKind::Decay { rate: 1.0 }, p)
                }
            },
            |_| Ok(Box::new(NullWriter) as Box<dyn FieldWriter>),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn periodic_refinement_keeps_the_volume() {
        let mut config = short_run();
        config.driver.refine_interval = 2;
        config.refine.criterion = crate::config::CriterionKind::Uniform;
        let kind = config.scheme.clone();

        let reports = group(1, 2, config)
            .run(|p| registry::build(&kind, p), |_| Ok(Box::new(NullWriter) as Box<dyn FieldWriter>), Arc::new(AtomicBool::new(false)))
            .unwrap();

        for report in &reports {
            assert_eq!(report.generation, Generation(1));
            assert_eq!(report.time.itr, 1);
            assert!((report.total_volume - 1.0).abs() < 1e-12);
            assert_eq!(report.solution.len(), report.coord.len());
        }
    }
}
