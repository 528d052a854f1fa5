//! The discretization driver: time state, the per-step phase machine, the
//! linear solve and field output of one partition. The driver does not talk
//! to other partitions itself; the runtime performs the halo rounds and
//! reductions each phase needs and hands the results back.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::DriverConfig;
use crate::error::{Error, Result, Stage};
use crate::geometry::Point;
use crate::mesh::{Generation, Partition};
use crate::scheme::{MeshChange, SchemeAdapter};




/// Phases of the driver. A run goes `Init -> ComputeVolume`, then repeats
/// `ComputeLhs -> ComputeRhs -> Solve -> Advance -> [Refine] -> Output`
/// until `Terminal`. Initial refinement passes run between `Init` and the
/// first `ComputeVolume`, and a step that changed the mesh recomputes the
/// volume before its output.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Init,
    ComputeVolume,
    ComputeLhs,
    ComputeRhs,
    Solve,
    Advance,
    Refine,
    Output,
    Terminal,
}

impl Phase {
    pub fn can_become(self, next: Phase) -> bool {
        use Phase::*;

        matches!(
            (self, next),
            (Init, Refine)
                | (Init, ComputeVolume)
                | (Refine, Refine)
                | (Refine, ComputeVolume)
                | (Refine, Output)
                | (ComputeVolume, ComputeLhs)
                | (ComputeVolume, Output)
                | (ComputeVolume, Terminal)
                | (ComputeLhs, ComputeRhs)
                | (ComputeRhs, Solve)
                | (Solve, Advance)
                | (Advance, Refine)
                | (Advance, Output)
                | (Output, ComputeVolume)
                | (Output, ComputeLhs)
                | (Output, Terminal)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}




/// Time state of one partition. `itr` counts refinement passes that changed
/// the mesh, and `itf` counts field outputs since the last of them.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeState {
    pub t: f64,
    pub dt: f64,
    pub it: u64,
    pub itr: u64,
    pub itf: u64,
}




/// Solves the merged system for the solution increment.
///
pub trait LinearSolver: Send {
    fn solve(&self, lhs: &[f64], rhs: &[f64]) -> Result<Vec<f64>>;
}

/// Diagonal (lumped mass) solver: du = rhs / lhs, componentwise.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct LumpedSolver;

impl LinearSolver for LumpedSolver {
    fn solve(&self, lhs: &[f64], rhs: &[f64]) -> Result<Vec<f64>> {
        if lhs.len() != rhs.len() {
            return Err(Error::InvalidMesh(format!("lhs has {} values, rhs {}", lhs.len(), rhs.len())));
        }
        if let Some(i) = lhs.iter().position(|&l| l == 0.0) {
            return Err(Error::InvalidMesh(format!("zero diagonal at position {}", i)));
        }
        Ok(rhs.iter().zip(lhs).map(|(r, l)| r / l).collect())
    }
}




/// One partition's field output at one iteration.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub rank: usize,
    pub generation: Generation,
    pub it: u64,
    pub t: f64,
    pub connectivity: Vec<[u64; 4]>,
    pub coordinates: Vec<Point>,
    /// Node fields by name, each with one value per node.
    pub node_fields: Vec<(String, Vec<f64>)>,
    /// Element fields by name, each with one value per element.
    pub element_fields: Vec<(String, Vec<f64>)>,
}

/// Receives field output.
///
pub trait FieldWriter: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;
}

/// Discards all output.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct NullWriter;

impl FieldWriter for NullWriter {
    fn write(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }
}

/// Keeps every frame in memory; clones share the same list.
///
#[derive(Clone, Debug, Default)]
pub struct MemoryWriter {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl FieldWriter for MemoryWriter {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.frames
            .lock()
            .map_err(|_| Error::Channel("frame list lock poisoned".into()))?
            .push(frame.clone());
        Ok(())
    }
}

/// Appends each frame to a byte stream as one CBOR item.
///
pub struct CborWriter<W> {
    sink: W,
}

impl<W: Write + Send> CborWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: Write + Send> FieldWriter for CborWriter<W> {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        ciborium::ser::into_writer(frame, &mut self.sink).map_err(|e| Error::Snapshot(e.to_string()))?;
        self.sink.flush().map_err(|e| Error::Snapshot(e.to_string()))
    }
}




/// Per-partition driver state.
///
pub struct Driver {
    rank: usize,
    config: DriverConfig,
    phase: Phase,
    time: TimeState,
    volume: Vec<f64>,
    total_volume: f64,
    volume_stale: bool,
    refined: bool,
    wrote: bool,
}

impl Driver {
    pub fn new(config: &DriverConfig, rank: usize) -> Self {
        Self {
            rank,
            config: config.clone(),
            phase: Phase::Init,
            time: TimeState {
                t: config.t0,
                dt: config.dt,
                it: 0,
                itr: 0,
                itf: 0,
            },
            volume: Vec::new(),
            total_volume: 0.0,
            volume_stale: true,
            refined: false,
            wrote: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn time(&self) -> TimeState {
        self.time
    }

    /// Move to the next phase; anything the phase machine does not allow is
    /// a protocol violation.
    ///
    pub fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_become(next) {
            return Err(Error::ProtocolViolation {
                rank: self.rank,
                stage: Stage::Setup,
                peer: self.rank,
                detail: format!("driver cannot go from {} to {}", self.phase, next),
            });
        }
        debug!("[rank {}] driver {} -> {}", self.rank, self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Enter `ComputeVolume` and return this partition's nodal volume
    /// contributions.
    ///
    pub fn volume(&mut self, partition: &Partition) -> Result<Vec<f64>> {
        self.transition(Phase::ComputeVolume)?;
        partition.nodal_volumes()
    }

    /// Store the merged nodal volumes and the global mesh volume.
    ///
    pub fn set_volume(&mut self, merged: Vec<f64>, total: f64) {
        if self.rank == 0 {
            info!("total mesh volume: {}", total);
        }
        self.volume = merged;
        self.total_volume = total;
        self.volume_stale = false;
    }

    pub fn merged_volume(&self) -> &[f64] {
        &self.volume
    }

    pub fn total_volume(&self) -> f64 {
        self.total_volume
    }

    pub fn volume_is_stale(&self) -> bool {
        self.volume_stale
    }

    /// Compute the next step size: the scheme's suggestion times the CFL
    /// factor when one is configured, the constant step otherwise, reduced
    /// over all partitions with `global_min`, then clamped so the step does
    /// not overshoot the end time.
    ///
    pub fn next_dt<F>(&mut self, suggestion: f64, global_min: F) -> Result<f64>
    where
        F: FnOnce(f64) -> Result<f64>,
    {
        let local = if self.config.cfl > 0.0 {
            suggestion * self.config.cfl
        } else {
            self.config.dt
        };
        let mut dt = global_min(local)?;

        if self.time.t + dt > self.config.term {
            dt = self.config.term - self.time.t;
        }
        self.time.dt = dt;
        Ok(dt)
    }

    /// Enter `Solve` and return the solution increment.
    ///
    pub fn solve(&mut self, solver: &dyn LinearSolver, lhs: &[f64], rhs: &[f64]) -> Result<Vec<f64>> {
        self.transition(Phase::Solve)?;
        solver.solve(lhs, rhs)
    }

    /// Enter `Advance`: one more step, and time moves by `dt`.
    ///
    pub fn advance(&mut self) -> Result<()> {
        self.transition(Phase::Advance)?;
        self.time.it += 1;
        self.time.t += self.time.dt;
        self.refined = false;
        self.wrote = false;
        Ok(())
    }

    pub fn wants_refine(&self) -> bool {
        self.config.refine_interval > 0 && self.time.it % self.config.refine_interval == 0
    }

    pub fn wants_output(&self) -> bool {
        self.time.it % self.config.output_interval == 0 || self.is_finished()
    }

    /// True when the step count or the end time has been reached.
    ///
    pub fn is_finished(&self) -> bool {
        let eps = 1e-12 * self.config.term.abs().max(1.0);
        self.time.it >= self.config.nstep || (self.time.t - self.config.term).abs() < eps
    }

    /// Enter `Output` and write a frame if this iteration is due. The frame
    /// is built from the time state and the merged nodal volumes.
    ///
    pub fn output<F>(&mut self, writer: &mut dyn FieldWriter, frame: F) -> Result<()>
    where
        F: FnOnce(&TimeState, &[f64]) -> Frame,
    {
        self.transition(Phase::Output)?;

        if self.wants_output() {
            writer.write(&frame(&self.time, &self.volume))?;
            self.time.itf += 1;
            self.wrote = true;
        }
        Ok(())
    }

    /// Finish a step. Returns true if the run is over, either because this
    /// partition is done or because a stop was requested anywhere.
    ///
    pub fn end_step(&mut self, stop_requested: bool) -> Result<bool> {
        if stop_requested || self.is_finished() {
            self.transition(Phase::Terminal)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// The status line of the current step: iteration, time, step size and
    /// flags (`f` for field output, `h` for a mesh change).
    ///
    pub fn status(&self) -> String {
        let mut flags = String::new();

        if self.wrote {
            flags.push('f');
        }
        if self.refined {
            flags.push('h');
        }
        format!(
            "{:>8}  {:>14.6e}  {:>14.6e}  {}",
            self.time.it, self.time.t, self.time.dt, flags
        )
    }
}

impl SchemeAdapter for Driver {
    fn on_mesh_changed(&mut self, change: &MeshChange) {
        debug!(
            "[rank {}] driver resized to {} nodes at {}",
            self.rank,
            change.num_nodes(),
            change.generation
        );
        self.volume = vec![0.0; change.num_nodes()];
        self.volume_stale = true;
        self.refined = true;
        self.time.itr += 1;
        self.time.itf = 0;
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::adjacency::AdjacencyMap;

    fn config(term: f64, dt: f64) -> DriverConfig {
        DriverConfig {
            term,
            dt,
            ..DriverConfig::default()
        }
    }

    fn run_phases(driver: &mut Driver, phases: &[Phase]) -> Result<()> {
        phases.iter().try_for_each(|&p| driver.transition(p))
    }

    #[test]
    fn step_size_is_clamped_to_the_end_time() {
        let mut driver = Driver::new(&config(1.0, 0.3), 0);
        let mut steps = 0;

        run_phases(&mut driver, &[Phase::ComputeVolume]).unwrap();
        while !driver.is_finished() {
            driver.next_dt(0.0, Ok).unwrap();
            run_phases(&mut driver, &[Phase::ComputeLhs, Phase::ComputeRhs, Phase::Solve]).unwrap();
            driver.advance().unwrap();
            run_phases(&mut driver, &[Phase::Output]).unwrap();
            steps += 1;
        }
        assert_eq!(steps, 4);
        assert!((driver.time().t - 1.0).abs() < 1e-15);
        assert!((driver.time().dt - 0.1).abs() < 1e-12);
    }

    #[test]
    fn cfl_scales_the_suggestion_and_takes_the_global_minimum() {
        let mut driver = Driver::new(
            &DriverConfig {
                cfl: 0.5,
                ..config(10.0, 1.0)
            },
            0,
        );
        assert_eq!(driver.next_dt(2.0, Ok).unwrap(), 1.0);
        assert_eq!(driver.next_dt(2.0, |x| Ok(x.min(0.25))).unwrap(), 0.25);
    }

    #[test]
    fn phases_follow_the_machine() {
        let mut driver = Driver::new(&config(1.0, 0.1), 0);
        assert!(driver.transition(Phase::ComputeLhs).is_err());
        run_phases(&mut driver, &[Phase::Refine, Phase::ComputeVolume, Phase::Output, Phase::ComputeLhs]).unwrap();
        assert!(matches!(
            driver.transition(Phase::Output),
            Err(Error::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn nstep_ends_the_run() {
        let mut driver = Driver::new(
            &DriverConfig {
                nstep: 2,
                ..config(100.0, 1.0)
            },
            0,
        );
        run_phases(&mut driver, &[Phase::ComputeVolume, Phase::Output]).unwrap();

        for _ in 0..2 {
            assert!(!driver.end_step(false).unwrap());
            run_phases(&mut driver, &[Phase::ComputeLhs, Phase::ComputeRhs, Phase::Solve]).unwrap();
            driver.advance().unwrap();
            run_phases(&mut driver, &[Phase::Output]).unwrap();
        }
        assert!(driver.end_step(false).unwrap());
        assert_eq!(driver.phase(), Phase::Terminal);
    }

    #[test]
    fn stop_request_ends_the_run() {
        let mut driver = Driver::new(&config(1.0, 0.1), 0);
        run_phases(&mut driver, &[Phase::ComputeVolume, Phase::Output]).unwrap();
        assert!(driver.end_step(true).unwrap());
    }

    #[test]
    fn output_is_written_on_interval_and_at_the_end() {
        let mut driver = Driver::new(
            &DriverConfig {
                output_interval: 3,
                ..config(0.5, 0.1)
            },
            0,
        );
        let mut writer = MemoryWriter::new();
        let frame = |time: &TimeState, _: &[f64]| Frame {
            rank: 0,
            generation: Generation::default(),
            it: time.it,
            t: time.t,
            connectivity: vec![],
            coordinates: vec![],
            node_fields: vec![],
            element_fields: vec![],
        };

        run_phases(&mut driver, &[Phase::ComputeVolume]).unwrap();
        driver.output(&mut writer, frame).unwrap();

        while !driver.end_step(false).unwrap() {
            driver.next_dt(0.0, Ok).unwrap();
            run_phases(&mut driver, &[Phase::ComputeLhs, Phase::ComputeRhs, Phase::Solve]).unwrap();
            driver.advance().unwrap();
            driver.output(&mut writer, frame).unwrap();
        }
        let its: Vec<u64> = writer.frames().iter().map(|f| f.it).collect();
        assert_eq!(its, vec![0, 3, 5]);
    }

    #[test]
    fn mesh_change_marks_volume_stale() {
        let mut driver = Driver::new(&config(1.0, 0.1), 0);
        driver.set_volume(vec![1.0; 4], 1.0);
        assert!(!driver.volume_is_stale());

        driver.on_mesh_changed(&MeshChange {
            generation: Generation(1),
            connectivity: vec![],
            coordinates: vec![[0.0; 3]; 5],
            added_node_parents: Default::default(),
            node_map: vec![Some(0); 4],
            adjacency: AdjacencyMap::new(0),
        });
        assert!(driver.volume_is_stale());
        assert_eq!(driver.merged_volume().len(), 5);
        assert_eq!(driver.time().itr, 1);
    }

    #[test]
    fn lumped_solver_divides() {
        assert_eq!(LumpedSolver.solve(&[2.0, 4.0], &[1.0, 1.0]).unwrap(), vec![0.5, 0.25]);
        assert!(LumpedSolver.solve(&[0.0], &[1.0]).is_err());
    }
}
