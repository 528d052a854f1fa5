//! Meshweave is a library for running time-dependent solvers on a
//! distributed, adaptively refined, unstructured tetrahedral mesh. The mesh is
//! split into partitions, each driven by one actor that owns its elements and
//! nodes outright; partitions cooperate only by exchanging messages. Nodes on
//! partition boundaries are merged by halo exchange rounds, and refinement
//! decisions made locally are negotiated across boundaries until the mesh is
//! conforming again, after which every partition moves to the next mesh
//! generation.

pub mod adjacency;
pub mod amr;
pub mod automaton;
pub mod boundary;
pub mod config;
pub mod driver;
pub mod error;
pub mod geometry;
pub mod halo;
pub mod mesh;
pub mod message;
pub mod refiner;
pub mod runtime;
pub mod scheme;

pub use error::{Error, Result};
