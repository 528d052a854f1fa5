use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The stage of the computation in which an error was raised. Fatal errors
/// report it together with the partition rank and the offending entity.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Setup,
    Volume,
    Lhs,
    Rhs,
    Refine,
    Derefine,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Stage::*;

        let name = match self {
            Setup => "setup",
            Volume => "volume",
            Lhs => "lhs",
            Rhs => "rhs",
            Refine => "refine",
            Derefine => "derefine",
            Output => "output",
        };
        fmt.write_str(name)
    }
}

/// A shared edge (as a pair of global node IDs) whose refinement state the
/// partitions sharing it could not agree on.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disagreement {
    pub edge: (u64, u64),
    pub partitions: Vec<usize>,
}

impl fmt::Display for Disagreement {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "edge {}-{} on partitions {:?}",
            self.edge.0, self.edge.1, self.partitions
        )
    }
}

fn describe(edges: &[Disagreement]) -> String {
    edges
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error type for every fallible operation in the crate. All variants
/// except `Config` and `Snapshot` are fatal for the distributed run: the
/// runtime tears down every partition when one of them is returned.
///
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("[rank {rank}] stage volume: element {element} with nodes {nodes:?} has non-positive volume {volume:e}")]
    DegenerateElement {
        rank: usize,
        element: usize,
        nodes: [u64; 4],
        volume: f64,
    },

    #[error("[rank {rank}] stage {stage}: protocol violation involving rank {peer}: {detail}")]
    ProtocolViolation {
        rank: usize,
        stage: Stage,
        peer: usize,
        detail: String,
    },

    #[error("[rank {rank}] stage refine: mesh not conforming after {rounds} correction rounds: {}", describe(.edges))]
    RefinementDiverged {
        rank: usize,
        rounds: usize,
        edges: Vec<Disagreement>,
    },

    #[error("{pending} exchange participants never received all of their messages")]
    Stalled { pending: usize },

    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("message codec error: {0}")]
    Codec(String),

    #[error("message channel closed: {0}")]
    Channel(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("[rank {rank}] torn down after a fatal error on another partition")]
    Aborted { rank: usize },
}

impl Error {
    /// Return true if this error is a consequence of a failure elsewhere,
    /// rather than the original cause.
    pub fn is_secondary(&self) -> bool {
        matches!(self, Error::Aborted { .. } | Error::Channel(_))
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn fatal_errors_name_rank_stage_and_entity() {
        let e = Error::DegenerateElement {
            rank: 3,
            element: 7,
            nodes: [1, 2, 3, 4],
            volume: -1.0,
        };
        let text = e.to_string();
        assert!(text.contains("rank 3"));
        assert!(text.contains("volume"));
        assert!(text.contains("element 7"));

        let e = Error::RefinementDiverged {
            rank: 1,
            rounds: 4,
            edges: vec![Disagreement {
                edge: (10, 12),
                partitions: vec![0, 1],
            }],
        };
        assert!(e.to_string().contains("edge 10-12 on partitions [0, 1]"));
    }

    #[test]
    fn teardown_errors_are_secondary() {
        assert!(Error::Aborted { rank: 0 }.is_secondary());
        assert!(!Error::Stalled { pending: 1 }.is_secondary());
    }
}
