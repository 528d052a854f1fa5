use crate::config::SchemeKind;
use crate::error::{Error, Result};
use crate::mesh::Partition;

use super::{Decay, Scheme};

/// Construct the scheme selected by the configuration for one partition.
///
pub fn build(kind: &SchemeKind, partition: &Partition) -> Result<Box<dyn Scheme>> {
    match kind {
        SchemeKind::Decay { rate } if *rate >= 0.0 => Ok(Box::new(Decay::new(*rate, partition.num_nodes()))),
        SchemeKind::Decay { rate } => Err(Error::Config(format!("decay rate must not be negative, got {}", rate))),
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::mesh::{distribute, GlobalMesh};

    #[test]
    fn registry_builds_the_configured_scheme() {
        let mesh = GlobalMesh::cube(1);
        let parts = distribute(&mesh, &[0; 6], 1).unwrap();
        let scheme = build(&SchemeKind::Decay { rate: 2.0 }, &parts[0].0).unwrap();
        assert_eq!(scheme.names(), vec!["u".to_string()]);
        assert!(build(&SchemeKind::Decay { rate: -1.0 }, &parts[0].0).is_err());
    }
}
