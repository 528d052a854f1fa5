use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use log::{info, LevelFilter};
use meshweave::config::Config;
use meshweave::driver::{CborWriter, FieldWriter, NullWriter};
use meshweave::mesh::{distribute, GlobalMesh};
use meshweave::runtime::Group;
use meshweave::scheme::registry;
use meshweave::Error;

/// Run the decay scheme on a partitioned unit cube.
#[derive(Debug, Parser)]
#[clap(version, author)]
struct Opts {
    /// Cells per direction of the initial cube
    #[clap(short = 'n', long, default_value = "8")]
    cells: usize,

    /// Number of partitions, cut into slabs along x
    #[clap(short = 'p', long, default_value = "4")]
    partitions: usize,

    /// Directory for one CBOR frame stream per partition
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace
    #[clap(short = 'l', long, default_value = "info")]
    log_level: LevelFilter,

    /// Configuration entries, e.g. -s term=0.5 -s refine_interval=4
    #[clap(short = 's', long = "set", value_name = "KEY=VALUE")]
    settings: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();

    simple_logger::SimpleLogger::new().with_level(opts.log_level).init()?;

    let pairs = opts
        .settings
        .iter()
        .map(|s| {
            s.split_once('=')
                .ok_or_else(|| Error::Config(format!("setting '{}' is not of the form key=value", s)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let config = Config::from_pairs(pairs)?;

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;

    let mesh = GlobalMesh::cube(opts.cells);
    let parts = distribute(&mesh, &mesh.slabs(opts.partitions), opts.partitions)?;
    info!(
        "{} elements and {} nodes on {} partitions",
        mesh.num_elements(),
        mesh.num_nodes(),
        opts.partitions
    );

    if let Some(dir) = &opts.output {
        std::fs::create_dir_all(dir)?;
    }
    let kind = config.scheme.clone();
    let output = opts.output.clone();

    let reports = Group::new(parts, config)?.run(
        |partition| registry::build(&kind, partition),
        |rank| -> meshweave::Result<Box<dyn FieldWriter>> {
            match &output {
                Some(dir) => {
                    let path = dir.join(format!("frames.{:04}.cbor", rank));
                    let file = File::create(&path)
                        .map_err(|e| Error::Config(format!("cannot create {}: {}", path.display(), e)))?;
                    Ok(Box::new(CborWriter::new(BufWriter::new(file))))
                }
                None => Ok(Box::new(NullWriter)),
            }
        },
        stop,
    )?;

    let elements: usize = reports.iter().map(|r| r.elements.len()).sum();
    let volume = reports.first().map_or(0.0, |r| r.total_volume);

    for report in &reports {
        info!(
            "[rank {}] {} at t={:.6}: {} elements, {} nodes",
            report.rank,
            report.generation,
            report.time.t,
            report.elements.len(),
            report.coord.len()
        );
    }
    info!("finished with {} elements, total volume {}", elements, volume);
    Ok(())
}
