use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::Point;




/// Time stepping and output settings of the discretization driver.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub t0: f64,
    pub term: f64,
    pub nstep: u64,
    /// Constant step size, used when `cfl` is zero.
    pub dt: f64,
    /// When positive, the step size is the scheme's suggestion times this.
    pub cfl: f64,
    pub output_interval: u64,
    /// Refine every this many steps; zero disables refinement in time.
    pub refine_interval: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            t0: 0.0,
            term: 1.0,
            nstep: u64::MAX,
            dt: 0.1,
            cfl: 0.0,
            output_interval: 1,
            refine_interval: 0,
        }
    }
}




/// How edges are selected for refinement. The parameters of each kind live
/// in [`RefineConfig`].
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    Uniform,
    ErrorIndicator,
    EdgeList,
    Region,
}

impl FromStr for CriterionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "uniform" => Ok(CriterionKind::Uniform),
            "error" | "error_indicator" => Ok(CriterionKind::ErrorIndicator),
            "edges" | "edge_list" => Ok(CriterionKind::EdgeList),
            "region" | "coord" => Ok(CriterionKind::Region),
            other => Err(Error::Config(format!("unknown refinement criterion '{}'", other))),
        }
    }
}




/// Settings of the refiner coordinator.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    pub criterion: CriterionKind,
    /// Jump of the indicator field above which an edge is refined.
    pub threshold: f64,
    /// Jump below which a split edge is un-split; `None` disables
    /// derefinement.
    pub deref_threshold: Option<f64>,
    pub region: Option<(Point, Point)>,
    /// Edges to refine, as pairs of global node IDs.
    pub edges: Vec<(u64, u64)>,
    pub max_correction_rounds: usize,
    /// Refinement passes applied at startup, before time stepping.
    pub initial: Vec<CriterionKind>,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            criterion: CriterionKind::ErrorIndicator,
            threshold: 0.1,
            deref_threshold: None,
            region: None,
            edges: Vec::new(),
            max_correction_rounds: 16,
            initial: Vec::new(),
        }
    }
}




/// Selects the numerical scheme attached to each partition.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemeKind {
    Decay { rate: f64 },
}

impl Default for SchemeKind {
    fn default() -> Self {
        SchemeKind::Decay { rate: 1.0 }
    }
}




/// Complete run configuration, passed explicitly to every partition.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    pub refine: RefineConfig,
    pub scheme: SchemeKind,
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("cannot parse '{}' for key '{}'", value, key)))
}

fn parse_list<T: FromStr>(key: &str, value: &str) -> Result<Vec<T>> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse(key, s))
        .collect()
}

impl Config {
    /// Build a configuration from key-value pairs, starting from the
    /// defaults. Lists are comma separated; `refine_region` is six numbers
    /// (lower corner then upper corner) and `refine_edges` a list of `a-b`
    /// global node pairs.
    ///
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Config::default();
        let mut decay_rate = None;

        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());

            match key {
                "t0" => config.driver.t0 = parse(key, value)?,
                "term" => config.driver.term = parse(key, value)?,
                "nstep" => config.driver.nstep = parse(key, value)?,
                "dt" => config.driver.dt = parse(key, value)?,
                "cfl" => config.driver.cfl = parse(key, value)?,
                "output_interval" => config.driver.output_interval = parse(key, value)?,
                "refine_interval" => config.driver.refine_interval = parse(key, value)?,
                "refine_criterion" => config.refine.criterion = value.parse()?,
                "refine_threshold" => config.refine.threshold = parse(key, value)?,
                "deref_threshold" => config.refine.deref_threshold = Some(parse(key, value)?),
                "max_correction_rounds" => config.refine.max_correction_rounds = parse(key, value)?,
                "initial_refinements" => config.refine.initial = parse_list(key, value)?,
                "refine_region" => {
                    let x: Vec<f64> = parse_list(key, value)?;
                    if x.len() != 6 {
                        return Err(Error::Config(format!("'{}' needs six numbers, got {}", key, x.len())));
                    }
                    config.refine.region = Some(([x[0], x[1], x[2]], [x[3], x[4], x[5]]));
                }
                "refine_edges" => {
                    config.refine.edges = value
                        .split(',')
                        .filter(|s| !s.trim().is_empty())
                        .map(|pair| match pair.split_once('-') {
                            Some((a, b)) => Ok((parse(key, a)?, parse(key, b)?)),
                            None => Err(Error::Config(format!("edge '{}' is not of the form a-b", pair))),
                        })
                        .collect::<Result<_>>()?;
                }
                "scheme" => match value.trim() {
                    "decay" => config.scheme = SchemeKind::default(),
                    other => return Err(Error::Config(format!("unknown scheme '{}'", other))),
                },
                "decay_rate" => decay_rate = Some(parse(key, value)?),
                other => return Err(Error::Config(format!("unknown key '{}'", other))),
            }
        }

        if let Some(r) = decay_rate {
            let SchemeKind::Decay { rate } = &mut config.scheme;
            *rate = r;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run can make progress with.
    ///
    pub fn validate(&self) -> Result<()> {
        let d = &self.driver;

        if !(d.dt > 0.0) {
            return Err(Error::Config(format!("dt must be positive, got {}", d.dt)));
        }
        if d.term < d.t0 {
            return Err(Error::Config(format!("term {} is before t0 {}", d.term, d.t0)));
        }
        if self.refine.max_correction_rounds == 0 {
            return Err(Error::Config("max_correction_rounds must be at least one".into()));
        }
        if d.output_interval == 0 {
            return Err(Error::Config("output_interval must be at least one".into()));
        }
        Ok(())
    }
}
