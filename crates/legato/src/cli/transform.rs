use crate::config::Config;
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct TransformArgs {
    /// Path to the configuration file (TOML or JSON).
    pub config: PathBuf,

    pub x: f64,
    pub y: f64,
    pub z: f64,

    /// Map machine coordinates back to user coordinates.
    #[arg(long)]
    pub inverse: bool,
}

impl TransformArgs {
    pub fn run(&self) -> Result<()> {
        super::init_tracing();

        let config = Config::from_file(&self.config)?;
        config.validate()?;

        let [x, y, z] = map_point(&config, [self.x, self.y, self.z], self.inverse)?;
        println!("{x:.6} {y:.6} {z:.6}");

        Ok(())
    }
}

/// Apply the configured skew and bed compensation to a point.
pub fn map_point(config: &Config, mut point: [f64; 3], inverse: bool) -> Result<[f64; 3]> {
    let transform = config.transform()?;
    if inverse {
        transform.inverse_transform(&mut point);
    } else {
        transform.transform(&mut point);
    }
    Ok(point)
}
