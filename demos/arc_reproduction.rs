//! Example: fit on three synthetic arcs, reproduce one, and generate a closed loop
//!
//! Usage:
//!   cargo run --example arc_reproduction [config.json]
//!
//! This demonstrates:
//! - Building demonstrations and endpoint frames
//! - Fitting the sequential mixture
//! - Reproducing a demonstration under its own frames
//! - Generating under new frames (start == end)
//! - Dumping the trajectory as JSON for external plotting

use std::f64::consts::PI;

use tpgmm_rs::{Demonstration, TaskParameters, TpGmm, TpGmmConfig, Vector};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => TpGmmConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => TpGmmConfig::default(),
    };
    log::info!("Config: {}", serde_json::to_string(&config)?);

    let demos: Vec<Demonstration> = [(0.0, 1.0), (0.5, 1.5), (1.0, 2.0)]
        .iter()
        .map(|&(cx, radius)| {
            let points: Vec<Vec<f64>> = (0..50)
                .map(|t| {
                    let angle = PI * (1.0 - t as f64 / 49.0);
                    vec![cx + radius * angle.cos(), radius * angle.sin()]
                })
                .collect();
            Demonstration::from_points(&points)
        })
        .collect::<tpgmm_rs::Result<_>>()?;

    let fitted = TpGmm::new(config)?.fit_from_endpoints(&demos)?;
    for diagnostic in fitted.report().diagnostics.entries() {
        log::info!("  {:?}", diagnostic);
    }

    let reproduction = fitted.reproduce(2)?;
    log::info!(
        "Reproduced demo 2 through states {:?}",
        reproduction.path.segments()
    );

    let anchor = demos[2].start();
    let params = TaskParameters::from_start_end(anchor.clone(), anchor.clone())?;
    let mut x0 = Vector::zeros(fitted.config().state_dim(2));
    x0.rows_mut(0, 2).copy_from(&anchor);
    let generated = fitted.generate(2, &params, Some(x0))?;

    let positions = generated.trajectory.positions_array();
    let rows: Vec<Vec<f64>> = positions.outer_iter().map(|r| r.to_vec()).collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);

    Ok(())
}
