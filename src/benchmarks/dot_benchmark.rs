use crate::distributed::run_local_group;
use crate::tensor::{DistributedArray, LocalArray, Shape};
use crate::utils::config::DArrayConfig;
use crate::utils::error::{DArrayError, Result};
use std::time::{Duration, Instant};
use tracing::info;

/// Timing of one configuration, averaged over the measured iterations.
#[derive(Debug, Clone)]
pub struct DotTiming {
    pub world_size: usize,
    pub per_iteration: Duration,
    /// Largest absolute difference from a candle matmul of the same inputs.
    pub max_error: f32,
}

fn local_dot(m: usize, k: usize, n: usize, iterations: usize) -> Result<DotTiming> {
    let mut a = LocalArray::zeros(Shape::from([m, k]));
    let mut b = LocalArray::zeros(Shape::from([k, n]));
    a.rand_uniform(-1.0, 1.0)?;
    b.rand_uniform(-1.0, 1.0)?;
    let mut c = LocalArray::zeros(Shape::from([m, n]));

    // Warmup
    c.dot(&a, &b, false, false, true)?;

    let start = Instant::now();
    for _ in 0..iterations {
        c.dot(&a, &b, false, false, true)?;
    }
    let per_iteration = start.elapsed() / iterations.max(1) as u32;

    let reference = a.to_tensor()?.matmul(&b.to_tensor()?)?;
    let max_error = max_abs_diff(&c, &LocalArray::from_tensor(&reference)?);
    Ok(DotTiming {
        world_size: 1,
        per_iteration,
        max_error,
    })
}

fn partitioned_dot(world_size: usize, m: usize, k: usize, n: usize, iterations: usize) -> Result<DotTiming> {
    let results = run_local_group(world_size, |group| -> Result<(Duration, f32)> {
        // A by rows, B by columns: every rank has to pull most of B.
        let mut a = DistributedArray::partitioned(Shape::from([m, k]), 0, &group)?;
        let mut b = DistributedArray::partitioned(Shape::from([k, n]), 1, &group)?;
        let mut c = DistributedArray::partitioned(Shape::from([m, n]), 0, &group)?;
        a.rand_uniform(-1.0, 1.0)?;
        b.rand_uniform(-1.0, 1.0)?;

        c.dot(&a, &b, false, false, true)?;
        let start = Instant::now();
        for _ in 0..iterations {
            c.dot(&a, &b, false, false, true)?;
        }
        let per_iteration = start.elapsed() / iterations.max(1) as u32;

        let (a_all, b_all) = (a.fetch_all()?, b.fetch_all()?);
        let reference = a_all.to_tensor()?.matmul(&b_all.to_tensor()?)?;
        let max_error = max_abs_diff(&c.fetch_all()?, &LocalArray::from_tensor(&reference)?);
        group.barrier()?;
        Ok((per_iteration, max_error))
    });

    let mut slowest = Duration::ZERO;
    let mut max_error = 0.0f32;
    for result in results {
        let (per_iteration, error) = result?;
        slowest = slowest.max(per_iteration);
        max_error = max_error.max(error);
    }
    Ok(DotTiming {
        world_size,
        per_iteration: slowest,
        max_error,
    })
}

fn max_abs_diff(a: &LocalArray, b: &LocalArray) -> f32 {
    a.to_vec()
        .iter()
        .zip(b.to_vec())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

pub fn run_benchmark(config: &DArrayConfig) -> Result<Vec<DotTiming>> {
    let bench = &config.bench;
    if bench.iterations == 0 {
        return Err(DArrayError::Config("bench.iterations must be positive".to_string()));
    }
    println!("\n=== Collective Dot Benchmark ===");
    println!(
        "Config: m={}, k={}, n={}, measure={} iterations",
        bench.m, bench.k, bench.n, bench.iterations
    );

    let mut timings = vec![local_dot(bench.m, bench.k, bench.n, bench.iterations)?];
    if config.cluster.world_size > 1 {
        timings.push(partitioned_dot(
            config.cluster.world_size,
            bench.m,
            bench.k,
            bench.n,
            bench.iterations,
        )?);
    }

    for timing in &timings {
        println!(
            "ranks={} : {:.2?} per dot (max error vs candle {:.2e})",
            timing.world_size, timing.per_iteration, timing.max_error
        );
        info!(
            world_size = timing.world_size,
            per_iteration_us = timing.per_iteration.as_micros() as u64,
            max_error = timing.max_error,
            "dot benchmark"
        );
    }
    Ok(timings)
}
