use darray::benchmarks::dot_benchmark;
use darray::distributed::{run_local_group, ProcessGroup};
use darray::tensor::{DistributedArray, LocalArray, Range, Shape};
use darray::utils::config::DArrayConfig;
use darray::utils::{logging, metrics};
use darray::Result;
use tracing::info;

/// What one rank saw during the demo session.
struct SessionReport {
    rank: usize,
    owned: String,
    sum_of_squares: f32,
    corner: f32,
    gram_trace: Option<f32>,
}

fn session(config: &DArrayConfig, group: &ProcessGroup) -> Result<SessionReport> {
    let shape = Shape::new(config.array.default_extents.clone());
    let partition_dim = config.array.partition_dim;

    let mut x = DistributedArray::setup(shape.clone(), partition_dim).in_group(group);
    x.alloc()?;
    let ramp = LocalArray::from_vec(shape.clone(), (0..shape.volume()).map(|v| v as f32).collect());
    x.copy_from(&DistributedArray::from_local(ramp))?;

    // y = x^2 + 1
    let mut y = DistributedArray::setup(shape.clone(), partition_dim).in_group(group);
    y.alloc()?;
    y.square(&x)?;
    let y_view = y.view();
    y.add_scalar(&y_view, 1.0)?;
    let sum_of_squares = y.sum()? - shape.volume() as f32;

    // Every rank adds into the first element; all contributions land.
    let origin = Range::new(vec![0; shape.dims()], vec![1; shape.dims()]);
    x.accumulate(&origin, &[1.0], 1.0)?;
    x.sync()?;
    let corner = x.at(&vec![0; shape.dims()])?;

    let gram_trace = if shape.dims() == 2 {
        let cols = shape.extent(1);
        let mut gram = DistributedArray::setup(Shape::from([cols, cols]), partition_dim.map(|_| 0))
            .in_group(group);
        gram.alloc()?;
        gram.dot(&x, &x, true, false, true)?;
        let gram = gram.fetch_all()?;
        Some((0..cols).map(|i| gram.at(&[i, i])).sum())
    } else {
        None
    };

    let owned = x
        .partition()
        .map(|p| p.range().to_string())
        .unwrap_or_default();
    Ok(SessionReport {
        rank: group.rank(),
        owned,
        sum_of_squares,
        corner,
        gram_trace,
    })
}

fn main() -> Result<()> {
    logging::init_logging_from_env();
    info!("Starting darray");

    let config = match std::env::args().nth(1) {
        Some(path) => DArrayConfig::from_file_with_env(path)?,
        None => DArrayConfig::from_env(),
    };
    config.validate()?;
    info!(
        world_size = config.cluster.world_size,
        backend = %config.cluster.backend,
        extents = ?config.array.default_extents,
        partition_dim = ?config.array.partition_dim,
        "Configuration loaded"
    );

    println!("--- Demo session ---");
    let reports = run_local_group(config.cluster.world_size, |group| session(&config, &group));
    for report in reports {
        let report = report?;
        println!(
            "rank {}: owns {}, sum(x^2) = {}, x[0..] = {}, trace(x^T x) = {:?}",
            report.rank, report.owned, report.sum_of_squares, report.corner, report.gram_trace
        );
    }

    dot_benchmark::run_benchmark(&config)?;

    println!("\n--- Metrics ---");
    println!("{}", metrics::get_metrics().gather());
    Ok(())
}
