//! Systolic GEMM CLI
//!
//! Usage:
//!   systolic-gemm --size 8x4x8 --grid 2x2 --verify
//!   systolic-gemm --config grid.json --a a.json --b b.json --json
//!   systolic-gemm --size 4x4x6 --grid 2x3 --memory-width 2 --topology

use clap::{ArgAction, Parser as ClapParser, ValueEnum};
use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};
use num_traits::NumCast;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::fs;

use systolic_gemm::{
    reference_product, Add, ChannelConfig, Element, GemmConfig, GemmError, GemmResult,
    GridReport, MapOperator, Matrix, Max, Min, Multiply, ReduceOperator, SystolicGemm,
};

#[derive(ClapParser, Debug)]
#[command(name = "systolic-gemm")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Runs dense matrix products on a simulated systolic grid")]
struct Args {
    /// Load the grid configuration from a JSON file
    #[arg(short = 'c', long = "config")]
    config_file: Option<String>,

    /// Problem size (e.g., "8x4x8" for an 8x4 A and a 4x8 B)
    #[arg(long = "size", value_parser = parse_size)]
    size: Option<(usize, usize, usize)>,

    /// Processing elements along N and M
    #[arg(short = 'g', long = "grid", value_parser = parse_pair, default_value = "1x1")]
    grid: (usize, usize),

    /// Outer tiles along N and M
    #[arg(long = "outer", value_parser = parse_pair, default_value = "1x1")]
    outer: (usize, usize),

    /// Inner tiles per PE along N and M
    #[arg(long = "inner", value_parser = parse_pair, default_value = "1x1")]
    inner: (usize, usize),

    /// Pack widths along N and M (derived from the size when omitted)
    #[arg(long = "packs", value_parser = parse_pair)]
    packs: Option<(usize, usize)>,

    /// Storage pack width of the memory adapters
    #[arg(short = 'w', long = "memory-width", default_value = "1")]
    memory_width: usize,

    /// Depth of the grid pipes
    #[arg(long = "pipe-depth")]
    pipe_depth: Option<usize>,

    /// Seconds a stream may block before the run is declared stalled
    #[arg(long = "stall-timeout")]
    stall_timeout: Option<u64>,

    /// Scalar element type
    #[arg(short = 'e', long = "element", value_enum, default_value_t = ElementType::I64)]
    element: ElementType,

    /// Operator pair used for the product
    #[arg(short = 's', long = "semiring", value_enum, default_value_t = Semiring::PlusTimes)]
    semiring: Semiring,

    /// JSON file holding A (random when omitted)
    #[arg(long = "a")]
    a_file: Option<String>,

    /// JSON file holding B (random when omitted)
    #[arg(long = "b")]
    b_file: Option<String>,

    /// Seed for random operands
    #[arg(long = "seed", default_value = "0")]
    seed: u64,

    /// Check the result against a naive reference product
    #[arg(long = "verify")]
    verify: bool,

    /// Print the wired dataflow graph instead of running it
    #[arg(short = 't', long = "topology")]
    topology: bool,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output (-v for debug, -vv for per-stage tracing)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ElementType {
    F32,
    F64,
    I64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Semiring {
    /// Ordinary `(*, +)` product
    PlusTimes,
    /// `(+, max)`, longest paths
    MaxPlus,
    /// `(+, min)`, shortest paths
    MinPlus,
}

fn parse_pair(s: &str) -> Result<(usize, usize), String> {
    let dims = parse_dims(s)?;
    if dims.len() != 2 {
        return Err(format!("Expected two dimensions (e.g., 2x3): {}", s));
    }
    Ok((dims[0], dims[1]))
}

fn parse_size(s: &str) -> Result<(usize, usize, usize), String> {
    let dims = parse_dims(s)?;
    if dims.len() != 3 {
        return Err(format!("Expected NxKxM: {}", s));
    }
    Ok((dims[0], dims[1], dims[2]))
}

fn parse_dims(s: &str) -> Result<Vec<usize>, String> {
    s.split('x')
        .map(|dim| {
            dim.trim()
                .parse::<usize>()
                .map_err(|_| format!("Invalid dimension: {}", dim))
        })
        .collect()
}

/// Colored level-tagged lines on stderr
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "error".red().bold(),
            Level::Warn => "warn".yellow().bold(),
            Level::Info => "info".green(),
            Level::Debug => "debug".cyan(),
            Level::Trace => "trace".dimmed(),
        };
        eprintln!("[{}] {}", tag, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = build_config(&args).unwrap_or_else(|e| {
        eprintln!("{}: {}", "Configuration error".red(), e);
        std::process::exit(1);
    });

    let result = match (args.element, args.semiring) {
        (ElementType::F32, Semiring::PlusTimes) => run::<f32, Multiply, Add>(&args, config),
        (ElementType::F32, Semiring::MaxPlus) => run::<f32, Add, Max>(&args, config),
        (ElementType::F32, Semiring::MinPlus) => run::<f32, Add, Min>(&args, config),
        (ElementType::F64, Semiring::PlusTimes) => run::<f64, Multiply, Add>(&args, config),
        (ElementType::F64, Semiring::MaxPlus) => run::<f64, Add, Max>(&args, config),
        (ElementType::F64, Semiring::MinPlus) => run::<f64, Add, Min>(&args, config),
        (ElementType::I64, Semiring::PlusTimes) => run::<i64, Multiply, Add>(&args, config),
        (ElementType::I64, Semiring::MaxPlus) => run::<i64, Add, Max>(&args, config),
        (ElementType::I64, Semiring::MinPlus) => run::<i64, Add, Min>(&args, config),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}

fn build_config(args: &Args) -> GemmResult<GemmConfig> {
    let mut config = if let Some(file) = &args.config_file {
        GemmConfig::from_json(&fs::read_to_string(file)?)?
    } else {
        let (n, k, m) = args
            .size
            .ok_or_else(|| GemmError::invalid_config("either --config or --size is required"))?;
        let (pack_n, pack_m) = match args.packs {
            Some(packs) => packs,
            None => (
                derive_pack_width('N', n, &[args.outer.0, args.grid.0, args.inner.0])?,
                derive_pack_width('M', m, &[args.outer.1, args.grid.1, args.inner.1])?,
            ),
        };
        GemmConfig {
            size_n: n,
            size_k: k,
            size_m: m,
            outer_tiles_n: args.outer.0,
            outer_tiles_m: args.outer.1,
            grid_rows: args.grid.0,
            grid_cols: args.grid.1,
            inner_tiles_n: args.inner.0,
            inner_tiles_m: args.inner.1,
            pack_width_n: pack_n,
            pack_width_m: pack_m,
            memory_width: args.memory_width,
            channels: ChannelConfig::default(),
        }
    };

    if args.pipe_depth.is_some() {
        config.channels.pipe_depth = args.pipe_depth;
    }
    if let Some(secs) = args.stall_timeout {
        let millis = secs.checked_mul(1000).ok_or_else(|| {
            GemmError::invalid_config(format!("stall timeout of {}s is too long", secs))
        })?;
        config.channels.stall_timeout_ms = Some(millis);
    }
    Ok(config)
}

fn derive_pack_width(axis: char, size: usize, factors: &[usize]) -> GemmResult<usize> {
    let blocks = factors
        .iter()
        .try_fold(1usize, |acc, &factor| acc.checked_mul(factor))
        .unwrap_or(0);
    if blocks == 0 || size % blocks != 0 {
        return Err(GemmError::invalid_config(format!(
            "{} = {} is not divisible into {} blocks, pass --packs explicitly",
            axis, size, blocks
        )));
    }
    Ok(size / blocks)
}

/// Returns `false` when verification found mismatches.
fn run<T, M, R>(args: &Args, config: GemmConfig) -> GemmResult<bool>
where
    T: Element + NumCast + Display + Serialize + DeserializeOwned,
    M: MapOperator<T>,
    R: ReduceOperator<T>,
{
    let gemm = SystolicGemm::<T, M, R>::new(config)?;

    if args.topology {
        let topology = gemm.topology()?;
        if args.json_output {
            println!("{}", topology.to_json()?);
        } else {
            print!("{}", topology);
        }
        return Ok(true);
    }

    let plan = *gemm.plan();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let a = load_operand::<T>(args.a_file.as_deref(), plan.size_n, plan.size_k, &mut rng)?;
    let b = load_operand::<T>(args.b_file.as_deref(), plan.size_k, plan.size_m, &mut rng)?;
    if a.shape() != (plan.size_n, plan.size_k) {
        return Err(GemmError::shape("A", plan.size_n * plan.size_k, a.data().len()));
    }
    if b.shape() != (plan.size_k, plan.size_m) {
        return Err(GemmError::shape("B", plan.size_k * plan.size_m, b.data().len()));
    }

    let mut c = vec![R::identity(); plan.size_n * plan.size_m];
    let report = gemm.multiply_into(a.data(), b.data(), &mut c)?;
    let c = Matrix::new(plan.size_n, plan.size_m, c)?;

    let mismatches = if args.verify {
        let expected = reference_product::<T, M, R>(&a, &b)?;
        Some(
            c.data()
                .iter()
                .zip(expected.data())
                .filter(|(got, want)| got != want)
                .count(),
        )
    } else {
        None
    };

    if args.json_output {
        let output = serde_json::json!({
            "report": report,
            "c": c,
            "mismatches": mismatches,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_run(&report, &c, mismatches, args.verbose > 0);
    }

    Ok(mismatches.map_or(true, |count| count == 0))
}

fn load_operand<T>(
    file: Option<&str>,
    rows: usize,
    cols: usize,
    rng: &mut StdRng,
) -> GemmResult<Matrix<T>>
where
    T: Element + NumCast + DeserializeOwned,
{
    if let Some(file) = file {
        return Matrix::from_json(&fs::read_to_string(file)?);
    }
    // Small integers keep every element type exact
    let data = (0..rows * cols)
        .map(|_| {
            <T as NumCast>::from(rng.gen_range(-9i32..10)).ok_or_else(|| {
                GemmError::invalid_config("element type cannot hold the random operands")
            })
        })
        .collect::<GemmResult<Vec<T>>>()?;
    Matrix::new(rows, cols, data)
}

fn print_run<T: Element + Display>(
    report: &GridReport,
    c: &Matrix<T>,
    mismatches: Option<usize>,
    verbose: bool,
) {
    let plan = &report.plan;
    println!("{}", "Systolic GEMM".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    println!(
        "{}: {}x{} @ {}x{}",
        "Problem".cyan(),
        plan.size_n,
        plan.size_k,
        plan.size_k,
        plan.size_m
    );
    println!(
        "{}: {}x{} PEs, {}x{} outer tiles, {}x{} inner tiles",
        "Grid".cyan(),
        plan.grid_rows,
        plan.grid_cols,
        plan.outer_tiles_n,
        plan.outer_tiles_m,
        plan.inner_tiles_n,
        plan.inner_tiles_m
    );
    println!(
        "{}: {}x{} (memory {})",
        "Packs".cyan(),
        plan.pack_width_n,
        plan.pack_width_m,
        plan.memory_width
    );
    println!(
        "{}: {} stages, {} channels",
        "Graph".cyan(),
        report.stages,
        report.channels
    );
    println!("{}: {:.3} ms", "Elapsed".cyan(), report.elapsed_ms);
    println!(
        "{}: {} reduced, {} forwarded",
        "Packs moved".cyan(),
        report.packs_reduced(),
        report.packs_forwarded()
    );

    match mismatches {
        Some(0) => println!("{}: {}", "Verify".cyan(), "OK".green().bold()),
        Some(count) => println!(
            "{}: {}",
            "Verify".cyan(),
            format!("{} mismatched elements", count).red().bold()
        ),
        None => {}
    }
    println!();

    if verbose {
        println!("{}", "Processing Elements".bold().yellow());
        println!("{}", "-".repeat(50));
        for pe in &report.processing_elements {
            println!(
                "  pe[{}][{}]: {} reduced, {} drained, {} forwarded",
                pe.row, pe.col, pe.packs_reduced, pe.packs_drained, pe.packs_forwarded
            );
        }
        println!();
    }

    if verbose || (c.rows() <= 8 && c.cols() <= 8) {
        println!("{}", "Result".bold().yellow());
        println!("{}", "-".repeat(50));
        for row in 0..c.rows() {
            let cells: Vec<String> = c.row(row).iter().map(|v| format!("{:>8}", v)).collect();
            println!("  {}", cells.join(" "));
        }
    } else {
        println!("({}x{} result, use -v to print it)", c.rows(), c.cols());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["systolic-gemm"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_config_from_shape_flags() {
        let config = build_config(&args(&["--size", "8x4x6", "--grid", "2x3"])).unwrap();
        assert_eq!(config.pack_width_n, 4);
        assert_eq!(config.pack_width_m, 2);
        assert!(config.plan().is_ok());
    }

    #[test]
    fn test_rejects_oversized_flags() {
        let huge = u64::MAX.to_string();
        let err = build_config(&args(&["--size", "4x4x4", "--stall-timeout", &huge]));
        assert!(matches!(err, Err(GemmError::InvalidConfig { .. })));

        let wide = format!("{}x1", usize::MAX / 2);
        let err = build_config(&args(&["--size", "4x4x4", "--grid", &wide, "--inner", "4x1"]));
        assert!(matches!(err, Err(GemmError::InvalidConfig { .. })));
    }
}
