//! Dense GEMM pipeline driver
//!
//! Usage:
//!   densegemm --mnkl 256,256,512,1 --mma-tiler-mn 128,128
//!   densegemm --use-2cta-instrs --mma-tiler-mn 256,128 --cluster-shape-mn 2,1
//!   densegemm --ab-dtype Float16 --c-dtype Float16 --use-tma-store --json

use clap::Parser as ClapParser;
use colored::Colorize;

use dense_gemm_pipeline::{
    reference_gemm, CompiledGemm, DenseGemmKernel, ElementType, GemmConfig, HardwareConfig,
    MajorMode, ProblemDescriptor, StatsSnapshot, StoreMode, Stream, Tensor,
};

#[derive(ClapParser, Debug)]
#[command(name = "densegemm")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Runs an MxNxKxL GEMM through the simulated tiled accelerator")]
struct Args {
    /// Problem shape (e.g., "256,256,512,1")
    #[arg(long = "mnkl", default_value = "256,256,512,1", value_parser = parse_mnkl)]
    mnkl: (usize, usize, usize, usize),

    /// MMA tile shape (e.g., "128,128")
    #[arg(long = "mma-tiler-mn", default_value = "128,128", value_parser = parse_pair)]
    mma_tiler_mn: (usize, usize),

    /// Cluster shape in units (e.g., "2,1")
    #[arg(long = "cluster-shape-mn", default_value = "1,1", value_parser = parse_pair)]
    cluster_shape_mn: (usize, usize),

    /// Operand element type
    #[arg(long = "ab-dtype", default_value = "TFloat32")]
    ab_dtype: ElementType,

    /// Output element type
    #[arg(long = "c-dtype", default_value = "Float32")]
    c_dtype: ElementType,

    /// Accumulator element type
    #[arg(long = "acc-dtype", default_value = "Float32")]
    acc_dtype: ElementType,

    /// Contiguous mode of A ("k" or "m")
    #[arg(long = "a-major", default_value = "k", value_parser = ["k", "m"])]
    a_major: String,

    /// Contiguous mode of B ("k" or "n")
    #[arg(long = "b-major", default_value = "k", value_parser = ["k", "n"])]
    b_major: String,

    /// Contiguous mode of C ("n" or "m")
    #[arg(long = "c-major", default_value = "n", value_parser = ["n", "m"])]
    c_major: String,

    /// Pair units on each MMA instruction
    #[arg(long = "use-2cta-instrs")]
    use_2cta_instrs: bool,

    /// Stage output subtiles through shared memory and the store engine
    #[arg(long = "use-tma-store")]
    use_tma_store: bool,

    /// Largest accepted absolute difference from the reference
    #[arg(long = "tolerance", default_value = "0.1")]
    tolerance: f64,

    /// Launches before the measured ones
    #[arg(long = "warmup-iterations", default_value = "0")]
    warmup_iterations: usize,

    /// Measured launches
    #[arg(long = "iterations", default_value = "1")]
    iterations: usize,

    /// Skip comparing against the host reference
    #[arg(long = "skip-ref-check")]
    skip_ref_check: bool,

    /// Hardware description (JSON); defaults to the built-in 100-class device
    #[arg(long = "hardware")]
    hardware: Option<String>,

    /// Print the derived tile configuration as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn parse_ints(s: &str, count: usize) -> Result<Vec<usize>, String> {
    let values = s
        .split(',')
        .map(|x| {
            x.trim()
                .parse::<usize>()
                .map_err(|_| format!("Invalid integer: {}", x))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != count {
        return Err(format!("Expected {} comma-separated values, got {}", count, s));
    }
    Ok(values)
}

fn parse_pair(s: &str) -> Result<(usize, usize), String> {
    let v = parse_ints(s, 2)?;
    Ok((v[0], v[1]))
}

fn parse_mnkl(s: &str) -> Result<(usize, usize, usize, usize), String> {
    let v = parse_ints(s, 4)?;
    Ok((v[0], v[1], v[2], v[3]))
}

fn major(operand: char, axis: &str) -> MajorMode {
    MajorMode::from_axis(operand, axis).unwrap_or_else(|| {
        eprintln!("{}: invalid major mode '{}' for {}", "Error".red(), axis, operand);
        std::process::exit(1);
    })
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let hardware = match &args.hardware {
        Some(path) => HardwareConfig::from_json_file(path).unwrap_or_else(|e| {
            eprintln!("{}: Failed to load hardware '{}': {}", "Error".red(), path, e);
            std::process::exit(1);
        }),
        None => HardwareConfig::sm100(),
    };

    let problem = ProblemDescriptor::new(args.mnkl, args.ab_dtype, args.c_dtype).with_majors(
        major('a', &args.a_major),
        major('b', &args.b_major),
        major('c', &args.c_major),
    );
    let store_mode = if args.use_tma_store {
        StoreMode::Staged
    } else {
        StoreMode::Direct
    };
    let config = GemmConfig::new(
        args.acc_dtype,
        args.use_2cta_instrs,
        args.mma_tiler_mn,
        args.cluster_shape_mn,
        store_mode,
    );

    if args.verbose {
        print_header(&args, &hardware);
    }

    let kernel = DenseGemmKernel::new(config, hardware);
    let compiled = match kernel.compile(&problem) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Unsupported configuration".red(), e);
            std::process::exit(1);
        }
    };

    if args.json_output {
        match compiled.plan().to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    }

    let a = Tensor::random(problem.a_shape(), problem.ab_dtype, problem.a_major, 1111);
    let b = Tensor::random(problem.b_shape(), problem.ab_dtype, problem.b_major, 1112);
    let c = Tensor::zeros(problem.c_shape(), problem.c_dtype, problem.c_major);

    if let Err(e) = run(&compiled, &a, &b, &c, args.warmup_iterations + args.iterations) {
        eprintln!("{}: {}", "Launch failed".red(), e);
        std::process::exit(1);
    }

    if !args.skip_ref_check {
        let reference = reference_gemm(
            &a,
            &b,
            problem.c_dtype,
            problem.c_major,
            &dense_gemm_pipeline::epilogue::identity(),
        );
        let diff = c.max_abs_diff(&reference);
        if diff > args.tolerance {
            eprintln!(
                "{}: max abs difference {} exceeds tolerance {}",
                "Reference check failed".red(),
                diff,
                args.tolerance
            );
            std::process::exit(1);
        }
        if args.verbose {
            println!("{}: max abs difference {}", "Reference".cyan(), diff);
        }
    }

    print_stats(&compiled.stats(), args.verbose);
    println!("{}", "PASS".bold().green());
}

fn run(compiled: &CompiledGemm, a: &Tensor, b: &Tensor, c: &Tensor, launches: usize) -> dense_gemm_pipeline::GemmResult<()> {
    let stream = Stream::new();
    for _ in 0..launches {
        compiled.launch(a, b, c, &stream, None)?;
    }
    stream.synchronize()
}

fn print_header(args: &Args, hardware: &HardwareConfig) {
    println!("{}", "Running Dense GEMM test with:".bold().blue());
    println!("{}", "=".repeat(40));
    println!("{}: {:?}", "mnkl".green(), args.mnkl);
    println!(
        "{}: {}, {}: {}, {}: {}",
        "AB dtype".green(),
        args.ab_dtype,
        "C dtype".green(),
        args.c_dtype,
        "Acc dtype".green(),
        args.acc_dtype
    );
    println!(
        "{}: a: {}, b: {}, c: {}",
        "Matrix majors".green(),
        args.a_major,
        args.b_major,
        args.c_major
    );
    println!(
        "{}: {:?}, {}: {:?}",
        "Mma tiler (M, N)".green(),
        args.mma_tiler_mn,
        "Cluster shape (M, N)".green(),
        args.cluster_shape_mn
    );
    println!(
        "{}: {}, {}: {}",
        "2CTA MMA instructions".green(),
        args.use_2cta_instrs,
        "Use TMA Store".green(),
        args.use_tma_store
    );
    println!("{}: {}", "Tolerance".green(), args.tolerance);
    println!(
        "{}: {}, {}: {}",
        "Warmup iterations".green(),
        args.warmup_iterations,
        "Iterations".green(),
        args.iterations
    );
    println!("{}: {}", "Device".green(), hardware);
    println!();
}

fn print_stats(stats: &StatsSnapshot, verbose: bool) {
    println!("{}", "Pipeline Statistics".bold().green());
    println!("{}", "=".repeat(40));
    println!("{}: {}", "Tiles completed".cyan(), stats.tiles_completed);
    println!("{}: {}", "K-blocks consumed".cyan(), stats.k_blocks_consumed);
    if verbose {
        println!(
            "{}: {} landed, {} consumed",
            "Operand elements".cyan(),
            stats.operand_elems_landed,
            stats.operand_elems_consumed
        );
        println!(
            "{}: {} staged, {} stored",
            "Output subtiles".cyan(),
            stats.subtiles_staged,
            stats.subtiles_stored
        );
        println!(
            "{}: {} operand stages, {} store groups",
            "Peak in flight".cyan(),
            stats.max_operand_occupancy,
            stats.max_store_groups_in_flight
        );
    }
    println!();
}
