use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};

use gpu_radix_sort::backend::wgpu::{create_key_value_buffers, create_sort_buffers};
use gpu_radix_sort::backend::{WgpuDevice, WgpuKernelProvider};
use gpu_radix_sort::{
    Device, Flags, KeyValueBuffers, Provisioning, RadixSort, ScanStrategy, SortOptions,
};

/// Sorts random keys on the GPU and checks them against a host sort.
#[derive(Parser, Debug)]
#[command(name = "radix_sort_demo", version)]
struct Cli {
    /// Number of keys
    #[arg(long, default_value_t = 1 << 20)]
    n: usize,
    /// Sort key-value pairs instead of keys only
    #[arg(long)]
    pairs: bool,
    /// Scan the histogram on the host
    #[arg(long)]
    host_scan: bool,
    /// Bit range [START, END) to sort by
    #[arg(long, num_args = 2, value_names = ["START", "END"], default_values_t = [0, 32])]
    bits: Vec<u32>,
    /// WGSL kernel source file
    #[arg(long)]
    kernel: Option<PathBuf>,
    /// Include directory for the kernel source
    #[arg(long)]
    include: Option<PathBuf>,
    /// Directory holding pre-built SPIR-V kernels
    #[arg(long, conflicts_with_all = ["kernel", "include"])]
    spirv: Option<PathBuf>,
    /// Multiprocessor count and threads per multiprocessor of the adapter
    #[arg(long, num_args = 2, value_names = ["COUNT", "THREADS"])]
    multiprocessors: Option<Vec<u32>>,
    /// Seed of the random keys
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Log kernel footprints and occupancy
    #[arg(long)]
    log: bool,
}

struct DemoArgs {
    n: usize,
    pairs: bool,
    start_bit: u32,
    end_bit: u32,
    seed: u64,
    multiprocessors: Option<(u32, u32)>,
    options: SortOptions,
}

impl From<Cli> for DemoArgs {
    fn from(cli: Cli) -> Self {
        let mut options = SortOptions::default();
        if cli.host_scan {
            options.scan = ScanStrategy::Host;
        }
        if cli.log {
            options.flags = Flags::LOG;
        }
        if let Some(dir) = cli.spirv {
            options.provisioning = Provisioning::PrecompiledBinary { dir: Some(dir) };
        } else if cli.kernel.is_some() || cli.include.is_some() {
            options.provisioning = Provisioning::SourceFile {
                path: cli.kernel,
                include_dir: cli.include,
            };
        }

        Self {
            n: cli.n,
            pairs: cli.pairs,
            start_bit: cli.bits[0],
            end_bit: cli.bits[1],
            seed: cli.seed,
            multiprocessors: cli.multiprocessors.map(|mp| (mp[0], mp[1])),
            options,
        }
    }
}

fn masked(key: u32, start_bit: u32, end_bit: u32) -> u32 {
    let bits = end_bit.saturating_sub(start_bit);
    let mask = if bits >= 32 { u32::MAX } else { (1 << bits) - 1 };
    key.checked_shr(start_bit).unwrap_or(0) & mask
}

async fn run(args: DemoArgs) -> gpu_radix_sort::Result<()> {
    let (device, queue) = WgpuDevice::request(wgpu::PowerPreference::HighPerformance).await?;
    let device = match args.multiprocessors {
        Some((count, threads)) => device.with_multiprocessors(count, threads),
        None => device,
    };

    let mut sorter = RadixSort::new(&device, &WgpuKernelProvider, args.options, &queue)?;
    log::info!("{:?}", sorter.configuration());

    let mut rng = StdRng::seed_from_u64(args.seed);
    let keys: Vec<u32> = (0..args.n).map(|_| rng.gen()).collect();
    let mut expected: Vec<(u32, u32)> = keys.iter().copied().zip(0..).collect();
    expected.sort_by_key(|&(key, _)| masked(key, args.start_bit, args.end_bit));

    let start = Instant::now();
    let (sorted_keys, sorted_values) = if args.pairs {
        let values: Vec<u32> = (0..args.n as u32).collect();
        let ((src_keys, src_values), (dst_keys, dst_values)) =
            create_key_value_buffers(&device, &keys, &values);
        sorter.sort_pairs(
            &device,
            KeyValueBuffers {
                keys: &src_keys,
                values: &src_values,
            },
            KeyValueBuffers {
                keys: &dst_keys,
                values: &dst_values,
            },
            args.n,
            args.start_bit,
            args.end_bit,
            &queue,
        )?;
        device.synchronize(&queue)?;
        let elapsed = start.elapsed();
        log::info!("sorted {} pairs in {:?}", args.n, elapsed);
        (
            device.read(&dst_keys, &queue)?,
            Some(device.read(&dst_values, &queue)?),
        )
    } else {
        let (src, dst) = create_sort_buffers(&device, &keys);
        sorter.sort_keys(
            &device,
            &src,
            &dst,
            args.n,
            args.start_bit,
            args.end_bit,
            &queue,
        )?;
        device.synchronize(&queue)?;
        let elapsed = start.elapsed();
        log::info!("sorted {} keys in {:?}", args.n, elapsed);
        (device.read(&dst, &queue)?, None)
    };

    let keys_ok = sorted_keys
        .iter()
        .zip(&expected)
        .all(|(key, (expected, _))| key == expected);
    let values_ok = sorted_values.map_or(true, |values| {
        values
            .iter()
            .zip(&expected)
            .all(|(value, (_, expected))| value == expected)
    });

    if keys_ok && values_ok {
        println!("OK: {} elements sorted over bits [{}, {})", args.n, args.start_bit, args.end_bit);
    } else {
        println!("MISMATCH: device result differs from the host reference");
        std::process::exit(2);
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let args = DemoArgs::from(Cli::parse());

    if let Err(err) = futures::executor::block_on(run(args)) {
        eprintln!("radix_sort_demo: {}", err);
        std::process::exit(1);
    }
}
