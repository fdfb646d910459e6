//! The sorter: configuration, the single pass path and the multi pass radix
//! loop.
//!
//! Keys are sorted least significant digit first, `N_RADIX` bits per pass.
//! Each pass counts digits per block, scans the histogram into scatter
//! offsets and scatters stably into the other buffer. The source and
//! destination swap roles after every pass, so the source arrays are used as
//! scratch and hold unspecified contents once a multi pass sort returns.

use crate::buffers::TemporaryBuffers;
use crate::config::{
    DeviceConfiguration, Flags, SortOptions, KEY_BITS, N_RADIX, SINGLE_PASS_THRESHOLD,
    SINGLE_SORT_WG_SIZE,
};
use crate::device::{Device, DeviceProperties, KernelArg, LaunchDims};
use crate::error::{RadixSortError, Result};
use crate::kernels::{KernelOptions, KernelProvider, KernelRegistry, KernelRole};
use crate::scan::{scan_histogram, ScanStrategy};

/// Key and value arrays sorted together.
#[derive(Debug)]
pub struct KeyValueBuffers<'a, B> {
    pub keys: &'a B,
    pub values: &'a B,
}

impl<'a, B> Clone for KeyValueBuffers<'a, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, B> Copy for KeyValueBuffers<'a, B> {}

/// Bits `[start_bit, start_bit + bits)` of a key, sorted in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitWindow {
    pub start_bit: u32,
    pub bits: u32,
}

impl DigitWindow {
    /// Live histogram bins of this pass.
    pub fn bins(&self) -> u32 {
        1 << self.bits
    }

    pub fn mask(&self) -> u32 {
        self.bins() - 1
    }
}

/// Consecutive `N_RADIX` wide windows covering `[start_bit, end_bit)`. The
/// last one is narrower when the range is not a multiple of `N_RADIX`.
pub fn digit_windows(start_bit: u32, end_bit: u32) -> impl Iterator<Item = DigitWindow> {
    (start_bit..end_bit)
        .step_by(N_RADIX as usize)
        .map(move |start_bit| DigitWindow {
            start_bit,
            bits: N_RADIX.min(end_bit - start_bit),
        })
}

/// Two buffer sets whose roles swap after every pass.
#[derive(Debug, Clone, Copy)]
pub struct PingPong<T> {
    buffers: [T; 2],
    source: usize,
}

impl<T: Copy> PingPong<T> {
    pub fn new(source: T, destination: T) -> Self {
        Self {
            buffers: [source, destination],
            source: 0,
        }
    }

    pub fn source(&self) -> T {
        self.buffers[self.source]
    }

    pub fn destination(&self) -> T {
        self.buffers[1 - self.source]
    }

    pub fn swap(&mut self) {
        self.source = 1 - self.source;
    }

    /// Whether the last completed pass wrote into the caller's destination.
    pub fn result_in_destination(&self) -> bool {
        self.source == 1
    }
}

/// Keys and, for key-value sorts, values on one side of a pass.
#[derive(Debug)]
struct Arrays<'a, B> {
    keys: &'a B,
    values: Option<&'a B>,
}

impl<'a, B> Clone for Arrays<'a, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, B> Copy for Arrays<'a, B> {}

/// GPU radix sorter for `u32` keys, optionally carrying `u32` values.
///
/// Geometry, kernels and scratch buffers are set up once by [`RadixSort::new`]
/// and reused by every sort call. Sorts take `&mut self`: one instance cannot
/// serve two queues at once.
pub struct RadixSort<D: Device> {
    options: SortOptions,
    properties: DeviceProperties,
    config: DeviceConfiguration,
    kernels: KernelRegistry<D::Kernel>,
    buffers: TemporaryBuffers<D::Buffer>,
}

impl<D: Device> RadixSort<D> {
    pub fn new<P>(device: &D, provider: &P, options: SortOptions, queue: &D::Queue) -> Result<Self>
    where
        P: KernelProvider<D>,
    {
        let (properties, config, kernels) = resolve(device, provider, &options)?;
        let buffers = TemporaryBuffers::allocate(device, &config, options.scan, queue)?;

        Ok(Self {
            options,
            properties,
            config,
            kernels,
            buffers,
        })
    }

    /// Probes the device again, re-resolves every kernel and resizes the
    /// scratch buffers. Must not overlap a sort in flight on `queue`.
    pub fn configure<P>(&mut self, device: &D, provider: &P, queue: &D::Queue) -> Result<()>
    where
        P: KernelProvider<D>,
    {
        let (properties, config, kernels) = resolve(device, provider, &self.options)?;
        self.buffers.reconfigure(device, &config, queue)?;

        self.properties = properties;
        self.config = config;
        self.kernels = kernels;
        Ok(())
    }

    /// Takes effect at the next [`RadixSort::configure`].
    pub fn set_flags(&mut self, flags: Flags) {
        self.options.flags = flags;
    }

    pub fn options(&self) -> &SortOptions {
        &self.options
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    pub fn configuration(&self) -> &DeviceConfiguration {
        &self.config
    }

    pub fn temporary_buffers(&self) -> &TemporaryBuffers<D::Buffer> {
        &self.buffers
    }

    /// Sorts the first `n` keys of `src` by bits `[start_bit, end_bit)` into
    /// `dst`. The sort is stable; bits outside the range do not affect order.
    #[allow(clippy::too_many_arguments)]
    pub fn sort_keys(
        &mut self,
        device: &D,
        src: &D::Buffer,
        dst: &D::Buffer,
        n: usize,
        start_bit: u32,
        end_bit: u32,
        queue: &D::Queue,
    ) -> Result<()> {
        let src = Arrays {
            keys: src,
            values: None,
        };
        let dst = Arrays {
            keys: dst,
            values: None,
        };
        self.sort(device, src, dst, n, start_bit, end_bit, queue)
    }

    /// Like [`RadixSort::sort_keys`], moving each value with its key.
    #[allow(clippy::too_many_arguments)]
    pub fn sort_pairs(
        &mut self,
        device: &D,
        src: KeyValueBuffers<'_, D::Buffer>,
        dst: KeyValueBuffers<'_, D::Buffer>,
        n: usize,
        start_bit: u32,
        end_bit: u32,
        queue: &D::Queue,
    ) -> Result<()> {
        let src = Arrays {
            keys: src.keys,
            values: Some(src.values),
        };
        let dst = Arrays {
            keys: dst.keys,
            values: Some(dst.values),
        };
        self.sort(device, src, dst, n, start_bit, end_bit, queue)
    }

    #[allow(clippy::too_many_arguments)]
    fn sort(
        &mut self,
        device: &D,
        src: Arrays<'_, D::Buffer>,
        dst: Arrays<'_, D::Buffer>,
        n: usize,
        start_bit: u32,
        end_bit: u32,
        queue: &D::Queue,
    ) -> Result<()> {
        check_bit_range(start_bit, end_bit)?;
        check_capacity(device, src, ["source keys", "source values"], n)?;
        check_capacity(device, dst, ["destination keys", "destination values"], n)?;
        let n = u32::try_from(n).map_err(|_| RadixSortError::CapacityExceeded {
            what: "u32 index space",
            requested: n,
            capacity: u32::MAX as usize,
        })?;

        if (n as usize) < SINGLE_PASS_THRESHOLD {
            return self.sort_single_pass(device, src, dst, n, start_bit, end_bit, queue);
        }
        if self.options.scan == ScanStrategy::Device && n > device.max_scan_total() {
            return Err(RadixSortError::CapacityExceeded {
                what: "device scan total",
                requested: n as usize,
                capacity: device.max_scan_total() as usize,
            });
        }

        let mut ping_pong = PingPong::new(src, dst);
        for window in digit_windows(start_bit, end_bit) {
            self.sort_one_pass(
                device,
                ping_pong.source(),
                ping_pong.destination(),
                n,
                window,
                queue,
            )?;
            ping_pong.swap();
        }

        if !ping_pong.result_in_destination() {
            device.copy(dst.keys, src.keys, n as usize, queue)?;
            if let Some((src_values, dst_values)) = src.values.zip(dst.values) {
                device.copy(dst_values, src_values, n as usize, queue)?;
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn sort_single_pass(
        &self,
        device: &D,
        src: Arrays<'_, D::Buffer>,
        dst: Arrays<'_, D::Buffer>,
        n: u32,
        start_bit: u32,
        end_bit: u32,
        queue: &D::Queue,
    ) -> Result<()> {
        let dims = LaunchDims::new(1, SINGLE_SORT_WG_SIZE);
        match src.values.zip(dst.values) {
            Some((src_values, dst_values)) => device.launch(
                self.kernels.get(KernelRole::SortSinglePassKeyValue),
                dims,
                &[
                    KernelArg::Buffer(src.keys),
                    KernelArg::Buffer(src_values),
                    KernelArg::Buffer(dst.keys),
                    KernelArg::Buffer(dst_values),
                    KernelArg::Scalar(n),
                    KernelArg::Scalar(start_bit),
                    KernelArg::Scalar(end_bit),
                ],
                queue,
            ),
            None => device.launch(
                self.kernels.get(KernelRole::SortSinglePass),
                dims,
                &[
                    KernelArg::Buffer(src.keys),
                    KernelArg::Buffer(dst.keys),
                    KernelArg::Scalar(n),
                    KernelArg::Scalar(start_bit),
                    KernelArg::Scalar(end_bit),
                ],
                queue,
            ),
        }
    }

    fn sort_one_pass(
        &self,
        device: &D,
        src: Arrays<'_, D::Buffer>,
        dst: Arrays<'_, D::Buffer>,
        n: u32,
        window: DigitWindow,
        queue: &D::Queue,
    ) -> Result<()> {
        let config = &self.config;
        let items_per_block = config.items_per_block(n);
        let histogram = self.buffers.histogram();

        log::trace!(
            "radix pass bits [{}, {}): {} keys, {} per block",
            window.start_bit,
            window.start_bit + window.bits,
            n,
            items_per_block
        );

        let pass = [
            KernelArg::Scalar(n),
            KernelArg::Scalar(items_per_block),
            KernelArg::Scalar(window.start_bit),
            KernelArg::Scalar(window.bits),
            KernelArg::Scalar(config.count_blocks),
        ];

        let mut count_args = vec![KernelArg::Buffer(src.keys), KernelArg::Buffer(histogram)];
        count_args.extend_from_slice(&pass);
        device.launch(
            self.kernels.get(KernelRole::Count),
            LaunchDims::new(config.count_blocks, config.count_threads_per_block),
            &count_args,
            queue,
        )?;

        scan_histogram(
            device,
            self.options.scan,
            config,
            &self.kernels,
            &self.buffers,
            queue,
        )?;

        let (role, mut sort_args) = match src.values.zip(dst.values) {
            Some((src_values, dst_values)) => (
                KernelRole::SortKeyValue,
                vec![
                    KernelArg::Buffer(src.keys),
                    KernelArg::Buffer(dst.keys),
                    KernelArg::Buffer(src_values),
                    KernelArg::Buffer(dst_values),
                    KernelArg::Buffer(histogram),
                ],
            ),
            None => (
                KernelRole::Sort,
                vec![
                    KernelArg::Buffer(src.keys),
                    KernelArg::Buffer(dst.keys),
                    KernelArg::Buffer(histogram),
                ],
            ),
        };
        sort_args.extend_from_slice(&pass);
        device.launch(
            self.kernels.get(role),
            LaunchDims::new(config.count_blocks, config.sort_threads_per_block),
            &sort_args,
            queue,
        )
    }
}

type Resolved<K> = (DeviceProperties, DeviceConfiguration, KernelRegistry<K>);

fn resolve<D, P>(device: &D, provider: &P, options: &SortOptions) -> Result<Resolved<D::Kernel>>
where
    D: Device,
    P: KernelProvider<D>,
{
    options.provisioning.validate()?;

    let properties = device.properties();
    let config = DeviceConfiguration::compute(&properties, options.provisioning.is_prebuilt());
    log::debug!("radix sort on {}: {:?}", properties.name, config);

    if options.flags.contains(Flags::LOG) {
        log::info!("{}", options.provisioning.describe());
        log::info!("Occupancy: {}", config.occupancy);
    }

    let kernel_options =
        KernelOptions::new(&config, &properties, &options.provisioning.include_dir());
    let kernels = KernelRegistry::build(
        device,
        provider,
        &options.provisioning,
        &kernel_options,
        options.flags,
    )?;

    Ok((properties, config, kernels))
}

fn check_bit_range(start_bit: u32, end_bit: u32) -> Result<()> {
    if start_bit > end_bit || end_bit > KEY_BITS {
        return Err(RadixSortError::InvalidBitRange {
            start_bit,
            end_bit,
            key_bits: KEY_BITS,
        });
    }
    Ok(())
}

fn check_capacity<D: Device>(
    device: &D,
    arrays: Arrays<'_, D::Buffer>,
    [keys_name, values_name]: [&'static str; 2],
    n: usize,
) -> Result<()> {
    let mut checks = vec![(keys_name, arrays.keys)];
    checks.extend(arrays.values.map(|values| (values_name, values)));

    for (what, buffer) in checks {
        let capacity = device.buffer_len(buffer);
        if capacity < n {
            return Err(RadixSortError::CapacityExceeded {
                what,
                requested: n,
                capacity,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SINGLE_SORT_N_ITEMS_PER_WI;
    use crate::emulated::{EmulatedDevice, EmulatedProvider, EmulatedQueue, QueueOp};
    use crate::kernels::Provisioning;
    use crate::scan::ScanStrategy;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const THRESHOLD: usize = SINGLE_PASS_THRESHOLD;

    fn sorter(device: &EmulatedDevice, scan: ScanStrategy) -> RadixSort<EmulatedDevice> {
        let queue = EmulatedQueue::default();
        let options = SortOptions::default().with_scan(scan);
        RadixSort::new(device, &EmulatedProvider::default(), options, &queue).unwrap()
    }

    fn random_keys(seed: u64, n: usize) -> Vec<u32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen()).collect()
    }

    /// Stable sort by bits `[start_bit, end_bit)` on the host.
    fn reference(keys: &[u32], start_bit: u32, end_bit: u32) -> Vec<u32> {
        let bits = end_bit - start_bit;
        let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
        let mut sorted = keys.to_vec();
        sorted.sort_by_key(|&key| key.checked_shr(start_bit).unwrap_or(0) & mask);
        sorted
    }

    fn sort_keys_with(
        device: &EmulatedDevice,
        scan: ScanStrategy,
        keys: &[u32],
        start_bit: u32,
        end_bit: u32,
    ) -> (Vec<u32>, Vec<QueueOp>) {
        let mut sorter = sorter(device, scan);
        let queue = EmulatedQueue::default();
        let src = device.upload(keys, "src");
        let dst = device.upload(&vec![0; keys.len()], "dst");

        sorter
            .sort_keys(device, &src, &dst, keys.len(), start_bit, end_bit, &queue)
            .unwrap();

        (dst.to_vec(), queue.ops())
    }

    fn copies(ops: &[QueueOp]) -> usize {
        ops.iter()
            .filter(|op| matches!(op, QueueOp::Copy { .. }))
            .count()
    }

    fn launches(ops: &[QueueOp], role: KernelRole) -> usize {
        ops.iter()
            .filter(|op| matches!(op, QueueOp::Launch { kernel, .. } if *kernel == role))
            .count()
    }

    #[test]
    fn test_digit_windows() {
        let windows: Vec<_> = digit_windows(0, 32).collect();
        assert_eq!(windows.len(), 4);
        assert!(windows.iter().all(|w| w.bits == 8 && w.bins() == 256));

        let windows: Vec<_> = digit_windows(4, 16).collect();
        assert_eq!(
            windows,
            vec![
                DigitWindow {
                    start_bit: 4,
                    bits: 8
                },
                DigitWindow {
                    start_bit: 12,
                    bits: 4
                },
            ]
        );
        assert_eq!(windows[1].mask(), 0xf);
        assert_eq!(digit_windows(7, 7).count(), 0);
    }

    #[test]
    fn test_ping_pong_parity() {
        let mut ping_pong = PingPong::new("src", "dst");
        assert!(!ping_pong.result_in_destination());

        ping_pong.swap();
        assert_eq!(ping_pong.source(), "dst");
        assert_eq!(ping_pong.destination(), "src");
        assert!(ping_pong.result_in_destination());

        ping_pong.swap();
        assert!(!ping_pong.result_in_destination());
    }

    #[test]
    fn test_small_pairs_example() {
        let device = EmulatedDevice::default();
        let queue = EmulatedQueue::default();
        let mut sorter = sorter(&device, ScanStrategy::Device);

        let src_keys = device.upload(&[5, 3, 5, 1, 2], "src keys");
        let src_values = device.upload(&[10, 11, 12, 13, 14], "src values");
        let dst_keys = device.upload(&[0; 5], "dst keys");
        let dst_values = device.upload(&[0; 5], "dst values");

        sorter
            .sort_pairs(
                &device,
                KeyValueBuffers {
                    keys: &src_keys,
                    values: &src_values,
                },
                KeyValueBuffers {
                    keys: &dst_keys,
                    values: &dst_values,
                },
                5,
                0,
                32,
                &queue,
            )
            .unwrap();

        assert_eq!(dst_keys.to_vec(), vec![1, 2, 3, 5, 5]);
        assert_eq!(dst_values.to_vec(), vec![13, 14, 11, 10, 12]);
        assert_eq!(
            queue.ops(),
            vec![QueueOp::Launch {
                kernel: KernelRole::SortSinglePassKeyValue,
                blocks: 1,
                threads: SINGLE_SORT_WG_SIZE
            }]
        );
    }

    #[test]
    fn test_full_range_matches_std_sort() {
        let device = EmulatedDevice::default();
        let keys = random_keys(1, 20_000);
        let mut expected = keys.clone();
        expected.sort_unstable();

        let (sorted, ops) = sort_keys_with(&device, ScanStrategy::Device, &keys, 0, 32);

        assert_eq!(sorted, expected);
        assert_eq!(launches(&ops, KernelRole::Count), 4);
        assert_eq!(launches(&ops, KernelRole::ScanParallel), 4);
        assert_eq!(launches(&ops, KernelRole::Sort), 4);
    }

    #[test]
    fn test_pairs_follow_their_keys() {
        let device = EmulatedDevice::default();
        let queue = EmulatedQueue::default();
        let mut sorter = sorter(&device, ScanStrategy::Device);

        // Few distinct keys so stability is observable.
        let mut rng = StdRng::seed_from_u64(2);
        let keys: Vec<u32> = (0..5000).map(|_| rng.gen_range(0..50) << 20).collect();
        let values: Vec<u32> = (0..keys.len() as u32).collect();

        let src_keys = device.upload(&keys, "src keys");
        let src_values = device.upload(&values, "src values");
        let dst_keys = device.upload(&vec![0; keys.len()], "dst keys");
        let dst_values = device.upload(&vec![0; keys.len()], "dst values");

        sorter
            .sort_pairs(
                &device,
                KeyValueBuffers {
                    keys: &src_keys,
                    values: &src_values,
                },
                KeyValueBuffers {
                    keys: &dst_keys,
                    values: &dst_values,
                },
                keys.len(),
                0,
                32,
                &queue,
            )
            .unwrap();

        let mut expected: Vec<(u32, u32)> = keys.iter().copied().zip(values).collect();
        expected.sort_by_key(|&(key, _)| key);
        let sorted: Vec<(u32, u32)> = dst_keys
            .to_vec()
            .into_iter()
            .zip(dst_values.to_vec())
            .collect();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_sorting_sorted_input_is_identity() {
        let device = EmulatedDevice::default();
        let mut keys = random_keys(3, 4000);
        keys.sort_unstable();

        let (sorted, _) = sort_keys_with(&device, ScanStrategy::Device, &keys, 0, 32);

        assert_eq!(sorted, keys);
    }

    #[test]
    fn test_partial_range_orders_by_masked_keys() {
        let device = EmulatedDevice::default();
        let keys = random_keys(4, 6000);

        for &(start_bit, end_bit) in &[(0, 12), (4, 20), (8, 16), (20, 32), (31, 32)] {
            let (sorted, _) =
                sort_keys_with(&device, ScanStrategy::Device, &keys, start_bit, end_bit);
            assert_eq!(
                sorted,
                reference(&keys, start_bit, end_bit),
                "[{}, {})",
                start_bit,
                end_bit
            );
        }
    }

    #[test]
    fn test_threshold_routing() {
        assert_eq!(
            THRESHOLD,
            (SINGLE_SORT_WG_SIZE * SINGLE_SORT_N_ITEMS_PER_WI) as usize
        );
        let device = EmulatedDevice::default();
        let keys = random_keys(5, THRESHOLD + 1);

        for &n in &[THRESHOLD - 1, THRESHOLD, THRESHOLD + 1] {
            let (sorted, ops) =
                sort_keys_with(&device, ScanStrategy::Device, &keys[..n], 0, 32);

            assert_eq!(sorted, reference(&keys[..n], 0, 32), "n = {}", n);
            let single = launches(&ops, KernelRole::SortSinglePass);
            if n < THRESHOLD {
                assert_eq!(single, 1);
                assert_eq!(launches(&ops, KernelRole::Count), 0);
            } else {
                assert_eq!(single, 0);
                assert_eq!(launches(&ops, KernelRole::Count), 4);
            }
        }
    }

    #[test]
    fn test_empty_input() {
        let device = EmulatedDevice::default();
        let mut sorter = sorter(&device, ScanStrategy::Device);

        let queue = EmulatedQueue::default();
        let src = device.upload(&[3, 1, 2], "src");
        let dst = device.upload(&[7, 7, 7], "dst");
        sorter
            .sort_keys(&device, &src, &dst, 0, 0, 32, &queue)
            .unwrap();
        let ops = queue.ops();
        assert_eq!(dst.to_vec(), vec![7, 7, 7]);
        assert_eq!(src.to_vec(), vec![3, 1, 2]);
        assert_eq!(launches(&ops, KernelRole::SortSinglePass), 1);
        assert_eq!(
            ops.iter()
                .filter(|op| matches!(op, QueueOp::Launch { .. }))
                .count(),
            1
        );
        assert_eq!(copies(&ops), 0);

        let queue = EmulatedQueue::default();
        let src_keys = device.upload(&[3, 1], "src keys");
        let src_values = device.upload(&[30, 10], "src values");
        let dst_keys = device.upload(&[7, 7], "dst keys");
        let dst_values = device.upload(&[8, 8], "dst values");
        sorter
            .sort_pairs(
                &device,
                KeyValueBuffers {
                    keys: &src_keys,
                    values: &src_values,
                },
                KeyValueBuffers {
                    keys: &dst_keys,
                    values: &dst_values,
                },
                0,
                0,
                32,
                &queue,
            )
            .unwrap();
        let ops = queue.ops();
        assert_eq!(dst_keys.to_vec(), vec![7, 7]);
        assert_eq!(dst_values.to_vec(), vec![8, 8]);
        assert_eq!(launches(&ops, KernelRole::SortSinglePassKeyValue), 1);
        assert_eq!(
            ops.iter()
                .filter(|op| matches!(op, QueueOp::Launch { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_empty_bit_range_copies_pairs_unchanged() {
        let device = EmulatedDevice::default();
        let mut sorter = sorter(&device, ScanStrategy::Device);
        let queue = EmulatedQueue::default();

        let keys = random_keys(12, THRESHOLD);
        let values: Vec<u32> = (0..THRESHOLD as u32).collect();
        let src_keys = device.upload(&keys, "src keys");
        let src_values = device.upload(&values, "src values");
        let dst_keys = device.upload(&vec![0; THRESHOLD], "dst keys");
        let dst_values = device.upload(&vec![0; THRESHOLD], "dst values");

        sorter
            .sort_pairs(
                &device,
                KeyValueBuffers {
                    keys: &src_keys,
                    values: &src_values,
                },
                KeyValueBuffers {
                    keys: &dst_keys,
                    values: &dst_values,
                },
                THRESHOLD,
                8,
                8,
                &queue,
            )
            .unwrap();

        let ops = queue.ops();
        assert_eq!(dst_keys.to_vec(), keys);
        assert_eq!(dst_values.to_vec(), values);
        assert_eq!(copies(&ops), 2);
        assert_eq!(launches(&ops, KernelRole::Count), 0);
        assert_eq!(launches(&ops, KernelRole::SortSinglePassKeyValue), 0);
    }

    #[test]
    fn test_host_and_device_scans_agree() {
        let device = EmulatedDevice::default();
        let keys = random_keys(6, 9000);

        let (device_sorted, device_ops) =
            sort_keys_with(&device, ScanStrategy::Device, &keys, 0, 32);
        let (host_sorted, host_ops) = sort_keys_with(&device, ScanStrategy::Host, &keys, 0, 32);

        assert_eq!(device_sorted, host_sorted);
        assert_eq!(launches(&host_ops, KernelRole::ScanParallel), 0);
        assert_eq!(launches(&device_ops, KernelRole::ScanParallel), 4);
        assert_eq!(
            host_ops
                .iter()
                .filter(|op| matches!(op, QueueOp::Read { .. }))
                .count(),
            4
        );
    }

    #[test]
    fn test_single_workgroup_scan_when_histogram_fits() {
        // 1024 thread blocks on 1 SM: 4 count blocks, 1 scan block.
        let device = EmulatedDevice::new(DeviceProperties {
            name: "Emulated".to_string(),
            max_threads_per_block: 1024,
            warp_size: 32,
            multiprocessor_count: 1,
            max_threads_per_multiprocessor: 1024,
        });
        let keys = random_keys(7, 3000);

        let (sorted, ops) = sort_keys_with(&device, ScanStrategy::Device, &keys, 0, 32);

        assert_eq!(sorted, reference(&keys, 0, 32));
        assert_eq!(launches(&ops, KernelRole::ScanSingleWorkgroup), 4);
        assert_eq!(launches(&ops, KernelRole::ScanParallel), 0);
    }

    #[test]
    fn test_copy_back_follows_pass_parity() {
        let device = EmulatedDevice::default();
        let keys = random_keys(8, 2000);

        // Four passes end in the source buffer.
        let (sorted, ops) = sort_keys_with(&device, ScanStrategy::Device, &keys, 0, 32);
        assert_eq!(sorted, reference(&keys, 0, 32));
        assert_eq!(copies(&ops), 1);

        // Three passes end in the destination.
        let (sorted, ops) = sort_keys_with(&device, ScanStrategy::Device, &keys, 0, 24);
        assert_eq!(sorted, reference(&keys, 0, 24));
        assert_eq!(copies(&ops), 0);

        // No pass at all still delivers the input.
        let (sorted, ops) = sort_keys_with(&device, ScanStrategy::Device, &keys, 9, 9);
        assert_eq!(sorted, keys);
        assert_eq!(copies(&ops), 1);
        assert_eq!(launches(&ops, KernelRole::Count), 0);
    }

    #[test]
    fn test_pairs_copy_both_arrays() {
        let device = EmulatedDevice::default();
        let queue = EmulatedQueue::default();
        let mut sorter = sorter(&device, ScanStrategy::Host);
        let keys = random_keys(9, 1600);
        let values: Vec<u32> = (0..keys.len() as u32).collect();

        let src_keys = device.upload(&keys, "src keys");
        let src_values = device.upload(&values, "src values");
        let dst_keys = device.upload(&vec![0; keys.len()], "dst keys");
        let dst_values = device.upload(&vec![0; keys.len()], "dst values");

        sorter
            .sort_pairs(
                &device,
                KeyValueBuffers {
                    keys: &src_keys,
                    values: &src_values,
                },
                KeyValueBuffers {
                    keys: &dst_keys,
                    values: &dst_values,
                },
                keys.len(),
                0,
                16,
                &queue,
            )
            .unwrap();

        let ops = queue.ops();
        assert_eq!(copies(&ops), 2);
        assert_eq!(launches(&ops, KernelRole::SortKeyValue), 2);
        let sorted_keys = dst_keys.to_vec();
        for (key, value) in sorted_keys.iter().zip(dst_values.to_vec()) {
            assert_eq!(*key, keys[value as usize]);
        }
        assert_eq!(sorted_keys, reference(&keys, 0, 16));
    }

    #[test]
    fn test_narrow_final_window() {
        let device = EmulatedDevice::default();
        let keys = random_keys(10, 3000);

        let (sorted, ops) = sort_keys_with(&device, ScanStrategy::Device, &keys, 0, 12);

        assert_eq!(sorted, reference(&keys, 0, 12));
        assert_eq!(launches(&ops, KernelRole::Sort), 2);
    }

    #[test]
    fn test_rejects_invalid_bit_range() {
        let device = EmulatedDevice::default();
        let queue = EmulatedQueue::default();
        let mut sorter = sorter(&device, ScanStrategy::Device);
        let src = device.upload(&[3, 2, 1], "src");
        let dst = device.upload(&[0; 3], "dst");

        let err = sorter
            .sort_keys(&device, &src, &dst, 3, 8, 4, &queue)
            .unwrap_err();
        assert!(matches!(err, RadixSortError::InvalidBitRange { .. }));

        let err = sorter
            .sort_keys(&device, &src, &dst, 3, 0, 33, &queue)
            .unwrap_err();
        assert!(matches!(err, RadixSortError::InvalidBitRange { end_bit: 33, .. }));
        assert!(queue.ops().is_empty());
    }

    #[test]
    fn test_rejects_short_arrays() {
        let device = EmulatedDevice::default();
        let queue = EmulatedQueue::default();
        let mut sorter = sorter(&device, ScanStrategy::Device);
        let src = device.upload(&[3, 2, 1, 0], "src");
        let dst = device.upload(&[0; 3], "dst");

        let err = sorter
            .sort_keys(&device, &src, &dst, 4, 0, 32, &queue)
            .unwrap_err();
        assert!(matches!(
            err,
            RadixSortError::CapacityExceeded {
                what: "destination keys",
                requested: 4,
                capacity: 3
            }
        ));

        let values = device.upload(&[0; 2], "values");
        let err = sorter
            .sort_pairs(
                &device,
                KeyValueBuffers {
                    keys: &src,
                    values: &values,
                },
                KeyValueBuffers {
                    keys: &src,
                    values: &src,
                },
                3,
                0,
                32,
                &queue,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RadixSortError::CapacityExceeded {
                what: "source values",
                ..
            }
        ));
        assert!(queue.ops().is_empty());
    }

    #[test]
    fn test_device_scan_total_limit() {
        let device = EmulatedDevice::default().with_max_scan_total(1999);
        let queue = EmulatedQueue::default();
        let keys = random_keys(13, 2000);
        let src = device.upload(&keys, "src");
        let dst = device.upload(&[0; 2000], "dst");

        let mut device_scan = sorter(&device, ScanStrategy::Device);
        let err = device_scan
            .sort_keys(&device, &src, &dst, 2000, 0, 32, &queue)
            .unwrap_err();
        assert!(matches!(
            err,
            RadixSortError::CapacityExceeded {
                what: "device scan total",
                requested: 2000,
                capacity: 1999
            }
        ));
        assert!(queue.ops().is_empty());

        device_scan
            .sort_keys(&device, &src, &dst, 1999, 0, 32, &queue)
            .unwrap();
        assert_eq!(dst.to_vec()[..1999], reference(&keys[..1999], 0, 32)[..]);
        queue.clear();

        let src = device.upload(&keys, "src");
        let mut host_scan = sorter(&device, ScanStrategy::Host);
        host_scan
            .sort_keys(&device, &src, &dst, 2000, 0, 32, &queue)
            .unwrap();
        assert_eq!(dst.to_vec(), reference(&keys, 0, 32));
        assert_eq!(launches(&queue.ops(), KernelRole::ScanParallel), 0);
    }

    #[test]
    fn test_reused_sorter_gives_same_result() {
        let device = EmulatedDevice::default();
        let queue = EmulatedQueue::default();
        let mut sorter = sorter(&device, ScanStrategy::Device);
        let keys = random_keys(11, 5000);

        let mut results = Vec::new();
        for _ in 0..2 {
            let src = device.upload(&keys, "src");
            let dst = device.upload(&vec![0; keys.len()], "dst");
            sorter
                .sort_keys(&device, &src, &dst, keys.len(), 0, 32, &queue)
                .unwrap();
            results.push(dst.to_vec());
        }

        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], reference(&keys, 0, 32));
    }

    #[test]
    fn test_configure_resizes_and_lowers_flags() {
        let mut device = EmulatedDevice::default();
        let provider = EmulatedProvider::default();
        let queue = EmulatedQueue::default();
        let mut sorter =
            RadixSort::new(&device, &provider, SortOptions::default(), &queue).unwrap();
        assert_eq!(sorter.configuration().count_blocks, 16);

        let keys = random_keys(12, 4000);
        let src = device.upload(&keys, "src");
        let dst = device.upload(&vec![0; keys.len()], "dst");
        sorter
            .sort_keys(&device, &src, &dst, keys.len(), 0, 32, &queue)
            .unwrap();

        device.properties_mut().multiprocessor_count = 8;
        sorter.configure(&device, &provider, &queue).unwrap();

        let config = *sorter.configuration();
        assert_eq!(config.count_blocks, 32);
        let buffers = sorter.temporary_buffers();
        assert_eq!(buffers.histogram().len(), config.histogram_len());
        let scan = buffers.scan_scratch().unwrap();
        assert_eq!(scan.ready_flags.to_vec(), vec![0; config.scan_blocks as usize]);
        assert_eq!(provider.requests().len(), 2 * KernelRole::ALL.len());

        let src = device.upload(&keys, "src");
        sorter
            .sort_keys(&device, &src, &dst, keys.len(), 0, 32, &queue)
            .unwrap();
        assert_eq!(dst.to_vec(), reference(&keys, 0, 32));
    }

    #[test]
    fn test_prebuilt_provisioning_uses_default_geometry() {
        let device = EmulatedDevice::new(DeviceProperties {
            name: "Emulated".to_string(),
            max_threads_per_block: 1024,
            warp_size: 64,
            multiprocessor_count: 2,
            max_threads_per_multiprocessor: 2048,
        });
        let provider = EmulatedProvider::default();
        let queue = EmulatedQueue::default();
        let options = SortOptions::default()
            .with_provisioning(Provisioning::EmbeddedBinary(vec![0xde, 0xad].into()));

        let sorter = RadixSort::new(&device, &provider, options, &queue).unwrap();

        let config = sorter.configuration();
        assert_eq!(config.sort_threads_per_block, 256);
        assert_eq!(config.warp_size, 32);
        assert!(provider
            .requests()
            .iter()
            .all(|request| request.method == "load_embedded_binary"));
    }

    #[test]
    fn test_provider_failure_surfaces() {
        let device = EmulatedDevice::default();
        let queue = EmulatedQueue::default();
        let provider = EmulatedProvider::failing(KernelRole::ScanParallel);

        let err = RadixSort::new(&device, &provider, SortOptions::default(), &queue)
            .err()
            .unwrap();

        assert!(matches!(err, RadixSortError::KernelLoad { ref name, .. } if name == "ParallelExclusiveScanAllWG"));
    }

    #[test]
    fn test_empty_embedded_source_rejected() {
        let device = EmulatedDevice::default();
        let queue = EmulatedQueue::default();
        let options =
            SortOptions::default().with_provisioning(Provisioning::EmbeddedSource("".into()));

        let err = RadixSort::new(&device, &EmulatedProvider::default(), options, &queue)
            .err()
            .unwrap();

        assert!(matches!(err, RadixSortError::InvalidProvisioning(_)));
    }
}
