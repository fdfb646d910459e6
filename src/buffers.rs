//! Scratch buffers owned by a sorter and reused across sort calls.

use crate::config::DeviceConfiguration;
use crate::device::Device;
use crate::error::Result;
use crate::scan::ScanStrategy;

/// Scratch of the two level device scan, one word per scan block.
#[derive(Debug)]
pub struct ScanScratch<B> {
    pub partial_sums: B,
    pub ready_flags: B,
}

#[derive(Debug)]
pub struct TemporaryBuffers<B> {
    /// Count output, scanned in place into scatter offsets.
    histogram: B,
    scan: Option<ScanScratch<B>>,
}

impl<B> TemporaryBuffers<B> {
    /// Allocates the scratch `config` needs. The partial sums and ready flags
    /// exist only for the device scan.
    pub fn allocate<D>(
        device: &D,
        config: &DeviceConfiguration,
        strategy: ScanStrategy,
        queue: &D::Queue,
    ) -> Result<Self>
    where
        D: Device<Buffer = B>,
    {
        let histogram = device.create_buffer(0, "radix histogram")?;
        let scan = match strategy {
            ScanStrategy::Device => Some(ScanScratch {
                partial_sums: device.create_buffer(0, "radix partial sums")?,
                ready_flags: device.create_buffer(0, "radix ready flags")?,
            }),
            ScanStrategy::Host => None,
        };

        let mut buffers = Self { histogram, scan };
        buffers.reconfigure(device, config, queue)?;
        Ok(buffers)
    }

    /// Resizes every buffer to `config` and lowers all ready flags.
    ///
    /// Resizes are enqueued on `queue`, so they are ordered before any later
    /// phase that touches the buffers.
    pub fn reconfigure<D>(
        &mut self,
        device: &D,
        config: &DeviceConfiguration,
        queue: &D::Queue,
    ) -> Result<()>
    where
        D: Device<Buffer = B>,
    {
        device.resize(&mut self.histogram, config.histogram_len(), queue)?;

        if let Some(scan) = self.scan.as_mut() {
            let blocks = config.scan_blocks as usize;
            device.resize(&mut scan.partial_sums, blocks, queue)?;
            device.resize(&mut scan.ready_flags, blocks, queue)?;
            device.fill(&scan.ready_flags, 0, queue)?;
        }

        Ok(())
    }

    pub fn histogram(&self) -> &B {
        &self.histogram
    }

    pub fn scan_scratch(&self) -> Option<&ScanScratch<B>> {
        self.scan.as_ref()
    }
}
