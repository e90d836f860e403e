// pipeline/meanshift.rs — Mean-shift: device phases around a host pass.
//
//   upload input, peaks = UNSET
//   meanshift_seed     (positions <- input)
//   meanshift_optimize (peaks     <- input, positions)
//   readback peaks → consolidate on the host
//   upload keys, palette
//   meanshift_color    (output    <- peaks, keys, palette)
//   readback output

use tracing::debug;

use crate::backend::ComputeBackend;
use crate::buffers::{BufferKind, BufferSpec};
use crate::config::MeanShiftConfig;
use crate::consolidate::consolidate;
use crate::dispatch::{Arg, Extent, Kernel};
use crate::error::Result;
use crate::image::RgbaImage;
use crate::meanshift::{MeanShiftParams, UNSET_PEAK};
use crate::pipeline::{dimensions, Algorithm, Detail, Segmentation, Session};

#[derive(Debug, Clone)]
pub struct MeanShift {
    config: MeanShiftConfig,
}

impl MeanShift {
    pub fn new(config: MeanShiftConfig) -> Self {
        MeanShift { config }
    }
}

impl Segmentation for MeanShift {
    fn algorithm(&self) -> Algorithm {
        Algorithm::MeanShift
    }

    fn run<B: ComputeBackend + ?Sized>(
        &self,
        s: &mut Session<'_, B>,
        image: &RgbaImage,
    ) -> Result<(RgbaImage, Detail)> {
        let (w, h) = dimensions(image)?;
        let n = image.pixel_count();

        let input = s.allocate(BufferSpec::new("input", BufferKind::Input, image.packed_byte_size()))?;
        let positions = s.allocate(BufferSpec::new("positions", BufferKind::Scratch, n as u64 * 8))?;
        let peaks = s.allocate(BufferSpec::new("peaks", BufferKind::Scratch, n as u64 * 4))?;
        let output = s.allocate(BufferSpec::new("output", BufferKind::Output, image.packed_byte_size()))?;

        s.upload(input, &image.to_packed_bytes())?;
        s.upload_words(peaks, &vec![UNSET_PEAK; n])?;

        let base = MeanShiftParams::new(w, h, &self.config);
        let work = Extent::new(w, h);
        s.dispatch(
            Kernel::MeanShiftSeed,
            vec![Arg::Buffer(input), Arg::Buffer(positions), Arg::params(&base)],
            work,
        )?;
        s.dispatch(
            Kernel::MeanShiftOptimize,
            vec![
                Arg::Buffer(input),
                Arg::Buffer(positions),
                Arg::Buffer(peaks),
                Arg::params(&base),
            ],
            work,
        )?;

        let ids = s.download_words(peaks)?;
        let consolidation = consolidate(&ids)?;
        let table = &consolidation.table;
        debug!(unique_peaks = table.len(), "peaks consolidated");

        let keys = s.allocate(BufferSpec::new("keys", BufferKind::Table, table.byte_size()))?;
        let palette = s.allocate(BufferSpec::new("palette", BufferKind::Table, table.byte_size()))?;
        s.upload_words(keys, table.keys())?;
        s.upload_words(palette, table.palette())?;

        let color = base.with_peak_count(table.len() as u32);
        s.dispatch(
            Kernel::MeanShiftColor,
            vec![
                Arg::Buffer(peaks),
                Arg::Buffer(keys),
                Arg::Buffer(palette),
                Arg::Buffer(output),
                Arg::params(&color),
            ],
            work,
        )?;

        let out = s.download_words(output)?;
        let result = RgbaImage::from_words(image.width(), image.height(), &out)?;
        Ok((
            result,
            Detail::MeanShift {
                unique_peaks: consolidation.unique.len(),
            },
        ))
    }
}
