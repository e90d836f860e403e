// pipeline/edge.rs — Edge detection: one linear chain.
//
//   upload input ──┬─> edge_x ──┐
//                  └─> edge_y ──┴─> edge_result ──> readback output
//
// edge_x and edge_y share only the read-only input, so neither waits on the
// other; edge_result waits on both.

use tracing::debug;

use crate::backend::ComputeBackend;
use crate::buffers::{BufferKind, BufferSpec};
use crate::dispatch::{Arg, Extent, Kernel};
use crate::error::Result;
use crate::gradient::EdgeParams;
use crate::image::RgbaImage;
use crate::pipeline::{dimensions, Algorithm, Detail, Segmentation, Session};

#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeDetection;

impl Segmentation for EdgeDetection {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Edge
    }

    fn run<B: ComputeBackend + ?Sized>(
        &self,
        s: &mut Session<'_, B>,
        image: &RgbaImage,
    ) -> Result<(RgbaImage, Detail)> {
        let (w, h) = dimensions(image)?;
        let pixels = image.pixel_count() as u64;

        let input = s.allocate(BufferSpec::new("input", BufferKind::Input, image.packed_byte_size()))?;
        let grad_x = s.allocate(BufferSpec::new("grad_x", BufferKind::Scratch, pixels * 4))?;
        let grad_y = s.allocate(BufferSpec::new("grad_y", BufferKind::Scratch, pixels * 4))?;
        let output = s.allocate(BufferSpec::new("output", BufferKind::Output, image.packed_byte_size()))?;

        s.upload(input, &image.to_packed_bytes())?;

        let params = Arg::params(&EdgeParams::new(w, h));
        let work = Extent::new(w, h);
        s.dispatch(
            Kernel::EdgeX,
            vec![Arg::Buffer(input), Arg::Buffer(grad_x), params.clone()],
            work,
        )?;
        s.dispatch(
            Kernel::EdgeY,
            vec![Arg::Buffer(input), Arg::Buffer(grad_y), params.clone()],
            work,
        )?;
        s.dispatch(
            Kernel::EdgeResult,
            vec![Arg::Buffer(grad_x), Arg::Buffer(grad_y), Arg::Buffer(output), params],
            work,
        )?;

        let words = s.download_words(output)?;
        debug!(width = w, height = h, "edge chain complete");
        let result = RgbaImage::from_words(image.width(), image.height(), &words)?;
        Ok((result, Detail::Edge))
    }
}
