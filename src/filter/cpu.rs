//! Software render context.
//!
//! Executes the named photo effects as 3x4 color matrices over packed BGRA
//! memory. Stands in for a GPU where none is available and in tests.

use crate::buffer::{BufferAttributes, PixelBuffer};
use crate::error::Error;
use crate::filter::{FilterDescriptor, FilterKind, GpuContext};
use crate::pool::{HostBufferPool, HostPixelBuffer};
use crate::types::{PixelFormat, Size};

const LUMA: [f32; 3] = [0.299, 0.587, 0.114];

/// Row-major `[r, g, b]` output rows of `[r, g, b, bias]` coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrix {
    rows: [[f32; 4]; 3],
}

impl ColorMatrix {
    pub const IDENTITY: ColorMatrix = ColorMatrix {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Interpolate between grayscale (0.0) and the original colors (1.0).
    fn saturation(s: f32) -> Self {
        let mut rows = [[0.0; 4]; 3];
        for (i, row) in rows.iter_mut().enumerate() {
            for (j, value) in row.iter_mut().take(3).enumerate() {
                let identity = if i == j { 1.0 } else { 0.0 };
                *value = (1.0 - s) * LUMA[j] + s * identity;
            }
        }
        ColorMatrix { rows }
    }

    /// Scale contrast around mid-gray.
    fn contrast(self, c: f32) -> Self {
        let mut rows = self.rows;
        for row in rows.iter_mut() {
            for value in row.iter_mut().take(3) {
                *value *= c;
            }
            row[3] = row[3] * c + 127.5 * (1.0 - c);
        }
        ColorMatrix { rows }
    }

    fn lift(self, amount: f32) -> Self {
        let mut rows = self.rows;
        for row in rows.iter_mut() {
            row[3] += amount;
        }
        ColorMatrix { rows }
    }

    /// Multiply each output channel, `[r, g, b]`.
    fn tint(self, gains: [f32; 3]) -> Self {
        let mut rows = self.rows;
        for (row, gain) in rows.iter_mut().zip(gains) {
            for value in row.iter_mut() {
                *value *= gain;
            }
        }
        ColorMatrix { rows }
    }

    pub fn for_kind(kind: FilterKind) -> Self {
        match kind {
            FilterKind::None => Self::IDENTITY,
            FilterKind::Mono => Self::saturation(0.0),
            FilterKind::Tonal => Self::saturation(0.0).contrast(0.9),
            FilterKind::Noir => Self::saturation(0.0).contrast(1.3),
            FilterKind::Fade => Self::saturation(0.7).contrast(0.85).lift(12.0),
            FilterKind::Chrome => Self::saturation(1.2).contrast(1.1),
            FilterKind::Process => Self::saturation(0.9).tint([0.92, 1.0, 1.1]),
            FilterKind::Transfer => Self::saturation(1.05).tint([1.08, 1.0, 0.9]),
            FilterKind::Instant => Self::saturation(0.85).tint([1.06, 1.0, 0.88]).lift(8.0),
        }
    }

    /// Transform one BGRA pixel in place of `dst`.
    fn apply(&self, src: &[u8], dst: &mut [u8]) {
        let (b, g, r) = (src[0] as f32, src[1] as f32, src[2] as f32);
        let channel = |row: &[f32; 4]| {
            (row[0] * r + row[1] * g + row[2] * b + row[3])
                .round()
                .clamp(0.0, 255.0) as u8
        };
        dst[2] = channel(&self.rows[0]);
        dst[1] = channel(&self.rows[1]);
        dst[0] = channel(&self.rows[2]);
        dst[3] = src[3];
    }
}

/// Counts textures made through it; holds no GPU state.
#[derive(Debug, Default)]
pub struct CpuTextureCache {
    textures: u64,
}

impl CpuTextureCache {
    pub fn textures_created(&self) -> u64 {
        self.textures
    }
}

pub struct CpuTexture<'a> {
    data: &'a [u8],
    bytes_per_row: usize,
    size: Size,
}

pub struct CpuRenderTarget<'a> {
    data: &'a mut [u8],
    bytes_per_row: usize,
    size: Size,
}

#[derive(Debug, Default)]
pub struct CpuContext {
    draws: u64,
    flushes: u64,
}

impl CpuContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draw_count(&self) -> u64 {
        self.draws
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes
    }
}

impl GpuContext for CpuContext {
    type Buffer = HostPixelBuffer;
    type Pool = HostBufferPool;
    type TextureCache = CpuTextureCache;
    type Program = ColorMatrix;
    type Texture<'a> = CpuTexture<'a>;
    type RenderTarget<'a> = CpuRenderTarget<'a>;

    fn create_texture_cache(&mut self) -> Result<CpuTextureCache, Error> {
        Ok(CpuTextureCache::default())
    }

    fn create_program(&mut self, filter: &FilterDescriptor) -> Result<ColorMatrix, Error> {
        filter
            .kind()
            .map(ColorMatrix::for_kind)
            .ok_or_else(|| Error::ProgramCreation(filter.name().to_owned()))
    }

    fn create_buffer_pool(
        &mut self,
        attributes: BufferAttributes,
        max_buffer_count: usize,
    ) -> Result<HostBufferPool, Error> {
        HostBufferPool::new(attributes, max_buffer_count)
    }

    fn texture_from_buffer<'a>(
        &self,
        cache: &mut CpuTextureCache,
        buffer: &'a HostPixelBuffer,
    ) -> Result<CpuTexture<'a>, Error> {
        if buffer.pixel_format() != PixelFormat::Bgra32 {
            return Err(Error::TextureBinding);
        }
        let plane = buffer.plane(0).ok_or(Error::TextureBinding)?;
        cache.textures += 1;
        Ok(CpuTexture {
            data: plane.data,
            bytes_per_row: plane.bytes_per_row,
            size: buffer.size(),
        })
    }

    fn render_target_from_buffer<'a>(
        &self,
        cache: &mut CpuTextureCache,
        buffer: &'a mut HostPixelBuffer,
    ) -> Result<CpuRenderTarget<'a>, Error> {
        if buffer.pixel_format() != PixelFormat::Bgra32 {
            return Err(Error::TextureBinding);
        }
        let size = buffer.size();
        let plane = buffer.plane_mut(0).ok_or(Error::TextureBinding)?;
        cache.textures += 1;
        Ok(CpuRenderTarget {
            data: plane.data,
            bytes_per_row: plane.bytes_per_row,
            size,
        })
    }

    fn draw(
        &mut self,
        program: &ColorMatrix,
        source: &CpuTexture<'_>,
        target: &mut CpuRenderTarget<'_>,
    ) -> Result<(), Error> {
        if source.size != target.size {
            return Err(Error::DimensionMismatch {
                expected: target.size,
                actual: source.size,
            });
        }
        let row_len = source.size.width as usize * 4;
        let src_rows = source.data.chunks(source.bytes_per_row);
        let dst_rows = target.data.chunks_mut(target.bytes_per_row);
        for (src_row, dst_row) in src_rows.zip(dst_rows) {
            let src_px = src_row[..row_len].chunks_exact(4);
            let dst_px = dst_row[..row_len].chunks_exact_mut(4);
            for (s, d) in src_px.zip(dst_px) {
                program.apply(s, d);
            }
        }
        self.draws += 1;
        Ok(())
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: FilterKind, pixel: [u8; 4]) -> [u8; 4] {
        let mut out = [0u8; 4];
        ColorMatrix::for_kind(kind).apply(&pixel, &mut out);
        out
    }

    #[test]
    fn identity_program_preserves_pixels() {
        assert_eq!(run(FilterKind::None, [12, 34, 56, 78]), [12, 34, 56, 78]);
    }

    #[test]
    fn mono_equalizes_channels_and_keeps_alpha() {
        let out = run(FilterKind::Mono, [0, 0, 255, 128]);
        assert_eq!(out[0], out[1]);
        assert_eq!(out[1], out[2]);
        assert_eq!(out[2], (0.299f32 * 255.0).round() as u8);
        assert_eq!(out[3], 128);
    }

    #[test]
    fn noir_pushes_contrast() {
        let dark = run(FilterKind::Noir, [40, 40, 40, 255]);
        let light = run(FilterKind::Noir, [215, 215, 215, 255]);
        assert!(dark[0] < 40);
        assert!(light[0] > 215);
    }

    #[test]
    fn every_kind_compiles() {
        let mut context = CpuContext::new();
        for kind in FilterKind::ALL {
            assert!(context.create_program(&FilterDescriptor::from_kind(kind)).is_ok());
        }
    }

    #[test]
    fn draw_fills_the_target() {
        let mut context = CpuContext::new();
        let mut cache = context.create_texture_cache().unwrap();
        let program = ColorMatrix::for_kind(FilterKind::Mono);
        let source = HostPixelBuffer::filled_bgra(Size::new(3, 2), [0, 255, 0, 255]).unwrap();
        let mut dest = HostPixelBuffer::new(Size::new(3, 2), PixelFormat::Bgra32).unwrap();
        {
            let texture = context.texture_from_buffer(&mut cache, &source).unwrap();
            let mut target = context.render_target_from_buffer(&mut cache, &mut dest).unwrap();
            context.draw(&program, &texture, &mut target).unwrap();
        }
        let expected = (0.587f32 * 255.0).round() as u8;
        for px in dest.plane(0).unwrap().data.chunks_exact(4) {
            assert_eq!(px, [expected, expected, expected, 255]);
        }
        assert_eq!(context.draw_count(), 1);
        assert_eq!(cache.textures_created(), 2);
    }

    #[test]
    fn non_bgra_buffers_cannot_become_textures() {
        let context = CpuContext::new();
        let mut cache = CpuTextureCache::default();
        let nv12 = HostPixelBuffer::new(Size::new(2, 2), PixelFormat::Nv12).unwrap();
        assert!(context.texture_from_buffer(&mut cache, &nv12).is_err());
    }
}
