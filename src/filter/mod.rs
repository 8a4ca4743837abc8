//! The filter stage: one named image transform applied to one pixel buffer.
//!
//! [`FilterStage`] owns the render context's texture caches, the compiled
//! program and a destination [`BufferPool`]. It never writes to its input.

pub mod cpu;

use crate::buffer::{BufferAttributes, BufferPool, FormatDescription, PixelBuffer};
use crate::error::{Error, PoolExhausted};
use crate::types::PixelFormat;

/// Retained destination buffers when the caller has no better hint.
pub const DEFAULT_RETAINED_BUFFER_COUNT: usize = 4;

/// The photo effects a filter descriptor can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    None,
    Mono,
    Tonal,
    Noir,
    Fade,
    Chrome,
    Process,
    Transfer,
    Instant,
}

impl FilterKind {
    pub const ALL: [FilterKind; 9] = [
        FilterKind::None,
        FilterKind::Mono,
        FilterKind::Tonal,
        FilterKind::Noir,
        FilterKind::Fade,
        FilterKind::Chrome,
        FilterKind::Process,
        FilterKind::Transfer,
        FilterKind::Instant,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::None => "none",
            FilterKind::Mono => "mono",
            FilterKind::Tonal => "tonal",
            FilterKind::Noir => "noir",
            FilterKind::Fade => "fade",
            FilterKind::Chrome => "chrome",
            FilterKind::Process => "process",
            FilterKind::Transfer => "transfer",
            FilterKind::Instant => "instant",
        }
    }

    /// Case-insensitive lookup by short name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

/// A named transform and whether it is switched on. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterDescriptor {
    name: String,
    enabled: bool,
}

impl FilterDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        FilterDescriptor {
            name: name.into(),
            enabled: true,
        }
    }

    pub fn from_kind(kind: FilterKind) -> Self {
        Self::named(kind.name())
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        FilterDescriptor { enabled, ..self }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The program this descriptor maps to, if the name is known.
    pub fn kind(&self) -> Option<FilterKind> {
        FilterKind::from_name(&self.name)
    }
}

/// GPU access the filter stage needs: texture caches, programs, a buffer
/// pool for render targets, and a draw call.
///
/// Textures and render targets borrow the pixel buffer they were made from,
/// so a texture can never outlive its buffer.
pub trait GpuContext: Send {
    type Buffer: PixelBuffer;
    type Pool: BufferPool<Buffer = Self::Buffer>;
    type TextureCache: Send;
    type Program: Send;
    type Texture<'a>;
    type RenderTarget<'a>;

    fn create_texture_cache(&mut self) -> Result<Self::TextureCache, Error>;

    fn create_program(&mut self, filter: &FilterDescriptor) -> Result<Self::Program, Error>;

    fn create_buffer_pool(
        &mut self,
        attributes: BufferAttributes,
        max_buffer_count: usize,
    ) -> Result<Self::Pool, Error>;

    fn texture_from_buffer<'a>(
        &self,
        cache: &mut Self::TextureCache,
        buffer: &'a Self::Buffer,
    ) -> Result<Self::Texture<'a>, Error>;

    fn render_target_from_buffer<'a>(
        &self,
        cache: &mut Self::TextureCache,
        buffer: &'a mut Self::Buffer,
    ) -> Result<Self::RenderTarget<'a>, Error>;

    fn draw(
        &mut self,
        program: &Self::Program,
        source: &Self::Texture<'_>,
        target: &mut Self::RenderTarget<'_>,
    ) -> Result<(), Error>;

    /// Submit outstanding work so consumers of the target see finished pixels.
    fn flush(&mut self);
}

/// What [`FilterStage::render`] did with a frame.
#[derive(Debug)]
pub enum FilterOutput<B> {
    /// A freshly rendered destination buffer.
    Filtered(B),
    /// The untouched source; the filter is off or a binding step failed.
    Bypassed(B),
    /// The destination pool is exhausted and the frame must be skipped.
    Dropped,
}

impl<B> FilterOutput<B> {
    pub fn into_buffer(self) -> Option<B> {
        match self {
            FilterOutput::Filtered(b) | FilterOutput::Bypassed(b) => Some(b),
            FilterOutput::Dropped => None,
        }
    }
}

struct Prepared<C: GpuContext> {
    texture_cache: C::TextureCache,
    render_texture_cache: C::TextureCache,
    program: C::Program,
    pool: C::Pool,
    output_format: FormatDescription,
}

enum DrawFailure {
    Exhausted,
    Binding(Error),
}

impl From<PoolExhausted> for DrawFailure {
    fn from(_: PoolExhausted) -> Self {
        DrawFailure::Exhausted
    }
}

impl From<Error> for DrawFailure {
    fn from(e: Error) -> Self {
        DrawFailure::Binding(e)
    }
}

/// Applies one [`FilterDescriptor`] to BGRA buffers of a fixed size.
pub struct FilterStage<C: GpuContext> {
    context: C,
    filter: Option<FilterDescriptor>,
    prepared: Option<Prepared<C>>,
}

impl<C: GpuContext> FilterStage<C> {
    pub fn new(context: C) -> Self {
        FilterStage {
            context,
            filter: None,
            prepared: None,
        }
    }

    /// The only pixel format `render` accepts.
    pub fn input_pixel_format(&self) -> PixelFormat {
        PixelFormat::Bgra32
    }

    pub fn filter(&self) -> Option<&FilterDescriptor> {
        self.filter.as_ref()
    }

    /// Swap the transform. Takes effect at the next `prepare`.
    pub fn set_filter(&mut self, filter: Option<FilterDescriptor>) {
        if self.filter != filter {
            self.reset();
        }
        self.filter = filter;
    }

    /// Whether frames will actually be transformed.
    pub fn is_active(&self) -> bool {
        self.filter.as_ref().is_some_and(FilterDescriptor::is_enabled)
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    pub fn output_format(&self) -> Option<FormatDescription> {
        self.prepared.as_ref().map(|p| p.output_format)
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// (Re)build caches, program and destination pool for `input`.
    ///
    /// Output dimensions equal input dimensions; this stage does not scale.
    /// Any failure leaves the stage unprepared and is not worth retrying.
    pub fn prepare(
        &mut self,
        input: &FormatDescription,
        retained_buffer_count_hint: usize,
    ) -> Result<(), Error> {
        self.reset();
        let Some(filter) = self.filter.clone() else {
            return Ok(());
        };
        if input.pixel_format != self.input_pixel_format() {
            return Err(Error::PixelFormatMismatch {
                expected: self.input_pixel_format(),
                actual: input.pixel_format,
            });
        }

        let texture_cache = self.context.create_texture_cache()?;
        let render_texture_cache = self.context.create_texture_cache()?;
        let program = self.context.create_program(&filter)?;
        let attributes = BufferAttributes {
            size: input.size,
            pixel_format: PixelFormat::Bgra32,
        };
        let pool = self
            .context
            .create_buffer_pool(attributes, retained_buffer_count_hint.max(1))?;

        // Derive the output description from a real buffer, as consumers will.
        let sample = pool.acquire().map_err(|_| Error::PoolCreation)?;
        let output_format = FormatDescription::of(&sample);
        pool.release(sample);

        tracing::debug!(
            filter = filter.name(),
            width = input.size.width,
            height = input.size.height,
            "filter stage prepared"
        );
        self.prepared = Some(Prepared {
            texture_cache,
            render_texture_cache,
            program,
            pool,
            output_format,
        });
        Ok(())
    }

    /// Release caches, program and pool. Safe to call repeatedly.
    pub fn reset(&mut self) {
        if self.prepared.take().is_some() {
            tracing::trace!("filter stage reset");
        }
    }

    /// Run the filter over `source`.
    ///
    /// `Err` only for configuration mistakes (wrong size or format, missing
    /// `prepare`). Binding failures bypass the filter; an exhausted
    /// destination pool drops the frame.
    pub fn render(&mut self, source: C::Buffer) -> Result<FilterOutput<C::Buffer>, Error> {
        if !self.is_active() {
            return Ok(FilterOutput::Bypassed(source));
        }
        let Some(prepared) = self.prepared.as_mut() else {
            debug_assert!(false, "FilterStage::render called before prepare");
            return Err(Error::NotPrepared);
        };

        let expected = prepared.output_format;
        if source.size() != expected.size {
            return Err(Error::DimensionMismatch {
                expected: expected.size,
                actual: source.size(),
            });
        }
        if source.pixel_format() != PixelFormat::Bgra32 {
            return Err(Error::PixelFormatMismatch {
                expected: PixelFormat::Bgra32,
                actual: source.pixel_format(),
            });
        }

        let result = Self::draw_into(&mut self.context, prepared, &source);
        self.context.flush();
        match result {
            Ok(destination) => Ok(FilterOutput::Filtered(destination)),
            Err(DrawFailure::Exhausted) => {
                tracing::debug!("destination pool is out of buffers, dropping frame");
                Ok(FilterOutput::Dropped)
            }
            Err(DrawFailure::Binding(e)) => {
                tracing::warn!(error = %e, "filter bypassed");
                Ok(FilterOutput::Bypassed(source))
            }
        }
    }

    fn draw_into(
        context: &mut C,
        prepared: &mut Prepared<C>,
        source: &C::Buffer,
    ) -> Result<C::Buffer, DrawFailure> {
        let texture = context.texture_from_buffer(&mut prepared.texture_cache, source)?;
        let mut destination = prepared.pool.acquire()?;
        {
            let mut target = context
                .render_target_from_buffer(&mut prepared.render_texture_cache, &mut destination)?;
            context.draw(&prepared.program, &texture, &mut target)?;
        }
        Ok(destination)
    }
}
