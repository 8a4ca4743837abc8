//! Core Image render context.
//!
//! Runs the photo effects as the system `CIPhotoEffect*` filters and renders
//! into IOSurface-backed buffers from a [`CoreVideoPool`]. Color management
//! is off at both ends, so frames keep the decoder's encoding.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;

use objc2::rc::Retained;
use objc2::runtime::{AnyObject, ProtocolObject};
use objc2::{ClassType, msg_send};
use objc2_core_image::{CIContext, CIFilter, CIImage};
use objc2_foundation::{NSCopying, NSDictionary, NSMutableDictionary, NSNull, NSString};

use crate::buffer::{BufferAttributes, PixelBuffer};
use crate::error::Error;
use crate::filter::{FilterDescriptor, FilterKind, GpuContext};
use crate::platform::apple::buffer::CoreVideoBuffer;
use crate::platform::apple::catch_objc;
use crate::platform::apple::pool::CoreVideoPool;
use crate::types::PixelFormat;

#[link(name = "CoreImage", kind = "framework")]
unsafe extern "C" {
    static kCIContextWorkingColorSpace: &'static NSString;
    static kCIContextOutputColorSpace: &'static NSString;
    static kCIImageColorSpace: &'static NSString;
    static kCIInputImageKey: &'static NSString;
}

fn photo_effect_name(kind: FilterKind) -> Option<&'static str> {
    match kind {
        FilterKind::None => None,
        FilterKind::Mono => Some("CIPhotoEffectMono"),
        FilterKind::Tonal => Some("CIPhotoEffectTonal"),
        FilterKind::Noir => Some("CIPhotoEffectNoir"),
        FilterKind::Fade => Some("CIPhotoEffectFade"),
        FilterKind::Chrome => Some("CIPhotoEffectChrome"),
        FilterKind::Process => Some("CIPhotoEffectProcess"),
        FilterKind::Transfer => Some("CIPhotoEffectTransfer"),
        FilterKind::Instant => Some("CIPhotoEffectInstant"),
    }
}

/// An options dictionary mapping each of `keys` to `NSNull`, which Core Image
/// reads as "no color space".
fn without_color_management(keys: &[&NSString]) -> Retained<NSDictionary<NSString, AnyObject>> {
    let dict: Retained<NSMutableDictionary<NSString, AnyObject>> = NSMutableDictionary::new();
    let null: &AnyObject = &NSNull::null();
    for key in keys {
        let key: &ProtocolObject<dyn NSCopying> = ProtocolObject::from_ref(*key);
        unsafe { dict.setObject_forKey(null, key) };
    }
    Retained::into_super(dict)
}

/// Draws through a shared `CIContext`.
pub struct CoreImageContext {
    context: Retained<CIContext>,
}

// SAFETY: CIContext is documented as safe to use from any thread.
unsafe impl Send for CoreImageContext {}

impl CoreImageContext {
    pub fn new() -> Result<Self, Error> {
        let options = unsafe {
            without_color_management(&[kCIContextWorkingColorSpace, kCIContextOutputColorSpace])
        };
        let options: &NSDictionary<NSString, AnyObject> = &options;
        let context: Option<Retained<CIContext>> = catch_objc(AssertUnwindSafe(|| unsafe {
            msg_send![CIContext::class(), contextWithOptions: options]
        }))?;
        let context = context.ok_or(Error::ContextUnavailable)?;
        tracing::debug!("core image context created");
        Ok(CoreImageContext { context })
    }
}

/// Image import options. Core Image keeps its own texture caches, so this
/// is all a "cache" amounts to here.
pub struct ImageImport {
    options: Retained<NSDictionary<NSString, AnyObject>>,
    imported: u64,
}

// SAFETY: the dictionary is immutable after creation.
unsafe impl Send for ImageImport {}

impl ImageImport {
    /// Images created through this cache so far.
    pub fn imported(&self) -> u64 {
        self.imported
    }
}

/// A compiled photo effect. `None` draws the input unchanged.
pub struct PhotoEffect {
    filter: Option<Retained<CIFilter>>,
}

// SAFETY: a CIFilter is not shared; only the thread holding the filter stage
// configures and reads it.
unsafe impl Send for PhotoEffect {}

/// A frame wrapped as a `CIImage`. Borrows the buffer it reads from.
pub struct SourceImage<'a> {
    image: Retained<CIImage>,
    _buffer: PhantomData<&'a CoreVideoBuffer>,
}

/// A destination buffer Core Image renders into.
pub struct TargetBuffer<'a> {
    buffer: &'a mut CoreVideoBuffer,
}

impl GpuContext for CoreImageContext {
    type Buffer = CoreVideoBuffer;
    type Pool = CoreVideoPool;
    type TextureCache = ImageImport;
    type Program = PhotoEffect;
    type Texture<'a> = SourceImage<'a>;
    type RenderTarget<'a> = TargetBuffer<'a>;

    fn create_texture_cache(&mut self) -> Result<ImageImport, Error> {
        let options = unsafe { without_color_management(&[kCIImageColorSpace]) };
        Ok(ImageImport {
            options,
            imported: 0,
        })
    }

    fn create_program(&mut self, filter: &FilterDescriptor) -> Result<PhotoEffect, Error> {
        let unknown = || Error::ProgramCreation(filter.name().to_owned());
        let kind = filter.kind().ok_or_else(unknown)?;
        let Some(name) = photo_effect_name(kind) else {
            return Ok(PhotoEffect { filter: None });
        };
        let name = NSString::from_str(name);
        let created: Option<Retained<CIFilter>> = catch_objc(AssertUnwindSafe(|| unsafe {
            msg_send![CIFilter::class(), filterWithName: &*name]
        }))?;
        let filter = created.ok_or_else(unknown)?;
        Ok(PhotoEffect {
            filter: Some(filter),
        })
    }

    fn create_buffer_pool(
        &mut self,
        attributes: BufferAttributes,
        max_buffer_count: usize,
    ) -> Result<CoreVideoPool, Error> {
        CoreVideoPool::new(attributes, max_buffer_count)
    }

    fn texture_from_buffer<'a>(
        &self,
        cache: &mut ImageImport,
        buffer: &'a CoreVideoBuffer,
    ) -> Result<SourceImage<'a>, Error> {
        if buffer.pixel_format() != PixelFormat::Bgra32 {
            return Err(Error::TextureBinding);
        }
        let pixels = buffer.as_cv();
        let options: &NSDictionary<NSString, AnyObject> = &cache.options;
        let image: Option<Retained<CIImage>> = catch_objc(AssertUnwindSafe(|| unsafe {
            msg_send![CIImage::class(), imageWithCVPixelBuffer: pixels, options: options]
        }))?;
        let image = image.ok_or(Error::TextureBinding)?;
        cache.imported += 1;
        Ok(SourceImage {
            image,
            _buffer: PhantomData,
        })
    }

    fn render_target_from_buffer<'a>(
        &self,
        _cache: &mut ImageImport,
        buffer: &'a mut CoreVideoBuffer,
    ) -> Result<TargetBuffer<'a>, Error> {
        if buffer.pixel_format() != PixelFormat::Bgra32 {
            return Err(Error::TextureBinding);
        }
        Ok(TargetBuffer { buffer })
    }

    fn draw(
        &mut self,
        program: &PhotoEffect,
        source: &SourceImage<'_>,
        target: &mut TargetBuffer<'_>,
    ) -> Result<(), Error> {
        let context = &self.context;
        let destination = target.buffer.as_cv();
        catch_objc(AssertUnwindSafe(|| unsafe {
            let output: Option<Retained<CIImage>> = match &program.filter {
                Some(filter) => {
                    let input: &CIImage = &source.image;
                    let _: () = msg_send![&**filter, setValue: input, forKey: kCIInputImageKey];
                    let output: Option<Retained<CIImage>> = msg_send![&**filter, outputImage];
                    // Drop the filter's hold on the source frame.
                    let _: () = msg_send![
                        &**filter,
                        setValue: Option::<&AnyObject>::None,
                        forKey: kCIInputImageKey
                    ];
                    output
                }
                None => Some(source.image.clone()),
            };
            let Some(output) = output else {
                return Err(Error::TextureBinding);
            };
            let _: () = msg_send![&**context, render: &*output, toCVPixelBuffer: destination];
            Ok(())
        }))?
    }

    // Rendering into a pixel buffer returns once the pixels are written.
    fn flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use objc2_core_image::CIColor;

    use super::*;
    use crate::buffer::{BufferPool, FormatDescription};
    use crate::filter::{FilterOutput, FilterStage};
    use crate::types::Size;

    const SIZE: Size = Size::new(16, 16);

    /// A buffer filled with one opaque color through the same context.
    fn solid(context: &CoreImageContext, pool: &CoreVideoPool, rgb: [f64; 3]) -> CoreVideoBuffer {
        let buffer = pool.acquire().unwrap();
        unsafe {
            let color: Retained<CIColor> =
                msg_send![CIColor::class(), colorWithRed: rgb[0], green: rgb[1], blue: rgb[2]];
            let image: Retained<CIImage> = msg_send![CIImage::class(), imageWithColor: &*color];
            let _: () =
                msg_send![&*context.context, render: &*image, toCVPixelBuffer: buffer.as_cv()];
        }
        buffer
    }

    fn first_pixel(buffer: &CoreVideoBuffer) -> [u8; 4] {
        let pixels = buffer.lock().unwrap();
        let plane = pixels.plane(0).unwrap();
        [plane.data[0], plane.data[1], plane.data[2], plane.data[3]]
    }

    fn source_pool() -> CoreVideoPool {
        let attributes = BufferAttributes {
            size: SIZE,
            pixel_format: PixelFormat::Bgra32,
        };
        CoreVideoPool::new(attributes, 2).unwrap()
    }

    #[test]
    fn every_effect_exists() {
        let mut context = CoreImageContext::new().unwrap();
        for kind in FilterKind::ALL {
            let program = context
                .create_program(&FilterDescriptor::from_kind(kind))
                .unwrap();
            assert_eq!(program.filter.is_some(), kind != FilterKind::None, "{kind:?}");
        }
        assert!(matches!(
            context.create_program(&FilterDescriptor::named("sparkle")),
            Err(Error::ProgramCreation(_))
        ));
    }

    #[test]
    fn mono_renders_gray_into_a_pool_buffer() {
        let context = CoreImageContext::new().unwrap();
        let pool = source_pool();
        let source = solid(&context, &pool, [0.8, 0.2, 0.4]);
        let [b, g, r, _] = first_pixel(&source);
        assert!(r > g && r > b, "source is not reddish: {r} {g} {b}");

        let mut stage = FilterStage::new(context);
        stage.set_filter(Some(FilterDescriptor::from_kind(FilterKind::Mono)));
        stage
            .prepare(&FormatDescription::new(SIZE, PixelFormat::Bgra32), 2)
            .unwrap();
        let FilterOutput::Filtered(filtered) = stage.render(source).unwrap() else {
            panic!("mono did not render");
        };
        let [b, g, r, a] = first_pixel(&filtered);
        assert!(r.abs_diff(g) <= 2 && g.abs_diff(b) <= 2, "not gray: {r} {g} {b}");
        assert_eq!(a, 255);
    }

    #[test]
    fn identity_program_copies_the_frame() {
        let mut context = CoreImageContext::new().unwrap();
        let pool = source_pool();
        let source = solid(&context, &pool, [0.0, 1.0, 0.0]);
        let mut destination = pool.acquire().unwrap();

        let program = context
            .create_program(&FilterDescriptor::from_kind(FilterKind::None))
            .unwrap();
        let mut cache = context.create_texture_cache().unwrap();
        let image = context.texture_from_buffer(&mut cache, &source).unwrap();
        let mut target = context
            .render_target_from_buffer(&mut cache, &mut destination)
            .unwrap();
        context.draw(&program, &image, &mut target).unwrap();
        drop(image);

        assert_eq!(cache.imported(), 1);
        assert_eq!(first_pixel(&destination), first_pixel(&source));
    }
}
