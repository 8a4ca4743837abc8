//! Heap-backed pixel buffers and the fixed-capacity pool that recycles them.
//!
//! This is the software counterpart of a `CVPixelBufferPool` created with an
//! allocation threshold: at most `max_buffer_count` buffers exist at a time,
//! and all of them are allocated up front so steady-state playback never
//! touches the allocator.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::buffer::{BufferAttributes, BufferLayout, BufferPool, PixelBuffer, Plane, PlaneMut};
use crate::error::{Error, PoolExhausted};
use crate::types::{PixelFormat, Size};

struct PoolShared {
    attributes: BufferAttributes,
    layout: BufferLayout,
    max_buffer_count: usize,
    /// Storage of released buffers, ready for reuse.
    free: Mutex<Vec<Box<[u8]>>>,
    /// Buffers currently handed out.
    outstanding: AtomicUsize,
    /// Backing allocations ever made by this pool.
    allocated: AtomicUsize,
}

impl PoolShared {
    fn recycle(&self, storage: Box<[u8]>) {
        self.free.lock().push(storage);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A pixel buffer backed by heap memory, optionally owned by a pool.
pub struct HostPixelBuffer {
    storage: Option<Box<[u8]>>,
    attributes: BufferAttributes,
    layout: BufferLayout,
    origin: Option<Arc<PoolShared>>,
}

impl HostPixelBuffer {
    /// A zeroed, unpooled buffer (what a software decoder would hand out).
    pub fn new(size: Size, pixel_format: PixelFormat) -> Result<Self, Error> {
        let attributes = BufferAttributes { size, pixel_format };
        let layout = BufferLayout::new(&attributes)?;
        Ok(HostPixelBuffer {
            storage: Some(vec![0u8; layout.total_len()].into_boxed_slice()),
            attributes,
            layout,
            origin: None,
        })
    }

    /// A BGRA buffer where every pixel has the given `[b, g, r, a]` value.
    pub fn filled_bgra(size: Size, pixel: [u8; 4]) -> Result<Self, Error> {
        let mut buffer = Self::new(size, PixelFormat::Bgra32)?;
        if let Some(plane) = buffer.plane_mut(0) {
            for chunk in plane.data.chunks_exact_mut(4) {
                chunk.copy_from_slice(&pixel);
            }
        }
        Ok(buffer)
    }

    pub fn plane_count(&self) -> usize {
        self.layout.planes().len()
    }

    pub fn plane(&self, index: usize) -> Option<Plane<'_>> {
        let layout = *self.layout.planes().get(index)?;
        let storage = self.storage.as_deref()?;
        Some(Plane {
            data: &storage[layout.offset..layout.offset + layout.len()],
            bytes_per_row: layout.bytes_per_row,
        })
    }

    pub fn plane_mut(&mut self, index: usize) -> Option<PlaneMut<'_>> {
        let layout = *self.layout.planes().get(index)?;
        let storage = self.storage.as_deref_mut()?;
        Some(PlaneMut {
            data: &mut storage[layout.offset..layout.offset + layout.len()],
            bytes_per_row: layout.bytes_per_row,
        })
    }

    /// Address of the backing storage; identifies the buffer.
    pub fn as_ptr(&self) -> *const u8 {
        self.storage
            .as_deref()
            .map_or(std::ptr::null(), |s| s.as_ptr())
    }

    pub fn is_pooled(&self) -> bool {
        self.origin.is_some()
    }
}

impl PixelBuffer for HostPixelBuffer {
    fn size(&self) -> Size {
        self.attributes.size
    }

    fn pixel_format(&self) -> PixelFormat {
        self.attributes.pixel_format
    }
}

impl fmt::Debug for HostPixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPixelBuffer")
            .field("size", &self.attributes.size)
            .field("pixel_format", &self.attributes.pixel_format)
            .field("pooled", &self.origin.is_some())
            .finish()
    }
}

impl Drop for HostPixelBuffer {
    fn drop(&mut self) {
        if let (Some(storage), Some(pool)) = (self.storage.take(), self.origin.take()) {
            pool.recycle(storage);
        }
    }
}

/// Fixed-capacity pool of [`HostPixelBuffer`]s.
///
/// Cloning is cheap and yields another handle to the same pool. The free list
/// sits behind a `parking_lot` mutex held only for a push or pop, so acquiring
/// on the render thread never waits on anything longer than that.
#[derive(Clone)]
pub struct HostBufferPool {
    shared: Arc<PoolShared>,
}

impl HostBufferPool {
    /// Create the pool and commit all `max_buffer_count` buffers immediately.
    pub fn new(attributes: BufferAttributes, max_buffer_count: usize) -> Result<Self, Error> {
        if max_buffer_count == 0 || attributes.size.is_empty() {
            return Err(Error::PoolCreation);
        }
        let layout = BufferLayout::new(&attributes)?;
        let pool = HostBufferPool {
            shared: Arc::new(PoolShared {
                attributes,
                layout,
                max_buffer_count,
                free: Mutex::new(Vec::with_capacity(max_buffer_count)),
                outstanding: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
            }),
        };
        pool.preallocate();
        Ok(pool)
    }

    /// Acquire until the threshold is hit, then release everything.
    fn preallocate(&self) {
        let mut buffers = Vec::with_capacity(self.shared.max_buffer_count);
        while let Ok(buffer) = self.acquire() {
            buffers.push(buffer);
        }
        tracing::trace!(count = buffers.len(), "preallocated pixel buffers");
        buffers.clear();
    }

    /// Buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Backing allocations made over the pool's lifetime.
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Acquire)
    }
}

impl BufferPool for HostBufferPool {
    type Buffer = HostPixelBuffer;

    fn acquire(&self) -> Result<HostPixelBuffer, PoolExhausted> {
        let shared = &self.shared;
        let reserved = shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < shared.max_buffer_count).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(PoolExhausted);
        }
        let recycled = shared.free.lock().pop();
        let storage = match recycled {
            Some(storage) => storage,
            None => {
                shared.allocated.fetch_add(1, Ordering::AcqRel);
                vec![0u8; shared.layout.total_len()].into_boxed_slice()
            }
        };
        Ok(HostPixelBuffer {
            storage: Some(storage),
            attributes: shared.attributes,
            layout: shared.layout.clone(),
            origin: Some(Arc::clone(shared)),
        })
    }

    fn attributes(&self) -> BufferAttributes {
        self.shared.attributes
    }

    fn max_buffer_count(&self) -> usize {
        self.shared.max_buffer_count
    }
}

impl fmt::Debug for HostBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBufferPool")
            .field("attributes", &self.shared.attributes)
            .field("max_buffer_count", &self.shared.max_buffer_count)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> BufferAttributes {
        BufferAttributes {
            size: Size::new(8, 4),
            pixel_format: PixelFormat::Bgra32,
        }
    }

    #[test]
    fn exhausts_after_max_buffer_count() {
        let pool = HostBufferPool::new(attrs(), 4).unwrap();
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire().expect("within capacity"));
        }
        assert_eq!(pool.acquire().unwrap_err(), PoolExhausted);
        assert_eq!(pool.outstanding(), 4);
    }

    #[test]
    fn preallocation_commits_every_buffer_up_front() {
        let pool = HostBufferPool::new(attrs(), 3).unwrap();
        assert_eq!(pool.allocated(), 3);
        assert_eq!(pool.outstanding(), 0);

        for _ in 0..10 {
            let a = pool.acquire().unwrap();
            let b = pool.acquire().unwrap();
            pool.release(a);
            drop(b);
        }
        assert_eq!(pool.allocated(), 3);
    }

    #[test]
    fn release_makes_room_again() {
        let pool = HostBufferPool::new(attrs(), 1).unwrap();
        let buffer = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        pool.release(buffer);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn buffers_may_outlive_the_pool_handle() {
        let pool = HostBufferPool::new(attrs(), 2).unwrap();
        let buffer = pool.acquire().unwrap();
        drop(pool);
        assert_eq!(buffer.size(), Size::new(8, 4));
        assert!(buffer.is_pooled());
    }

    #[test]
    fn acquire_from_another_thread() {
        let pool = HostBufferPool::new(attrs(), 2).unwrap();
        let remote = pool.clone();
        let handle = std::thread::spawn(move || {
            let buffer = remote.acquire().unwrap();
            buffer.pixel_format()
        });
        assert_eq!(handle.join().unwrap(), PixelFormat::Bgra32);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn rejects_empty_configuration() {
        assert_eq!(HostBufferPool::new(attrs(), 0).unwrap_err(), Error::PoolCreation);
        let empty = BufferAttributes {
            size: Size::new(0, 4),
            pixel_format: PixelFormat::Bgra32,
        };
        assert_eq!(HostBufferPool::new(empty, 2).unwrap_err(), Error::PoolCreation);
    }

    #[test]
    fn filled_buffer_has_uniform_pixels() {
        let buffer = HostPixelBuffer::filled_bgra(Size::new(2, 2), [1, 2, 3, 255]).unwrap();
        let plane = buffer.plane(0).unwrap();
        assert_eq!(plane.bytes_per_row, 8);
        assert_eq!(plane.data, &[1, 2, 3, 255, 1, 2, 3, 255, 1, 2, 3, 255, 1, 2, 3, 255]);
        assert!(!buffer.is_pooled());
    }
}
