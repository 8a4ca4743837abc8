//! The display link as a [`VsyncSignal`](crate::vsync::VsyncSignal).
//!
//! [`DisplayLink`] wraps `CVDisplayLink` on macOS and `CADisplayLink` on iOS.
//! Either way the registered [`TickTarget`] gets the refresh timestamp in
//! `CACurrentMediaTime` seconds and the refresh period.

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::time::HostTime;
use crate::vsync::TickTarget;

pub use imp::DisplayLink;

/// Used when the link cannot tell its period yet.
const FALLBACK_PERIOD: Duration = Duration::from_nanos(16_666_667);

/// State the refresh callback reads.
struct Shared {
    target: Mutex<Option<Weak<dyn TickTarget>>>,
    paused: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Shared {
            target: Mutex::new(None),
            paused: AtomicBool::new(true),
        }
    }

    fn fire(&self, timestamp: HostTime, period: Duration) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        // Upgrade under the lock, tick outside it.
        let target = self.target.lock().as_ref().and_then(Weak::upgrade);
        if let Some(target) = target {
            target.tick(timestamp, period);
        }
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use std::cell::Cell;
    use std::ffi::c_void;
    use std::ptr::{self, NonNull};
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::{FALLBACK_PERIOD, Shared};
    use crate::error::Error;
    use crate::platform::apple::{check_status, host_time_from_ticks};
    use crate::vsync::{TickTarget, VsyncSignal};

    #[repr(C)]
    #[allow(dead_code)]
    struct SmpteTime {
        subframes: i16,
        subframe_divisor: i16,
        counter: u32,
        kind: u32,
        flags: u32,
        hours: i16,
        minutes: i16,
        seconds: i16,
        frames: i16,
    }

    #[repr(C)]
    #[allow(dead_code)]
    struct TimeStamp {
        version: u32,
        video_time_scale: i32,
        video_time: i64,
        host_time: u64,
        rate_scalar: f64,
        video_refresh_period: i64,
        smpte_time: SmpteTime,
        flags: u64,
        reserved: u64,
    }

    type OutputCallback = unsafe extern "C" fn(
        link: *mut c_void,
        now: *const TimeStamp,
        output_time: *const TimeStamp,
        flags_in: u64,
        flags_out: *mut u64,
        context: *mut c_void,
    ) -> i32;

    #[link(name = "CoreVideo", kind = "framework")]
    unsafe extern "C" {
        fn CVDisplayLinkCreateWithActiveCGDisplays(link_out: *mut *mut c_void) -> i32;
        fn CVDisplayLinkSetOutputCallback(
            link: *mut c_void,
            callback: OutputCallback,
            context: *mut c_void,
        ) -> i32;
        fn CVDisplayLinkStart(link: *mut c_void) -> i32;
        fn CVDisplayLinkStop(link: *mut c_void) -> i32;
        fn CVDisplayLinkIsRunning(link: *mut c_void) -> u8;
        fn CVDisplayLinkRelease(link: *mut c_void);
    }

    thread_local! {
        static ON_LINK_THREAD: Cell<bool> = const { Cell::new(false) };
    }

    unsafe extern "C" fn on_refresh(
        _link: *mut c_void,
        now: *const TimeStamp,
        _output_time: *const TimeStamp,
        _flags_in: u64,
        _flags_out: *mut u64,
        context: *mut c_void,
    ) -> i32 {
        ON_LINK_THREAD.with(|on| on.set(true));
        // SAFETY: `context` is the `Shared` the owning DisplayLink keeps
        // alive until the link is released.
        let shared = unsafe { &*(context as *const Shared) };
        let Some(now) = (unsafe { now.as_ref() }) else {
            return 0;
        };
        let period = if now.video_time_scale > 0 && now.video_refresh_period > 0 {
            Duration::from_secs_f64(now.video_refresh_period as f64 / now.video_time_scale as f64)
        } else {
            FALLBACK_PERIOD
        };
        shared.fire(host_time_from_ticks(now.host_time), period);
        0
    }

    /// A `CVDisplayLink` for the active displays. Refreshes arrive on the
    /// link's own high-priority thread.
    pub struct DisplayLink {
        link: NonNull<c_void>,
        shared: Arc<Shared>,
        /// Serializes start and stop.
        control: Mutex<()>,
    }

    // SAFETY: the CVDisplayLink functions used here are thread-safe.
    unsafe impl Send for DisplayLink {}
    unsafe impl Sync for DisplayLink {}

    impl DisplayLink {
        /// Create a stopped link. Fails without an active display.
        pub fn new() -> Result<Self, Error> {
            let mut raw = ptr::null_mut();
            check_status(unsafe { CVDisplayLinkCreateWithActiveCGDisplays(&mut raw) })?;
            let link = NonNull::new(raw).ok_or(Error::ContextUnavailable)?;
            let display_link = DisplayLink {
                link,
                shared: Arc::new(Shared::new()),
                control: Mutex::new(()),
            };
            let context = Arc::as_ptr(&display_link.shared) as *mut c_void;
            check_status(unsafe {
                CVDisplayLinkSetOutputCallback(link.as_ptr(), on_refresh, context)
            })?;
            tracing::debug!("display link created");
            Ok(display_link)
        }

        fn is_running(&self) -> bool {
            unsafe { CVDisplayLinkIsRunning(self.link.as_ptr()) != 0 }
        }
    }

    impl VsyncSignal for DisplayLink {
        fn register(&self, target: Weak<dyn TickTarget>) {
            *self.shared.target.lock() = Some(target);
        }

        fn unregister(&self) {
            *self.shared.target.lock() = None;
        }

        fn set_paused(&self, paused: bool) {
            self.shared.paused.store(paused, Ordering::Release);
            // Stopping from inside a refresh would wait on itself. The flag
            // alone gates ticks until a pause arrives from another thread.
            if ON_LINK_THREAD.with(Cell::get) {
                return;
            }
            let _control = self.control.lock();
            // Last writer wins when calls race.
            let paused = self.shared.paused.load(Ordering::Acquire);
            if paused == !self.is_running() {
                return;
            }
            let status = unsafe {
                if paused {
                    CVDisplayLinkStop(self.link.as_ptr())
                } else {
                    CVDisplayLinkStart(self.link.as_ptr())
                }
            };
            if let Err(error) = check_status(status) {
                tracing::warn!(%error, paused, "display link did not change state");
            }
        }

        fn is_paused(&self) -> bool {
            self.shared.paused.load(Ordering::Acquire)
        }
    }

    impl Drop for DisplayLink {
        fn drop(&mut self) {
            self.shared.paused.store(true, Ordering::Release);
            unsafe {
                CVDisplayLinkStop(self.link.as_ptr());
                CVDisplayLinkRelease(self.link.as_ptr());
            }
        }
    }
}

#[cfg(target_os = "ios")]
mod imp {
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use dispatch2::DispatchQueue;
    use objc2::rc::Retained;
    use objc2::{
        AllocAnyThread, ClassType, DefinedClass, MainThreadMarker, define_class, msg_send, sel,
    };
    use objc2_foundation::{NSObject, NSObjectProtocol, NSRunLoop, NSRunLoopCommonModes};
    use objc2_quartz_core::CADisplayLink;

    use super::{FALLBACK_PERIOD, Shared};
    use crate::error::Error;
    use crate::platform::apple::catch_objc;
    use crate::time::HostTime;
    use crate::vsync::{TickTarget, VsyncSignal};

    struct TargetIvars {
        shared: Arc<Shared>,
    }

    define_class!(
        // SAFETY: NSObject has no subclassing requirements and the class has
        // no Drop impl.
        #[unsafe(super(NSObject))]
        #[name = "VsyncPlayerDisplayLinkTarget"]
        #[ivars = TargetIvars]
        struct LinkTarget;

        unsafe impl NSObjectProtocol for LinkTarget {}

        impl LinkTarget {
            #[unsafe(method(step:))]
            fn step(&self, link: &CADisplayLink) {
                let (timestamp, duration): (f64, f64) =
                    unsafe { (msg_send![link, timestamp], msg_send![link, duration]) };
                let period = if duration > 0.0 {
                    Duration::from_secs_f64(duration)
                } else {
                    FALLBACK_PERIOD
                };
                self.ivars()
                    .shared
                    .fire(HostTime::from_secs_f64(timestamp), period);
            }
        }
    );

    impl LinkTarget {
        fn new(shared: Arc<Shared>) -> Retained<Self> {
            let obj = Self::alloc().set_ivars(TargetIvars { shared });
            unsafe { msg_send![super(obj), init] }
        }
    }

    /// A link handle that only ever gets messaged on the main thread.
    struct MainThreadLink(Retained<CADisplayLink>);

    // SAFETY: every message goes through `on_main`.
    unsafe impl Send for MainThreadLink {}
    unsafe impl Sync for MainThreadLink {}

    impl MainThreadLink {
        /// Run `f` now when on the main thread, otherwise queue it there.
        fn on_main(self: &Arc<Self>, f: impl FnOnce(&CADisplayLink) + Send + 'static) {
            if MainThreadMarker::new().is_some() {
                f(&self.0);
                return;
            }
            let link = Arc::clone(self);
            DispatchQueue::main().exec_async(move || f(&link.0));
        }
    }

    /// A `CADisplayLink` on the main run loop. Refreshes arrive on the main
    /// thread.
    pub struct DisplayLink {
        link: Arc<MainThreadLink>,
        shared: Arc<Shared>,
    }

    impl DisplayLink {
        /// Create a paused link. Must be called on the main thread.
        pub fn new() -> Result<Self, Error> {
            let _mtm = MainThreadMarker::new().ok_or(Error::ContextUnavailable)?;
            let shared = Arc::new(Shared::new());
            let target = LinkTarget::new(Arc::clone(&shared));
            let link: Option<Retained<CADisplayLink>> = catch_objc(AssertUnwindSafe(|| unsafe {
                msg_send![
                    CADisplayLink::class(),
                    displayLinkWithTarget: &*target,
                    selector: sel!(step:)
                ]
            }))?;
            let link = link.ok_or(Error::ContextUnavailable)?;
            unsafe {
                let _: () = msg_send![&*link, setPaused: true];
                let run_loop = NSRunLoop::mainRunLoop();
                let _: () = msg_send![&*link, addToRunLoop: &*run_loop, forMode: NSRunLoopCommonModes];
            }
            tracing::debug!("display link created");
            Ok(DisplayLink {
                link: Arc::new(MainThreadLink(link)),
                shared,
            })
        }
    }

    impl VsyncSignal for DisplayLink {
        fn register(&self, target: Weak<dyn TickTarget>) {
            *self.shared.target.lock() = Some(target);
        }

        fn unregister(&self) {
            *self.shared.target.lock() = None;
        }

        fn set_paused(&self, paused: bool) {
            self.shared.paused.store(paused, Ordering::Release);
            let shared = Arc::clone(&self.shared);
            // Applies whatever the flag holds by the time it runs.
            self.link.on_main(move |link| unsafe {
                let paused = shared.paused.load(Ordering::Acquire);
                let _: () = msg_send![link, setPaused: paused];
            });
        }

        fn is_paused(&self) -> bool {
            self.shared.paused.load(Ordering::Acquire)
        }
    }

    impl Drop for DisplayLink {
        fn drop(&mut self) {
            self.shared.paused.store(true, Ordering::Release);
            // Invalidating releases the target and, with it, the shared state.
            self.link.on_main(|link| unsafe {
                let _: () = msg_send![link, invalidate];
            });
        }
    }
}
