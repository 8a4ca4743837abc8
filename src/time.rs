use core::cmp::Ordering;
use core::ops::{Add, Sub};
use core::time::Duration;

/// Flag bits, numerically identical to Core Media's `CMTimeFlags`.
pub mod flags {
    pub const VALID: u32 = 1 << 0;
    pub const HAS_BEEN_ROUNDED: u32 = 1 << 1;
    pub const POSITIVE_INFINITY: u32 = 1 << 2;
    pub const NEGATIVE_INFINITY: u32 = 1 << 3;
    pub const INDEFINITE: u32 = 1 << 4;
}

/// A rational media timestamp (`value / timescale` seconds).
///
/// Mirrors `CMTime` so it can cross the platform boundary losslessly. A time
/// whose `VALID` flag is clear is *invalid*: it never compares equal or
/// ordered to anything, including itself.
#[derive(Debug, Clone, Copy)]
pub struct PresentationTime {
    value: i64,
    timescale: i32,
    flags: u32,
    epoch: i64,
}

impl PresentationTime {
    pub const INVALID: PresentationTime = PresentationTime {
        value: 0,
        timescale: 0,
        flags: 0,
        epoch: 0,
    };

    pub const ZERO: PresentationTime = PresentationTime {
        value: 0,
        timescale: 1,
        flags: flags::VALID,
        epoch: 0,
    };

    /// `value / timescale` seconds. A non-positive timescale yields [`INVALID`](Self::INVALID).
    pub const fn new(value: i64, timescale: i32) -> Self {
        if timescale <= 0 {
            return Self::INVALID;
        }
        PresentationTime {
            value,
            timescale,
            flags: flags::VALID,
            epoch: 0,
        }
    }

    /// Rebuild a time from raw `CMTime` fields.
    pub const fn from_parts(value: i64, timescale: i32, raw_flags: u32, epoch: i64) -> Self {
        if timescale <= 0 && raw_flags & flags::VALID != 0 {
            return Self::INVALID;
        }
        PresentationTime {
            value,
            timescale,
            flags: raw_flags,
            epoch,
        }
    }

    /// The closest representable time to `seconds` at `timescale`.
    ///
    /// Non-finite input, a non-positive timescale or a value that does not fit
    /// in 64 bits produce an invalid time.
    pub fn from_seconds(seconds: f64, timescale: i32) -> Self {
        if !seconds.is_finite() || timescale <= 0 {
            return Self::INVALID;
        }
        let scaled = seconds * timescale as f64;
        let magnitude = if scaled < 0.0 { -scaled } else { scaled };
        if magnitude >= i64::MAX as f64 {
            return Self::INVALID;
        }
        let value = if scaled >= 0.0 {
            (scaled + 0.5) as i64
        } else {
            (scaled - 0.5) as i64
        };
        let mut time_flags = flags::VALID;
        if value as f64 != scaled {
            time_flags |= flags::HAS_BEEN_ROUNDED;
        }
        PresentationTime {
            value,
            timescale,
            flags: time_flags,
            epoch: 0,
        }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn timescale(&self) -> i32 {
        self.timescale
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    pub fn is_valid(&self) -> bool {
        self.flags & flags::VALID != 0
    }

    /// Valid and neither infinite nor indefinite.
    pub fn is_numeric(&self) -> bool {
        self.is_valid()
            && self.flags
                & (flags::POSITIVE_INFINITY | flags::NEGATIVE_INFINITY | flags::INDEFINITE)
                == 0
    }

    /// Seconds as a float. Invalid and indefinite times are NaN, infinities map
    /// to the matching float infinity.
    pub fn as_secs_f64(&self) -> f64 {
        if !self.is_valid() || self.flags & flags::INDEFINITE != 0 {
            return f64::NAN;
        }
        if self.flags & flags::POSITIVE_INFINITY != 0 {
            return f64::INFINITY;
        }
        if self.flags & flags::NEGATIVE_INFINITY != 0 {
            return f64::NEG_INFINITY;
        }
        self.value as f64 / self.timescale as f64
    }

    fn rank(&self) -> i8 {
        if self.flags & flags::NEGATIVE_INFINITY != 0 {
            -1
        } else if self.flags & flags::POSITIVE_INFINITY != 0 {
            1
        } else {
            0
        }
    }
}

impl PartialEq for PresentationTime {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for PresentationTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.is_valid()
            || !other.is_valid()
            || self.flags & flags::INDEFINITE != 0
            || other.flags & flags::INDEFINITE != 0
        {
            return None;
        }
        let (lhs, rhs) = (self.rank(), other.rank());
        if lhs != 0 || rhs != 0 {
            return Some(lhs.cmp(&rhs));
        }
        if self.epoch != other.epoch {
            return Some(self.epoch.cmp(&other.epoch));
        }
        // Cross-multiply so differing timescales compare exactly.
        let l = self.value as i128 * other.timescale as i128;
        let r = other.value as i128 * self.timescale as i128;
        Some(l.cmp(&r))
    }
}

/// A point on the host clock, in seconds.
///
/// Display-link timestamps and the timebase that maps host time to item time
/// both use this clock.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct HostTime(f64);

impl HostTime {
    pub const fn from_secs_f64(seconds: f64) -> Self {
        HostTime(seconds)
    }

    pub const fn as_secs_f64(&self) -> f64 {
        self.0
    }

    /// Elapsed time since `earlier`, saturating at zero.
    pub fn saturating_since(&self, earlier: HostTime) -> Duration {
        Duration::try_from_secs_f64(self.0 - earlier.0).unwrap_or(Duration::ZERO)
    }
}

impl Add<Duration> for HostTime {
    type Output = HostTime;

    fn add(self, rhs: Duration) -> HostTime {
        HostTime(self.0 + rhs.as_secs_f64())
    }
}

impl Sub for HostTime {
    type Output = Duration;

    fn sub(self, rhs: HostTime) -> Duration {
        self.saturating_since(rhs)
    }
}

/// The host time of the refresh a frame is being produced for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRequest {
    pub next_vsync: HostTime,
}

impl FrameRequest {
    /// The refresh after the one at `timestamp`.
    pub fn following(timestamp: HostTime, vsync_duration: Duration) -> Self {
        FrameRequest {
            next_vsync: timestamp + vsync_duration,
        }
    }
}

/// Monotonic host clock shared by the vsync thread and frame timebases.
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl HostClock {
    pub fn new() -> Self {
        HostClock {
            origin: std::time::Instant::now(),
        }
    }

    pub fn now(&self) -> HostTime {
        HostTime(self.origin.elapsed().as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_across_timescales() {
        let a = PresentationTime::new(1, 30);
        let b = PresentationTime::new(20, 600);
        assert_eq!(a, b);
        assert!(PresentationTime::new(21, 600) > a);
        assert!(PresentationTime::new(19, 600) < a);
    }

    #[test]
    fn invalid_never_orders() {
        let invalid = PresentationTime::INVALID;
        assert_eq!(invalid.partial_cmp(&PresentationTime::ZERO), None);
        assert_ne!(invalid, invalid);
        assert!(!invalid.is_valid());
    }

    #[test]
    fn non_positive_timescale_is_invalid() {
        assert!(!PresentationTime::new(10, 0).is_valid());
        assert!(!PresentationTime::new(10, -5).is_valid());
        assert!(!PresentationTime::from_seconds(1.0, 0).is_valid());
    }

    #[test]
    fn from_seconds_rounds_to_timescale() {
        let t = PresentationTime::from_seconds(1.5, 600);
        assert_eq!(t.value(), 900);
        assert_eq!(t.timescale(), 600);
        assert_eq!(t.flags() & flags::HAS_BEEN_ROUNDED, 0);

        let t = PresentationTime::from_seconds(1.0 / 3.0, 10);
        assert_eq!(t.value(), 3);
        assert_ne!(t.flags() & flags::HAS_BEEN_ROUNDED, 0);

        let t = PresentationTime::from_seconds(-0.25, 4);
        assert_eq!(t.value(), -1);
    }

    #[test]
    fn from_seconds_rejects_non_finite() {
        assert!(!PresentationTime::from_seconds(f64::NAN, 600).is_valid());
        assert!(!PresentationTime::from_seconds(f64::INFINITY, 600).is_valid());
        assert!(!PresentationTime::from_seconds(1e30, 600).is_valid());
    }

    #[test]
    fn infinities_order_outside_numeric_times() {
        let pos = PresentationTime::from_parts(0, 1, flags::VALID | flags::POSITIVE_INFINITY, 0);
        let neg = PresentationTime::from_parts(0, 1, flags::VALID | flags::NEGATIVE_INFINITY, 0);
        let t = PresentationTime::new(i64::MAX, 1);
        assert!(pos > t);
        assert!(neg < t);
        assert!(!pos.is_numeric());
        assert_eq!(pos.as_secs_f64(), f64::INFINITY);
    }

    #[test]
    fn host_time_arithmetic() {
        let t = HostTime::from_secs_f64(10.0);
        let next = t + Duration::from_millis(16);
        assert!((next.as_secs_f64() - 10.016).abs() < 1e-9);
        assert_eq!(t - next, Duration::ZERO);
        assert_eq!(next - t, Duration::from_secs_f64(next.as_secs_f64() - 10.0));
    }

    #[test]
    fn frame_request_targets_next_refresh() {
        let r = FrameRequest::following(HostTime::from_secs_f64(1.0), Duration::from_millis(500));
        assert_eq!(r.next_vsync, HostTime::from_secs_f64(1.5));
    }
}
