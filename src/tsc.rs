//! Cycle-counter timekeeping
//!
//! Rate pacing and timestamping use the CPU's TSC directly: reading it is
//! a handful of cycles and involves no OS call, which is what keeps the
//! inter-frame spacing exact at millions of frames per second. The
//! frequency is calibrated once against the system clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

static TSC_FREQUENCY: AtomicU64 = AtomicU64::new(0);
static CALIBRATE: Once = Once::new();

/// Reads the time stamp counter.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::x86::_rdtsc()
    }
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
}

/// Monotonic nanosecond fallback for architectures without a TSC
/// intrinsic; [`tsc_hz`] then reports 1 GHz.
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Cycles per second. The first call calibrates (a few hundred
/// milliseconds); later calls return the cached value.
pub fn tsc_hz() -> u64 {
    CALIBRATE.call_once(|| {
        TSC_FREQUENCY.store(measure_tsc_frequency(), Ordering::Relaxed);
    });
    TSC_FREQUENCY.load(Ordering::Relaxed)
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn measure_tsc_frequency() -> u64 {
    1_000_000_000
}

/// Median of several sleep-timed samples; the median rides out scheduler
/// hiccups in any single sample.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn measure_tsc_frequency() -> u64 {
    const SAMPLES: usize = 5;
    const SAMPLE_DURATION_MS: u64 = 50;

    let mut frequencies = Vec::with_capacity(SAMPLES);
    for _ in 0..SAMPLES {
        let start_tsc = rdtsc();
        let start_time = Instant::now();
        std::thread::sleep(Duration::from_millis(SAMPLE_DURATION_MS));
        let ticks = rdtsc().saturating_sub(start_tsc);
        let nanos = start_time.elapsed().as_nanos() as u64;
        if nanos > 0 {
            frequencies.push((ticks as u128 * 1_000_000_000 / nanos as u128) as u64);
        }
    }

    if frequencies.is_empty() {
        return 3_000_000_000;
    }
    frequencies.sort_unstable();
    frequencies[frequencies.len() / 2]
}

/// Busy-waits until the TSC reaches `target`. Returns immediately if it
/// already has.
#[inline(always)]
pub fn wait_until(target: u64) {
    while rdtsc() < target {
        std::hint::spin_loop();
    }
}
