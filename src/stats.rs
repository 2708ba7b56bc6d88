//! Statistical evaluation of timestamp arrays
//!
//! After the workers join, the coordinator owns two parallel arrays per
//! direction: send and receive timestamps in TSC units, index = tagged
//! frame ID (latency) or sequence counter (PDV). A zero receive entry
//! means the frame never came back and costs the penalty delay, so lost
//! frames push the reported percentiles up instead of vanishing.

use tracing::{debug, info};

/// Latency summary of one direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    /// Typical Latency: the median, in milliseconds.
    pub typical: f64,
    /// Worst-Case Latency: the 99.9th percentile, in milliseconds.
    pub worst_case: f64,
}

/// PDV evaluation result of one direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PdvSummary {
    /// `frame_timeout` was zero: the delay distribution itself.
    Pdv {
        dmin: f64,
        dmax: f64,
        d99_9th: f64,
        /// D99.9 - Dmin, in milliseconds.
        pdv: f64,
    },
    /// `frame_timeout` was nonzero: frames that made it in time.
    WithinTimeout {
        frames_received: u64,
        frames_lost: u64,
    },
}

/// Index of the 99.9th percentile in a sorted array of `len` samples.
fn percentile_99_9_index(len: usize) -> usize {
    (0.999 * len as f64).ceil() as usize - 1
}

/// Evaluates latency timestamps. `penalty` (milliseconds) is charged for
/// every tagged frame that never arrived.
pub fn evaluate_latency(
    send_ts: &[u64],
    receive_ts: &[u64],
    hz: u64,
    penalty: f64,
) -> LatencySummary {
    let mut latencies: Vec<f64> = send_ts
        .iter()
        .zip(receive_ts)
        .map(|(&sent, &received)| {
            if received != 0 {
                1000.0 * (received.wrapping_sub(sent)) as f64 / hz as f64
            } else {
                penalty
            }
        })
        .collect();

    if latencies.len() < 2 {
        return LatencySummary {
            typical: latencies[0],
            worst_case: latencies[0],
        };
    }

    latencies.sort_by(|a, b| a.total_cmp(b));
    let mid = latencies.len() / 2;
    let typical = if latencies.len() % 2 == 1 {
        latencies[mid]
    } else {
        (latencies[mid - 1] + latencies[mid]) / 2.0
    };
    LatencySummary {
        typical,
        worst_case: latencies[percentile_99_9_index(latencies.len())],
    }
}

/// Evaluates PDV timestamps. `penalty` (milliseconds) is charged for
/// frames that never arrived; `frame_timeout` nonzero switches to the
/// frames-within-timeout accounting.
pub fn evaluate_pdv(
    send_ts: &[u64],
    receive_ts: &[u64],
    hz: u64,
    frame_timeout: u16,
    penalty: u64,
    direction: &str,
) -> PdvSummary {
    let frame_to = u64::from(frame_timeout) as i64 * hz as i64 / 1000;
    let penalty_tsc = penalty as i64 * hz as i64 / 1000;

    let mut corrected: u64 = 0;
    let mut frames_lost: u64 = 0;
    let mut delays: Vec<i64> = send_ts
        .iter()
        .zip(receive_ts)
        .map(|(&sent, &received)| {
            if received != 0 {
                let delay = received as i64 - sent as i64;
                if delay < 0 {
                    // TSC skew between the two cores; clamp and report.
                    corrected += 1;
                    0
                } else {
                    delay
                }
            } else {
                frames_lost += 1;
                penalty_tsc
            }
        })
        .collect();

    if corrected > 0 {
        debug!("{direction} number of negative delay values corrected to 0: {corrected}");
    }

    if frame_timeout != 0 {
        let frames_received = delays.iter().filter(|&&d| d <= frame_to).count() as u64;
        println!("{direction} frames received: {frames_received}");
        info!("{direction} frames completely missing: {frames_lost}");
        return PdvSummary::WithinTimeout {
            frames_received,
            frames_lost,
        };
    }

    let mut dmin = delays[0];
    let mut dmax = delays[0];
    for &delay in &delays[1..] {
        dmin = dmin.min(delay);
        dmax = dmax.max(delay);
    }
    delays.sort_unstable();
    let d99_9th = delays[percentile_99_9_index(delays.len())];

    let to_ms = |ticks: i64| 1000.0 * ticks as f64 / hz as f64;
    PdvSummary::Pdv {
        dmin: to_ms(dmin),
        dmax: to_ms(dmax),
        d99_9th: to_ms(d99_9th),
        pdv: to_ms(d99_9th - dmin),
    }
}
