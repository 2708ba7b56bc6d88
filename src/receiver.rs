//! Timestamp-capturing receive loop
//!
//! The receiver polls its port in a tight loop until the deadline and
//! classifies every frame with two cheap comparisons: the EtherType and
//! the eight magic bytes at the start of the UDP payload. Anything else
//! on the wire is dropped without counting. Arrival order is irrelevant;
//! the embedded sequence counter or tagged ID indexes the timestamp
//! array, which restores the send-to-receive mapping by itself.

use tracing::debug;

use crate::frame::{read_u16, ETHERTYPE_IPV4, ETHERTYPE_IPV6, MAGIC_LATENCY, MAGIC_TEST};
use crate::port::{RxFrame, TestPort, MAX_PKT_BURST};
use crate::runner::RunError;
use crate::tsc::rdtsc;
use crate::Direction;

/// What a receiver records, by measurement variant.
#[derive(Debug, Clone, Copy)]
pub enum ReceiverMode {
    /// Count test frames.
    Throughput,
    /// Count test frames; timestamp tagged ones by their embedded ID.
    Latency { num_of_tagged: u16 },
    /// Timestamp every frame by its embedded sequence counter.
    Pdv { num_frames: u64, frame_timeout: u16 },
}

pub struct ReceiverJob {
    pub direction: Direction,
    pub mode: ReceiverMode,
    /// TSC deadline: `start_tsc + hz * (test_duration + stream_timeout)`.
    pub finish_receiving: u64,
}

pub struct ReceiverOutput {
    pub received: u64,
    /// Zero-initialized receive timestamps; zero still means "never
    /// received" during evaluation. Empty in throughput mode.
    pub timestamps: Vec<u64>,
}

// Offsets from the start of the Ethernet frame:
// EtherType 12; IPv6 next header 20, UDP data 62; IPv4 protocol 23,
// UDP data 42. The ID/counter follows the 8-byte magic.
const IPV6_PROTO: usize = 20;
const IPV6_DATA: usize = 62;
const IPV4_PROTO: usize = 23;
const IPV4_DATA: usize = 42;

/// Receives and classifies test frames of one direction until the
/// deadline passes.
pub fn receive_loop<P: TestPort>(
    job: &ReceiverJob,
    port: &mut P,
) -> Result<ReceiverOutput, RunError> {
    let direction = job.direction;
    let mut bufs = vec![RxFrame::empty(); MAX_PKT_BURST];
    let mut received: u64 = 0;
    let mut timestamps = match job.mode {
        ReceiverMode::Latency { num_of_tagged } => vec![0u64; usize::from(num_of_tagged)],
        ReceiverMode::Pdv { num_frames, .. } => vec![0u64; num_frames as usize],
        ReceiverMode::Throughput => Vec::new(),
    };

    while rdtsc() < job.finish_receiving {
        let count = port.rx_burst(&mut bufs)?;
        for slot in &bufs[..count] {
            let data = slot.bytes();
            if data.len() < 14 {
                continue;
            }
            let (proto_off, data_off) = match read_u16(data, 12) {
                ETHERTYPE_IPV6 => (IPV6_PROTO, IPV6_DATA),
                ETHERTYPE_IPV4 => (IPV4_PROTO, IPV4_DATA),
                _ => continue,
            };
            if data.len() < data_off + 8 || data[proto_off] != 17 {
                continue;
            }
            let magic = &data[data_off..data_off + 8];

            if magic == MAGIC_TEST {
                if let ReceiverMode::Pdv { num_frames, .. } = job.mode {
                    let timestamp = rdtsc(); // before any further parsing
                    if data.len() < data_off + 16 {
                        continue;
                    }
                    let counter = u64::from_le_bytes(
                        data[data_off + 8..data_off + 16].try_into().unwrap(),
                    );
                    if counter >= num_frames {
                        return Err(RunError::InvalidCounter { direction, counter });
                    }
                    timestamps[counter as usize] = timestamp;
                }
                received += 1;
            } else if magic == MAGIC_LATENCY {
                if let ReceiverMode::Latency { num_of_tagged } = job.mode {
                    let timestamp = rdtsc();
                    if data.len() < data_off + 10 {
                        continue;
                    }
                    let id =
                        u16::from_le_bytes(data[data_off + 8..data_off + 10].try_into().unwrap());
                    if id >= num_of_tagged {
                        return Err(RunError::InvalidLatencyId { direction, id });
                    }
                    timestamps[usize::from(id)] = timestamp;
                    received += 1;
                }
                // Tagged frames are not test frames for the other modes.
            }
        }
    }

    debug!("{direction} receiver reached its deadline");
    match job.mode {
        // With a per-frame timeout the frames-received line comes from
        // the evaluator, which also knows which frames arrived in time.
        ReceiverMode::Pdv { frame_timeout, .. } if frame_timeout != 0 => {}
        _ => println!("{direction} frames received: {received}"),
    }

    Ok(ReceiverOutput {
        received,
        timestamps,
    })
}
