//! maptbench — RFC 8219 benchmarking tester for MAP-T border relays
//!
//! The tester frames a device under test between two Ethernet ports and
//! measures throughput, frame loss, latency and packet delay variation of
//! its RFC 7597/7599 translation path. A run simulates a configurable
//! population of customer edges, sends rigidly rate-paced test frames in
//! one or both directions, timestamps what comes back and evaluates the
//! result. Rate search is driven externally by repeated invocations.

pub mod affinity;
pub mod ce;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod frame;
pub mod map;
pub mod port;
pub mod receiver;
pub mod runner;
pub mod sender;
pub mod stats;
pub mod tsc;

use std::fmt;

use thiserror::Error;

pub use config::Config;
pub use runner::TestRun;

/// Number of replicated template frames per kind. A slot is reused only
/// after the port has drained the previous 39 sends, which prevents
/// write-after-send corruption without completion tracking.
pub const TEMPLATE_SLOTS: usize = 40;

/// Delay before the senders start, for a synchronized start across
/// directions. DUT NICs also need time to get ready.
pub const START_DELAY_MS: u64 = 5000;

/// How many times a port's link state is polled before giving up.
pub const MAX_PORT_TRIALS: usize = 10;

/// Allowed sending-time inaccuracy: 0.001% over the nominal duration.
pub const TOLERANCE: f64 = 1.00001;

/// Which way through the DUT a sender/receiver pair works.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Left to right: IPv6 foreground traffic towards the DMR.
    Forward,
    /// Right to left: IPv4 foreground traffic towards the CEs.
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        })
    }
}

/// The measurement variant of this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    Throughput,
    Latency {
        first_tagged_delay: u16,
        num_of_tagged: u16,
    },
    Pdv {
        frame_timeout: u16,
    },
}

/// Anything that can end a tester invocation early.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cli(#[from] cli::CliError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Port(#[from] port::PortError),
    #[error(transparent)]
    Affinity(#[from] affinity::AffinityError),
    #[error(transparent)]
    Run(#[from] runner::RunError),
}
