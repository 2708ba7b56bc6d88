//! Command-line arguments of the measurement binaries
//!
//! All three binaries take the same six positional parameters; the
//! latency and PDV variants append their own. Everything else comes from
//! the configuration file, so that an external rate-search script only
//! has to vary the command line.

use clap::{Args, Parser};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Invalid(String),
}

/// Positional parameters shared by every measurement variant.
#[derive(Args, Debug, Clone, Copy)]
pub struct CommonArgs {
    /// Size of the frames carrying IPv6 datagrams, in bytes including the FCS
    #[arg(index = 1, value_parser = clap::value_parser!(u16).range(84..=1538))]
    pub ipv6_frame_size: u16,

    /// Frames per second sent by each active sender
    #[arg(index = 2, value_parser = clap::value_parser!(u32).range(1..=14_880_952))]
    pub frame_rate: u32,

    /// Test duration in seconds
    #[arg(index = 3, value_parser = clap::value_parser!(u16).range(1..=3600))]
    pub test_duration: u16,

    /// How long receiving continues after the last frame, in milliseconds
    #[arg(index = 4, value_parser = clap::value_parser!(u16).range(0..=60000))]
    pub stream_timeout: u16,

    /// Cycle length of the foreground/background selector
    #[arg(index = 5, value_parser = clap::value_parser!(u32).range(2..))]
    pub n: u32,

    /// Number of foreground frames within each cycle of n
    #[arg(index = 6)]
    pub m: u32,
}

impl CommonArgs {
    /// IPv4 test frames are 20 bytes shorter: the translated packet must
    /// come out at the configured IPv6 frame size.
    pub fn ipv4_frame_size(&self) -> u16 {
        self.ipv6_frame_size - 20
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Throughput and frame-loss-rate measurement for a MAP-T border relay")]
pub struct ThroughputArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

impl ThroughputArgs {
    pub fn validate(&self) -> Result<(), CliError> {
        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Latency measurement for a MAP-T border relay")]
pub struct LatencyArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Delay before the first tagged frame, in seconds
    #[arg(index = 7, value_parser = clap::value_parser!(u16).range(0..=3600))]
    pub first_tagged_delay: u16,

    /// Number of tagged frames
    #[arg(index = 8, value_parser = clap::value_parser!(u16).range(1..=50000))]
    pub num_of_tagged: u16,
}

impl LatencyArgs {
    pub fn validate(&self) -> Result<(), CliError> {
        if self.first_tagged_delay >= self.common.test_duration {
            return Err(CliError::Invalid(
                "test duration must be longer than the delay before the first tagged frame".into(),
            ));
        }
        let window = u64::from(self.common.test_duration - self.first_tagged_delay)
            * u64::from(self.common.frame_rate);
        if window < u64::from(self.num_of_tagged) {
            return Err(CliError::Invalid(
                "not enough test frames in the (test_duration - first_tagged_delay) interval to be tagged"
                    .into(),
            ));
        }
        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Packet delay variation measurement for a MAP-T border relay")]
pub struct PdvArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Per-frame timeout in milliseconds; 0 selects PDV evaluation
    #[arg(index = 7)]
    pub frame_timeout: u16,
}

impl PdvArgs {
    pub fn validate(&self) -> Result<(), CliError> {
        let limit =
            1000 * u32::from(self.common.test_duration) + u32::from(self.common.stream_timeout);
        if u32::from(self.frame_timeout) >= limit {
            return Err(CliError::Invalid(format!(
                "frame timeout must be less than 1000*test_duration+stream_timeout ({limit} ms)"
            )));
        }
        Ok(())
    }
}
