//! Run orchestration
//!
//! `init` prepares everything that must exist before the first frame:
//! derived BMR values, the DMR address, open ports with their links up,
//! TSC and NUMA sanity checks, and the CE arrays built on the cores that
//! will read them (first touch keeps them NUMA-local). `measure` then
//! launches one pinned thread per role, joins them, and evaluates.
//!
//! No mutable state is shared during measurement: workers get immutable
//! job descriptions plus exclusive ownership of their port and output
//! arrays, and the coordinator reads the outputs only after the join.

use std::thread;

use rand_mt::Mt19937GenRand64;
use thiserror::Error;
use tracing::info;

use crate::affinity::{self, AffinityError};
use crate::ce::{self, CeRecord};
use crate::cli::CommonArgs;
use crate::config::Config;
use crate::map::{dmr_address, BmrDerived, MapError};
use crate::port::{PortError, TestPort};
use crate::receiver::{receive_loop, ReceiverJob, ReceiverMode, ReceiverOutput};
use crate::sender::{send_loop, SenderCommon, SenderJob, SenderTimestamps};
use crate::stats::{evaluate_latency, evaluate_pdv, LatencySummary, PdvSummary};
use crate::tsc::{rdtsc, tsc_hz};
use crate::{Direction, Error as TopError, TestMode, MAX_PORT_TRIALS, START_DELAY_MS};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no CE array can be accessed by the {direction} sender")]
    NoCeArray { direction: Direction },
    #[error("{direction} sending exceeded the {limit:.10} seconds limit, the test is invalid")]
    DurationExceeded { direction: Direction, limit: f64 },
    #[error("{direction} receiver got a latency frame with invalid frame ID {id}")]
    InvalidLatencyId { direction: Direction, id: u16 },
    #[error("{direction} receiver got a PDV frame with invalid sequence counter {counter}")]
    InvalidCounter { direction: Direction, counter: u64 },
    #[error("no port was provided for the {0}")]
    MissingPort(&'static str),
    #[error("worker thread for the {0} panicked")]
    WorkerPanicked(&'static str),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Affinity(#[from] AffinityError),
    #[error(transparent)]
    Map(#[from] MapError),
}

/// The ports each enabled role transmits or receives on. Only the roles
/// of enabled directions need to be present.
#[derive(Default)]
pub struct RolePorts {
    pub forward_tx: Option<Box<dyn TestPort>>,
    pub forward_rx: Option<Box<dyn TestPort>>,
    pub reverse_tx: Option<Box<dyn TestPort>>,
    pub reverse_rx: Option<Box<dyn TestPort>>,
}

/// Everything one direction's measurement produced.
#[derive(Debug)]
pub struct DirectionReport {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub latency: Option<LatencySummary>,
    pub pdv: Option<PdvSummary>,
}

/// Result of a whole invocation.
#[derive(Debug, Default)]
pub struct Report {
    pub forward: Option<DirectionReport>,
    pub reverse: Option<DirectionReport>,
}

/// A fully initialized run, ready to measure.
pub struct TestRun {
    config: Config,
    derived: BmrDerived,
    args: CommonArgs,
    mode: TestMode,
    dmr_ipv6: std::net::Ipv6Addr,
    hz: u64,
    start_tsc: u64,
    finish_receiving: u64,
    fw_ce: Vec<CeRecord>,
    rv_ce: Vec<CeRecord>,
    ports: RolePorts,
}

impl TestRun {
    /// Full production initialization: raw-socket ports, link checks,
    /// NUMA warnings and TSC verification included.
    #[cfg(target_os = "linux")]
    pub fn init(config: Config, args: CommonArgs, mode: TestMode) -> Result<TestRun, TopError> {
        use crate::port::RawSocketPort;

        let open = |interface: &str| -> Result<Box<dyn TestPort>, TopError> {
            let port = RawSocketPort::open(interface, config.promisc)?;
            port.wait_link_up(MAX_PORT_TRIALS)?;
            Ok(Box::new(port))
        };

        let mut ports = RolePorts::default();
        if config.forward {
            ports.forward_tx = Some(open(&config.left_port)?);
            ports.forward_rx = Some(open(&config.right_port)?);
        }
        if config.reverse {
            ports.reverse_tx = Some(open(&config.right_port)?);
            ports.reverse_rx = Some(open(&config.left_port)?);
        }

        if affinity::num_numa_nodes() <= 1 {
            info!("a single NUMA node is configured, there is no possibility for mismatch");
        } else {
            if config.forward {
                affinity::numa_check(
                    &config.left_port,
                    "Left",
                    config.left_sender_cpu.unwrap(),
                    "Left Sender",
                );
                affinity::numa_check(
                    &config.right_port,
                    "Right",
                    config.right_receiver_cpu.unwrap(),
                    "Right Receiver",
                );
            }
            if config.reverse {
                affinity::numa_check(
                    &config.right_port,
                    "Right",
                    config.right_sender_cpu.unwrap(),
                    "Right Sender",
                );
                affinity::numa_check(
                    &config.left_port,
                    "Left",
                    config.left_receiver_cpu.unwrap(),
                    "Left Receiver",
                );
            }
        }

        if config.forward {
            affinity::check_tsc_sync(config.left_sender_cpu.unwrap(), "Left Sender")?;
            affinity::check_tsc_sync(config.right_receiver_cpu.unwrap(), "Right Receiver")?;
        }
        if config.reverse {
            affinity::check_tsc_sync(config.right_sender_cpu.unwrap(), "Right Sender")?;
            affinity::check_tsc_sync(config.left_receiver_cpu.unwrap(), "Left Receiver")?;
        }

        Self::init_with_ports(config, args, mode, ports, START_DELAY_MS)
    }

    /// Initialization against caller-provided ports. Used by the tests
    /// with loopback port pairs; `init` is a thin wrapper over this.
    pub fn init_with_ports(
        config: Config,
        args: CommonArgs,
        mode: TestMode,
        ports: RolePorts,
        start_delay_ms: u64,
    ) -> Result<TestRun, TopError> {
        let derived = config.derive_bmr()?;

        let hz = tsc_hz();
        let start_tsc = rdtsc() + hz * start_delay_ms / 1000;
        let finish_receiving = start_tsc
            + hz * (u64::from(args.test_duration) * 1000 + u64::from(args.stream_timeout)) / 1000;

        let fw_ce = if config.forward {
            build_ces_on_core(
                &config,
                &derived,
                config.left_sender_cpu,
                Direction::Forward,
                hz,
            )?
        } else {
            Vec::new()
        };
        let rv_ce = if config.reverse {
            build_ces_on_core(
                &config,
                &derived,
                config.right_sender_cpu,
                Direction::Reverse,
                hz,
            )?
        } else {
            Vec::new()
        };

        let dmr_ipv6 = dmr_address(
            config.dmr_ipv6_prefix,
            config.dmr_ipv6_prefix_length,
            config.tester_right_ipv4,
        );
        info!("DMR IPv6 address: {dmr_ipv6}");

        Ok(TestRun {
            config,
            derived,
            args,
            mode,
            dmr_ipv6,
            hz,
            start_tsc,
            finish_receiving,
            fw_ce,
            rv_ce,
            ports,
        })
    }

    /// Launches the senders and receivers of the enabled directions on
    /// their cores, waits for all of them, and evaluates the timestamps.
    pub fn measure(self) -> Result<Report, TopError> {
        let TestRun {
            config,
            derived,
            args,
            mode,
            dmr_ipv6,
            hz,
            start_tsc,
            finish_receiving,
            fw_ce,
            rv_ce,
            mut ports,
        } = self;

        let common = SenderCommon {
            ipv6_frame_size: args.ipv6_frame_size,
            ipv4_frame_size: args.ipv4_frame_size(),
            frame_rate: args.frame_rate,
            test_duration: args.test_duration,
            n: args.n,
            m: args.m,
            hz,
            start_tsc,
            num_port_sets: derived.num_port_sets,
            ports_per_set: derived.ports_per_set,
            tester_left_ipv6: config.tester_left_ipv6,
            tester_right_ipv6: config.tester_right_ipv6,
            tester_right_ipv4: config.tester_right_ipv4,
            dmr_ipv6,
            bg_sport_min: config.bg_sport_min,
            bg_sport_max: config.bg_sport_max,
            bg_dport_min: config.bg_dport_min,
            bg_dport_max: config.bg_dport_max,
        };

        let frames_to_send = u64::from(args.test_duration) * u64::from(args.frame_rate);
        let receiver_mode = match mode {
            TestMode::Throughput => ReceiverMode::Throughput,
            TestMode::Latency { num_of_tagged, .. } => ReceiverMode::Latency { num_of_tagged },
            TestMode::Pdv { frame_timeout } => ReceiverMode::Pdv {
                num_frames: frames_to_send,
                frame_timeout,
            },
        };

        struct DirectionSetup<'a> {
            sender_job: SenderJob<'a>,
            sender_core: usize,
            sender_role: &'static str,
            tx: Box<dyn TestPort>,
            receiver_job: ReceiverJob,
            receiver_core: usize,
            receiver_role: &'static str,
            rx: Box<dyn TestPort>,
        }

        let mut setups: Vec<DirectionSetup> = Vec::new();
        if config.forward {
            setups.push(DirectionSetup {
                sender_job: SenderJob {
                    common: common.clone(),
                    direction: Direction::Forward,
                    mode,
                    ce_array: &fw_ce,
                    dst_mac: config.dut_left_mac,
                    src_mac: config.tester_left_mac,
                    var_sport: config.fwd_var_sport,
                    var_dport: config.fwd_var_dport,
                    wide_port_min: config.fwd_dport_min,
                    wide_port_max: config.fwd_dport_max,
                },
                sender_core: config.left_sender_cpu.unwrap(),
                sender_role: "Left Sender",
                tx: ports
                    .forward_tx
                    .take()
                    .ok_or(RunError::MissingPort("Left Sender"))?,
                receiver_job: ReceiverJob {
                    direction: Direction::Forward,
                    mode: receiver_mode,
                    finish_receiving,
                },
                receiver_core: config.right_receiver_cpu.unwrap(),
                receiver_role: "Right Receiver",
                rx: ports
                    .forward_rx
                    .take()
                    .ok_or(RunError::MissingPort("Right Receiver"))?,
            });
        }
        if config.reverse {
            setups.push(DirectionSetup {
                sender_job: SenderJob {
                    common: common.clone(),
                    direction: Direction::Reverse,
                    mode,
                    ce_array: &rv_ce,
                    dst_mac: config.dut_right_mac,
                    src_mac: config.tester_right_mac,
                    var_sport: config.rev_var_sport,
                    var_dport: config.rev_var_dport,
                    wide_port_min: config.rev_sport_min,
                    wide_port_max: config.rev_sport_max,
                },
                sender_core: config.right_sender_cpu.unwrap(),
                sender_role: "Right Sender",
                tx: ports
                    .reverse_tx
                    .take()
                    .ok_or(RunError::MissingPort("Right Sender"))?,
                receiver_job: ReceiverJob {
                    direction: Direction::Reverse,
                    mode: receiver_mode,
                    finish_receiving,
                },
                receiver_core: config.left_receiver_cpu.unwrap(),
                receiver_role: "Left Receiver",
                rx: ports
                    .reverse_rx
                    .take()
                    .ok_or(RunError::MissingPort("Left Receiver"))?,
            });
        }

        let mut results: Vec<(Direction, SenderTimestamps, ReceiverOutput)> = Vec::new();
        thread::scope(|scope| -> Result<(), RunError> {
            let mut workers = Vec::new();
            for setup in setups {
                let DirectionSetup {
                    sender_job,
                    sender_core,
                    sender_role,
                    mut tx,
                    receiver_job,
                    receiver_core,
                    receiver_role,
                    mut rx,
                } = setup;
                let direction = sender_job.direction;

                let sender = scope.spawn(move || -> Result<SenderTimestamps, RunError> {
                    affinity::pin_to_core(sender_core)?;
                    send_loop(&sender_job, &mut tx)
                });
                let receiver = scope.spawn(move || -> Result<ReceiverOutput, RunError> {
                    affinity::pin_to_core(receiver_core)?;
                    receive_loop(&receiver_job, &mut rx)
                });
                workers.push((direction, sender, sender_role, receiver, receiver_role));
            }

            info!("testing started");
            for (direction, sender, sender_role, receiver, receiver_role) in workers {
                let stamps = sender
                    .join()
                    .map_err(|_| RunError::WorkerPanicked(sender_role))??;
                let output = receiver
                    .join()
                    .map_err(|_| RunError::WorkerPanicked(receiver_role))??;
                results.push((direction, stamps, output));
            }
            Ok(())
        })
        .map_err(TopError::Run)?;

        let mut report = Report::default();
        for (direction, stamps, output) in results {
            let dir_report = evaluate_direction(
                direction,
                mode,
                &args,
                hz,
                frames_to_send,
                stamps,
                output,
            );
            match direction {
                Direction::Forward => report.forward = Some(dir_report),
                Direction::Reverse => report.reverse = Some(dir_report),
            }
        }

        info!("test finished");
        Ok(report)
    }
}

/// Builds the EA permutation and CE array on the core that will read
/// them during measurement; first touch makes them NUMA-local there.
fn build_ces_on_core(
    config: &Config,
    derived: &BmrDerived,
    core: Option<usize>,
    direction: Direction,
    hz: u64,
) -> Result<Vec<CeRecord>, TopError> {
    let bmr = config.bmr;
    let derived = *derived;
    let num_of_ces = config.num_of_ces as usize;
    let suffix_length = derived.ipv4_suffix_length;
    let psid_length = derived.psid_length;

    let worker = move || -> Result<Vec<CeRecord>, RunError> {
        if let Some(core) = core {
            affinity::pin_to_core(core)?;
        }
        info!("pre-generating NUMA local unique EA-bits combinations for the {direction} sender");
        let start = rdtsc();
        let mut rng = Mt19937GenRand64::new(rand::random());
        let permutation = ce::random_permutation(suffix_length, psid_length, &mut rng);
        info!(
            "done, lasted {:.6} seconds for the {direction} sender",
            (rdtsc() - start) as f64 / hz as f64
        );

        info!("building the CE array for the {direction} sender");
        let start = rdtsc();
        let ces = ce::build_ce_array(&bmr, &derived, num_of_ces, &permutation)?;
        info!(
            "done, lasted {:.6} seconds for the {direction} sender",
            (rdtsc() - start) as f64 / hz as f64
        );
        Ok(ces)
    };

    let ces = thread::spawn(worker)
        .join()
        .map_err(|_| RunError::WorkerPanicked("CE array builder"))??;
    Ok(ces)
}

/// Turns one direction's timestamps into the reported metrics.
fn evaluate_direction(
    direction: Direction,
    mode: TestMode,
    args: &CommonArgs,
    hz: u64,
    frames_sent: u64,
    stamps: SenderTimestamps,
    output: ReceiverOutput,
) -> DirectionReport {
    let mut report = DirectionReport {
        frames_sent,
        frames_received: output.received,
        latency: None,
        pdv: None,
    };

    match (mode, stamps) {
        (TestMode::Throughput, _) => {}
        (
            TestMode::Latency {
                first_tagged_delay, ..
            },
            SenderTimestamps::Latency(send_ts),
        ) => {
            let penalty = f64::from(
                1000 * u32::from(args.test_duration - first_tagged_delay)
                    + u32::from(args.stream_timeout),
            );
            let summary = evaluate_latency(&send_ts, &output.timestamps, hz, penalty);
            println!("{direction} TL: {:.6}", summary.typical);
            println!("{direction} WCL: {:.6}", summary.worst_case);
            report.latency = Some(summary);
        }
        (TestMode::Pdv { frame_timeout }, SenderTimestamps::Pdv(send_ts)) => {
            let penalty =
                1000 * u64::from(args.test_duration) + u64::from(args.stream_timeout);
            let summary = evaluate_pdv(
                &send_ts,
                &output.timestamps,
                hz,
                frame_timeout,
                penalty,
                &direction.to_string(),
            );
            if let PdvSummary::Pdv {
                dmin,
                dmax,
                d99_9th,
                pdv,
            } = summary
            {
                println!("Info: {direction} D99_9th_perc: {d99_9th:.6}");
                println!("Info: {direction} Dmin: {dmin:.6}");
                println!("Info: {direction} Dmax: {dmax:.6}");
                println!("{direction} PDV: {pdv:.6}");
            }
            report.pdv = Some(summary);
        }
        _ => unreachable!("sender timestamps match the test mode"),
    }
    report
}
