//! Rate-paced send loop
//!
//! One sender owns one port, one CE array and one set of template frames,
//! and runs from the synchronized start time to the last frame with no
//! locks, no allocation and no syscalls besides the transmit itself.
//! Frame k leaves at `start_tsc + k * hz / frame_rate`: the loop
//! busy-waits on the TSC for the slot, then busy-loops the port until it
//! takes the frame. Between sends it patches the variable fields of a
//! recycled template and extends the precomputed checksums by addition.

use std::net::{Ipv4Addr, Ipv6Addr};

use rand::distributions::{Distribution, Uniform};
use rand_mt::Mt19937GenRand64;
use tracing::info;

use crate::ce::CeRecord;
use crate::checksum::{finalize, finalize_nonzero, raw_sum};
use crate::config::{MacAddr, PortVarMode};
use crate::frame::{
    self, ipv4_offsets, ipv6_offsets, uncomplemented_checksum, write_u16, TestPayload,
};
use crate::port::TestPort;
use crate::runner::RunError;
use crate::tsc::{rdtsc, wait_until};
use crate::{Direction, TestMode, TEMPLATE_SLOTS, TOLERANCE};

/// Sender parameters identical for both directions.
#[derive(Debug, Clone)]
pub struct SenderCommon {
    pub ipv6_frame_size: u16,
    pub ipv4_frame_size: u16,
    pub frame_rate: u32,
    pub test_duration: u16,
    pub n: u32,
    pub m: u32,
    pub hz: u64,
    pub start_tsc: u64,
    pub num_port_sets: u32,
    pub ports_per_set: u32,
    pub tester_left_ipv6: Ipv6Addr,
    pub tester_right_ipv6: Ipv6Addr,
    pub tester_right_ipv4: Ipv4Addr,
    pub dmr_ipv6: Ipv6Addr,
    pub bg_sport_min: u16,
    pub bg_sport_max: u16,
    pub bg_dport_min: u16,
    pub bg_dport_max: u16,
}

/// Everything one direction's sender works from.
pub struct SenderJob<'a> {
    pub common: SenderCommon,
    pub direction: Direction,
    pub mode: TestMode,
    pub ce_array: &'a [CeRecord],
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub var_sport: PortVarMode,
    pub var_dport: PortVarMode,
    /// Configured range of the axis the port set does not constrain:
    /// destination ports forward, source ports reverse.
    pub wide_port_min: u16,
    pub wide_port_max: u16,
}

/// Timestamps the sender hands back for evaluation.
pub enum SenderTimestamps {
    None,
    /// One entry per tagged frame, indexed by tagged frame ID.
    Latency(Vec<u64>),
    /// One entry per frame, indexed by sequence counter.
    Pdv(Vec<u64>),
}

/// Offsets of the fields a sender patches, fixed per template kind.
#[derive(Clone, Copy)]
struct FieldOffsets {
    sport: usize,
    dport: usize,
    udp_chksum: usize,
    counter: usize,
}

const V4_FIELDS: FieldOffsets = FieldOffsets {
    sport: ipv4_offsets::UDP_SPORT,
    dport: ipv4_offsets::UDP_DPORT,
    udp_chksum: ipv4_offsets::UDP_CHKSUM,
    counter: ipv4_offsets::UDP_DATA + frame::PAYLOAD_COUNTER_OFFSET,
};

const V6_FIELDS: FieldOffsets = FieldOffsets {
    sport: ipv6_offsets::UDP_SPORT,
    dport: ipv6_offsets::UDP_DPORT,
    udp_chksum: ipv6_offsets::UDP_CHKSUM,
    counter: ipv6_offsets::UDP_DATA + frame::PAYLOAD_COUNTER_OFFSET,
};

/// RFC 4814 port variation state: the per-axis cursors, the per-port-set
/// saved cursors for the constrained axis, and the two MT64 engines.
struct PortState {
    var_sport: PortVarMode,
    var_dport: PortVarMode,
    wide_min: u16,
    wide_max: u16,
    ps_min: Vec<u16>,
    ps_max: Vec<u16>,
    curr_sport_for_ps: Vec<u16>,
    curr_dport_for_ps: Vec<u16>,
    sport: u16,
    dport: u16,
    bg_sport: u16,
    bg_dport: u16,
    bg_sport_min: u16,
    bg_sport_max: u16,
    bg_dport_min: u16,
    bg_dport_max: u16,
    gen_sport: Mt19937GenRand64,
    gen_dport: Mt19937GenRand64,
}

impl PortState {
    fn new(job: &SenderJob) -> Self {
        let cp = &job.common;
        let nps = cp.num_port_sets as usize;
        let pps = cp.ports_per_set;

        let mut ps_min = vec![0u16; nps];
        let mut ps_max = vec![0u16; nps];
        let mut curr_sport_for_ps = vec![0u16; nps];
        let mut curr_dport_for_ps = vec![0u16; nps];
        for i in 0..nps {
            ps_min[i] = (i as u32 * pps) as u16;
            ps_max[i] = ((i as u32 + 1) * pps - 1) as u16;
            curr_sport_for_ps[i] = match job.var_sport {
                PortVarMode::Decrement => ps_max[i],
                _ => ps_min[i],
            };
            curr_dport_for_ps[i] = match job.var_dport {
                PortVarMode::Decrement => ps_max[i],
                _ => ps_min[i],
            };
        }

        // The wide-axis cursor starts at its range edge; the port-set
        // axis cursor is restored from the per-set table before each use.
        let start = |mode: PortVarMode, min: u16, max: u16| match mode {
            PortVarMode::Decrement => max,
            _ => min,
        };
        let (sport, dport) = match job.direction {
            Direction::Forward => (0, start(job.var_dport, job.wide_port_min, job.wide_port_max)),
            Direction::Reverse => (start(job.var_sport, job.wide_port_min, job.wide_port_max), 0),
        };

        PortState {
            var_sport: job.var_sport,
            var_dport: job.var_dport,
            wide_min: job.wide_port_min,
            wide_max: job.wide_port_max,
            ps_min,
            ps_max,
            curr_sport_for_ps,
            curr_dport_for_ps,
            sport,
            dport,
            bg_sport: start(job.var_sport, cp.bg_sport_min, cp.bg_sport_max),
            bg_dport: start(job.var_dport, cp.bg_dport_min, cp.bg_dport_max),
            bg_sport_min: cp.bg_sport_min,
            bg_sport_max: cp.bg_sport_max,
            bg_dport_min: cp.bg_dport_min,
            bg_dport_max: cp.bg_dport_max,
            gen_sport: Mt19937GenRand64::new(rand::random()),
            gen_dport: Mt19937GenRand64::new(rand::random()),
        }
    }

    /// Next port numbers for a foreground frame of the CE owning `psid`.
    /// The port-set-constrained axis resumes walking the set where the
    /// last frame of the same psid left off.
    fn foreground_ports(&mut self, direction: Direction, psid: u16) -> (u16, u16) {
        let ps = usize::from(psid);
        let (s_min, s_max, d_min, d_max) = match direction {
            Direction::Forward => (self.ps_min[ps], self.ps_max[ps], self.wide_min, self.wide_max),
            Direction::Reverse => (self.wide_min, self.wide_max, self.ps_min[ps], self.ps_max[ps]),
        };

        match direction {
            Direction::Forward => {
                if self.var_sport != PortVarMode::Random {
                    self.sport = self.curr_sport_for_ps[ps];
                }
            }
            Direction::Reverse => {
                if self.var_dport != PortVarMode::Random {
                    self.dport = self.curr_dport_for_ps[ps];
                }
            }
        }

        let sp = vary_port(self.var_sport, &mut self.sport, s_min, s_max, &mut self.gen_sport);
        let dp = vary_port(self.var_dport, &mut self.dport, d_min, d_max, &mut self.gen_dport);

        match direction {
            Direction::Forward => self.curr_sport_for_ps[ps] = self.sport,
            Direction::Reverse => self.curr_dport_for_ps[ps] = self.dport,
        }
        (sp, dp)
    }

    /// Next port numbers for a background frame; fully independent of the
    /// foreground cursors.
    fn background_ports(&mut self) -> (u16, u16) {
        let sp = vary_port(
            self.var_sport,
            &mut self.bg_sport,
            self.bg_sport_min,
            self.bg_sport_max,
            &mut self.gen_sport,
        );
        let dp = vary_port(
            self.var_dport,
            &mut self.bg_dport,
            self.bg_dport_min,
            self.bg_dport_max,
            &mut self.gen_dport,
        );
        (sp, dp)
    }
}

/// One step of an axis: increment and decrement wrap inside [min, max],
/// pseudorandom draws uniformly from it.
#[inline]
fn vary_port(
    mode: PortVarMode,
    cursor: &mut u16,
    min: u16,
    max: u16,
    rng: &mut Mt19937GenRand64,
) -> u16 {
    match mode {
        PortVarMode::Increment => {
            let p = *cursor;
            *cursor = if p == max { min } else { p.wrapping_add(1) };
            p
        }
        PortVarMode::Decrement => {
            let p = *cursor;
            *cursor = if p == min { max } else { p.wrapping_sub(1) };
            p
        }
        PortVarMode::Random => Uniform::new_inclusive(min, max).sample(rng),
    }
}

/// Patches a foreground template in place and finalizes its checksums.
#[inline]
fn prepare_foreground(
    buf: &mut [u8],
    udp_start: u16,
    ipv4_start: u16,
    ce: &CeRecord,
    direction: Direction,
    ports: &mut PortState,
    counter: Option<u64>,
) {
    let mut chksum = u32::from(udp_start);
    let fields = match direction {
        Direction::Forward => {
            buf[ipv6_offsets::SRC_ADDR..ipv6_offsets::SRC_ADDR + 16].copy_from_slice(&ce.map_addr);
            chksum += u32::from(ce.map_addr_chksum);
            V6_FIELDS
        }
        Direction::Reverse => {
            buf[ipv4_offsets::DST_ADDR..ipv4_offsets::DST_ADDR + 4]
                .copy_from_slice(&ce.ipv4_addr);
            chksum += u32::from(ce.ipv4_addr_chksum);
            let ip_chksum = u32::from(ipv4_start) + u32::from(ce.ipv4_addr_chksum);
            write_u16(buf, ipv4_offsets::HDR_CHKSUM, finalize_nonzero(ip_chksum));
            V4_FIELDS
        }
    };

    let (sp, dp) = ports.foreground_ports(direction, ce.psid);
    write_u16(buf, fields.sport, sp);
    chksum += u32::from(sp);
    write_u16(buf, fields.dport, dp);
    chksum += u32::from(dp);

    if let Some(k) = counter {
        buf[fields.counter..fields.counter + 8].copy_from_slice(&k.to_le_bytes());
        chksum += raw_sum(&k.to_le_bytes());
    }

    let udp = match direction {
        // 0 means "no checksum" for UDP over IPv4.
        Direction::Reverse => finalize_nonzero(chksum),
        Direction::Forward => finalize(chksum),
    };
    write_u16(buf, fields.udp_chksum, udp);
}

/// Patches a background template in place and finalizes its checksum.
/// Background frames are always IPv6, so the zero-checksum substitution
/// of the IPv4 foreground path never applies here.
#[inline]
fn prepare_background(buf: &mut [u8], udp_start: u16, ports: &mut PortState, counter: Option<u64>) {
    let mut chksum = u32::from(udp_start);
    let (sp, dp) = ports.background_ports();
    write_u16(buf, V6_FIELDS.sport, sp);
    chksum += u32::from(sp);
    write_u16(buf, V6_FIELDS.dport, dp);
    chksum += u32::from(dp);

    if let Some(k) = counter {
        buf[V6_FIELDS.counter..V6_FIELDS.counter + 8].copy_from_slice(&k.to_le_bytes());
        chksum += raw_sum(&k.to_le_bytes());
    }

    write_u16(buf, V6_FIELDS.udp_chksum, finalize(chksum));
}

/// One latency-tagged template. Unlike the recycled normal templates its
/// uncomplemented start checksum is per-frame: the embedded ID differs.
struct TaggedTemplate {
    buf: Vec<u8>,
    foreground: bool,
    udp_start: u16,
}

/// Sends all test frames of one direction. Returns the timestamps the
/// evaluator needs for the given mode.
pub fn send_loop<P: TestPort>(job: &SenderJob, port: &mut P) -> Result<SenderTimestamps, RunError> {
    let cp = &job.common;
    let direction = job.direction;

    if job.ce_array.is_empty() {
        return Err(RunError::NoCeArray { direction });
    }

    let frames_to_send = u64::from(cp.test_duration) * u64::from(cp.frame_rate);
    let payload = match job.mode {
        TestMode::Pdv { .. } => TestPayload::Pdv,
        _ => TestPayload::Normal,
    };

    // Background traffic runs between the tester's own interfaces; the
    // foreground endpoints depend on the direction.
    let (bg_src, bg_dst) = match direction {
        Direction::Forward => (cp.tester_left_ipv6, cp.tester_right_ipv6),
        Direction::Reverse => (cp.tester_right_ipv6, cp.tester_left_ipv6),
    };

    let make_fg = |p: TestPayload| match direction {
        Direction::Forward => frame::test_frame_ipv6(
            cp.ipv6_frame_size,
            job.dst_mac,
            job.src_mac,
            Ipv6Addr::UNSPECIFIED,
            cp.dmr_ipv6,
            p,
        ),
        Direction::Reverse => frame::test_frame_ipv4(
            cp.ipv4_frame_size,
            job.dst_mac,
            job.src_mac,
            cp.tester_right_ipv4,
            Ipv4Addr::UNSPECIFIED,
            p,
        ),
    };
    let make_bg = |p: TestPayload| {
        frame::test_frame_ipv6(cp.ipv6_frame_size, job.dst_mac, job.src_mac, bg_src, bg_dst, p)
    };

    let mut fg_bufs: Vec<Vec<u8>> = (0..TEMPLATE_SLOTS).map(|_| make_fg(payload)).collect();
    let mut bg_bufs: Vec<Vec<u8>> = (0..TEMPLATE_SLOTS).map(|_| make_bg(payload)).collect();

    let fg_fields = match direction {
        Direction::Forward => V6_FIELDS,
        Direction::Reverse => V4_FIELDS,
    };
    let fg_udp_start = uncomplemented_checksum(&fg_bufs[0], fg_fields.udp_chksum);
    let bg_udp_start = uncomplemented_checksum(&bg_bufs[0], V6_FIELDS.udp_chksum);
    let fg_ipv4_start = match direction {
        Direction::Reverse => uncomplemented_checksum(&fg_bufs[0], ipv4_offsets::HDR_CHKSUM),
        Direction::Forward => 0,
    };

    // Latency bookkeeping: which frame indices carry a tag, and the
    // pre-built tagged templates in tag order.
    let mut tagged: Vec<TaggedTemplate> = Vec::new();
    let (start_latency_frame, latency_test_frames, num_of_tagged) = match job.mode {
        TestMode::Latency {
            first_tagged_delay,
            num_of_tagged,
        } => {
            let start = u64::from(first_tagged_delay) * u64::from(cp.frame_rate);
            let window = u64::from(cp.test_duration - first_tagged_delay) * u64::from(cp.frame_rate);
            for i in 0..u64::from(num_of_tagged) {
                let k = start + i * window / u64::from(num_of_tagged);
                let foreground = k % u64::from(cp.n) < u64::from(cp.m);
                let buf = if foreground {
                    make_fg(TestPayload::Latency(i as u16))
                } else {
                    make_bg(TestPayload::Latency(i as u16))
                };
                let chk_off = if foreground {
                    fg_fields.udp_chksum
                } else {
                    V6_FIELDS.udp_chksum
                };
                let udp_start = uncomplemented_checksum(&buf, chk_off);
                tagged.push(TaggedTemplate {
                    buf,
                    foreground,
                    udp_start,
                });
            }
            (start, window, u64::from(num_of_tagged))
        }
        _ => (0, 0, 0),
    };

    let mut ports = PortState::new(job);
    let mut stamps = match job.mode {
        TestMode::Latency { num_of_tagged, .. } => {
            SenderTimestamps::Latency(vec![0u64; usize::from(num_of_tagged)])
        }
        TestMode::Pdv { .. } => SenderTimestamps::Pdv(vec![0u64; frames_to_send as usize]),
        TestMode::Throughput => SenderTimestamps::None,
    };

    let n = u64::from(cp.n);
    let m = u64::from(cp.m);
    let mut slot = 0usize;
    let mut current_ce = 0usize;
    let mut tagged_sent = 0usize;
    let mut send_next_latency_frame = match job.mode {
        TestMode::Latency { .. } => start_latency_frame,
        _ => u64::MAX,
    };

    for k in 0..frames_to_send {
        let foreground = k % n < m;
        let is_tagged = k == send_next_latency_frame;
        let counter = match job.mode {
            TestMode::Pdv { .. } => Some(k),
            _ => None,
        };

        let buf: &[u8] = if is_tagged {
            let t = &mut tagged[tagged_sent];
            if t.foreground {
                prepare_foreground(
                    &mut t.buf,
                    t.udp_start,
                    fg_ipv4_start,
                    &job.ce_array[current_ce],
                    direction,
                    &mut ports,
                    counter,
                );
            } else {
                prepare_background(&mut t.buf, t.udp_start, &mut ports, counter);
            }
            &tagged[tagged_sent].buf
        } else if foreground {
            prepare_foreground(
                &mut fg_bufs[slot],
                fg_udp_start,
                fg_ipv4_start,
                &job.ce_array[current_ce],
                direction,
                &mut ports,
                counter,
            );
            &fg_bufs[slot]
        } else {
            prepare_background(&mut bg_bufs[slot], bg_udp_start, &mut ports, counter);
            &bg_bufs[slot]
        };

        wait_until(cp.start_tsc + (k as u128 * cp.hz as u128 / u64::from(cp.frame_rate) as u128) as u64);
        while !port.tx_burst(buf)? {}

        match &mut stamps {
            SenderTimestamps::Pdv(ts) => ts[k as usize] = rdtsc(),
            SenderTimestamps::Latency(ts) if is_tagged => {
                ts[tagged_sent] = rdtsc();
                tagged_sent += 1;
                send_next_latency_frame =
                    start_latency_frame + tagged_sent as u64 * latency_test_frames / num_of_tagged;
            }
            _ => {}
        }
        if !is_tagged {
            slot = (slot + 1) % TEMPLATE_SLOTS;
        }
        current_ce = (current_ce + 1) % job.ce_array.len();
    }

    let elapsed_seconds = (rdtsc() - cp.start_tsc) as f64 / cp.hz as f64;
    info!("{direction} sender's sending took {elapsed_seconds:.10} seconds");
    let limit = f64::from(cp.test_duration) * TOLERANCE;
    if elapsed_seconds > limit {
        return Err(RunError::DurationExceeded { direction, limit });
    }
    println!("{direction} frames sent: {frames_to_send}");

    Ok(stamps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ce::{build_ce_array, random_permutation};
    use crate::frame::{
        read_u16, recompute_ipv4_header_checksum, recompute_udp_checksum, MAGIC_LATENCY,
        MAGIC_TEST,
    };
    use crate::map::Bmr;
    use crate::port::{LoopbackPort, RxFrame, MAX_PKT_BURST};
    use crate::tsc::tsc_hz;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn example_bmr() -> Bmr {
        Bmr {
            ipv6_prefix: "2001:db8:ce::".parse().unwrap(),
            ipv6_prefix_length: 51,
            ipv4_prefix: "198.18.0.0".parse().unwrap(),
            ipv4_prefix_length: 24,
            ea_length: 13,
        }
    }

    fn make_ces(bmr: &Bmr, count: usize, seed: u64) -> Vec<CeRecord> {
        let derived = bmr.derive().unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let perm = random_permutation(derived.ipv4_suffix_length, derived.psid_length, &mut rng);
        build_ce_array(bmr, &derived, count, &perm).unwrap()
    }

    fn common(bmr: &Bmr, frame_rate: u32, n: u32, m: u32) -> SenderCommon {
        let derived = bmr.derive().unwrap();
        SenderCommon {
            ipv6_frame_size: 84,
            ipv4_frame_size: 64,
            frame_rate,
            test_duration: 1,
            n,
            m,
            hz: tsc_hz(),
            start_tsc: rdtsc(),
            num_port_sets: derived.num_port_sets,
            ports_per_set: derived.ports_per_set,
            tester_left_ipv6: "2001:2::2".parse().unwrap(),
            tester_right_ipv6: "2001:2::8".parse().unwrap(),
            tester_right_ipv4: "198.19.0.2".parse().unwrap(),
            dmr_ipv6: "64:ff9b::c613:2".parse().unwrap(),
            bg_sport_min: 1024,
            bg_sport_max: 65535,
            bg_dport_min: 1,
            bg_dport_max: 49151,
        }
    }

    // Pacing tests must not compete for cores: a second concurrent
    // busy loop can push a sender past the duration tolerance.
    static PACING: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn pacing_guard() -> std::sync::MutexGuard<'static, ()> {
        PACING.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn drain(port: &mut LoopbackPort) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut bufs = vec![RxFrame::empty(); MAX_PKT_BURST];
        loop {
            let n = port.rx_burst(&mut bufs).unwrap();
            if n == 0 {
                return frames;
            }
            frames.extend(bufs[..n].iter().map(|f| f.bytes().to_vec()));
        }
    }

    #[test]
    fn forward_throughput_mixes_foreground_and_background() {
        let _serial = pacing_guard();
        let bmr = example_bmr();
        let ces = make_ces(&bmr, 1, 1);
        let job = SenderJob {
            common: common(&bmr, 2000, 2, 1),
            direction: Direction::Forward,
            mode: TestMode::Throughput,
            ce_array: &ces,
            dst_mac: "a0:36:9f:c5:e6:58".parse().unwrap(),
            src_mac: "a0:36:9f:c5:fa:1c".parse().unwrap(),
            var_sport: PortVarMode::Random,
            var_dport: PortVarMode::Random,
            wide_port_min: 1,
            wide_port_max: 49151,
        };
        let (mut tx, mut peer) = LoopbackPort::pair();
        send_loop(&job, &mut tx).unwrap();

        let frames = drain(&mut peer);
        assert_eq!(frames.len(), 2000);

        let dmr = job.common.dmr_ipv6.octets();
        let ps_lo = u32::from(ces[0].psid) * job.common.ports_per_set;
        let ps_hi = ps_lo + job.common.ports_per_set - 1;
        let mut foreground = 0;
        let mut background = 0;
        for (k, f) in frames.iter().enumerate() {
            assert_eq!(read_u16(f, 12), frame::ETHERTYPE_IPV6);
            assert_eq!(read_u16(f, ipv6_offsets::UDP_CHKSUM), recompute_udp_checksum(f));
            let sport = u32::from(read_u16(f, ipv6_offsets::UDP_SPORT));
            let dport = u32::from(read_u16(f, ipv6_offsets::UDP_DPORT));
            if k % 2 == 0 {
                // Foreground: CE map address towards the DMR, source port
                // inside the CE's port set, destination port in the
                // configured wide range.
                foreground += 1;
                assert_eq!(&f[ipv6_offsets::SRC_ADDR..ipv6_offsets::SRC_ADDR + 16], &ces[0].map_addr);
                assert_eq!(&f[ipv6_offsets::DST_ADDR..ipv6_offsets::DST_ADDR + 16], &dmr);
                assert!((ps_lo..=ps_hi).contains(&sport), "sport {sport} outside port set");
                assert!((1..=49151).contains(&dport));
            } else {
                // Background: tester left to tester right.
                background += 1;
                let src: std::net::Ipv6Addr = "2001:2::2".parse().unwrap();
                let dst: std::net::Ipv6Addr = "2001:2::8".parse().unwrap();
                assert_eq!(&f[ipv6_offsets::SRC_ADDR..ipv6_offsets::SRC_ADDR + 16], &src.octets());
                assert_eq!(&f[ipv6_offsets::DST_ADDR..ipv6_offsets::DST_ADDR + 16], &dst.octets());
                assert!((1024..=65535).contains(&sport));
                assert!((1..=49151).contains(&dport));
            }
        }
        assert_eq!(foreground, 1000);
        assert_eq!(background, 1000);
    }

    #[test]
    fn reverse_incremental_checksums_match_recomputation() {
        let _serial = pacing_guard();
        let bmr = example_bmr();
        let ces = make_ces(&bmr, 50, 2);
        let job = SenderJob {
            common: common(&bmr, 1000, 2, 2), // all foreground
            direction: Direction::Reverse,
            mode: TestMode::Throughput,
            ce_array: &ces,
            dst_mac: "a0:36:9f:c5:e6:5a".parse().unwrap(),
            src_mac: "a0:36:9f:c5:fa:1e".parse().unwrap(),
            var_sport: PortVarMode::Random,
            var_dport: PortVarMode::Random,
            wide_port_min: 1024,
            wide_port_max: 65535,
        };
        let (mut tx, mut peer) = LoopbackPort::pair();
        send_loop(&job, &mut tx).unwrap();

        let frames = drain(&mut peer);
        assert_eq!(frames.len(), 1000);
        for (k, f) in frames.iter().enumerate() {
            let ce = &ces[k % ces.len()];
            assert_eq!(read_u16(f, 12), frame::ETHERTYPE_IPV4);
            assert_eq!(&f[ipv4_offsets::DST_ADDR..ipv4_offsets::DST_ADDR + 4], &ce.ipv4_addr);
            assert_eq!(
                read_u16(f, ipv4_offsets::HDR_CHKSUM),
                recompute_ipv4_header_checksum(f),
                "IPv4 header checksum of frame {k}"
            );
            assert_eq!(
                read_u16(f, ipv4_offsets::UDP_CHKSUM),
                recompute_udp_checksum(f),
                "UDP checksum of frame {k}"
            );
            let dport = u32::from(read_u16(f, ipv4_offsets::UDP_DPORT));
            let lo = u32::from(ce.psid) * job.common.ports_per_set;
            assert!((lo..lo + job.common.ports_per_set).contains(&dport));
        }
    }

    #[test]
    fn reverse_background_frames_stay_ipv6_with_plain_checksums() {
        let _serial = pacing_guard();
        let bmr = example_bmr();
        let ces = make_ces(&bmr, 10, 7);
        let job = SenderJob {
            common: common(&bmr, 2000, 2, 1),
            direction: Direction::Reverse,
            mode: TestMode::Throughput,
            ce_array: &ces,
            dst_mac: "a0:36:9f:c5:e6:5a".parse().unwrap(),
            src_mac: "a0:36:9f:c5:fa:1e".parse().unwrap(),
            var_sport: PortVarMode::Random,
            var_dport: PortVarMode::Random,
            wide_port_min: 1024,
            wide_port_max: 65535,
        };
        let (mut tx, mut peer) = LoopbackPort::pair();
        send_loop(&job, &mut tx).unwrap();

        let frames = drain(&mut peer);
        assert_eq!(frames.len(), 2000);

        let bg_src: std::net::Ipv6Addr = "2001:2::8".parse().unwrap();
        let bg_dst: std::net::Ipv6Addr = "2001:2::2".parse().unwrap();
        let mut background = 0;
        for (k, f) in frames.iter().enumerate() {
            if k % 2 == 0 {
                assert_eq!(read_u16(f, 12), frame::ETHERTYPE_IPV4);
                continue;
            }
            // Background stays native IPv6, tester right to tester left.
            background += 1;
            assert_eq!(read_u16(f, 12), frame::ETHERTYPE_IPV6);
            assert_eq!(
                &f[ipv6_offsets::SRC_ADDR..ipv6_offsets::SRC_ADDR + 16],
                &bg_src.octets()
            );
            assert_eq!(
                &f[ipv6_offsets::DST_ADDR..ipv6_offsets::DST_ADDR + 16],
                &bg_dst.octets()
            );
            assert_eq!(
                read_u16(f, ipv6_offsets::UDP_CHKSUM),
                recompute_udp_checksum(f),
                "background frame {k}"
            );
            let sport = u32::from(read_u16(f, ipv6_offsets::UDP_SPORT));
            let dport = u32::from(read_u16(f, ipv6_offsets::UDP_DPORT));
            assert!((1024..=65535).contains(&sport));
            assert!((1..=49151).contains(&dport));
        }
        assert_eq!(background, 1000);
    }

    #[test]
    fn port_set_increment_resumes_per_psid() {
        let _serial = pacing_guard();
        // Narrow port sets so the wrap is visible: PSID length 13 leaves
        // 8 ports per set.
        let bmr = Bmr {
            ipv6_prefix: "2001:db8::".parse().unwrap(),
            ipv6_prefix_length: 43,
            ipv4_prefix: "198.18.0.0".parse().unwrap(),
            ipv4_prefix_length: 24,
            ea_length: 21,
        };
        let derived = bmr.derive().unwrap();
        assert_eq!(derived.ports_per_set, 8);

        let ces = make_ces(&bmr, 1, 3);
        let job = SenderJob {
            common: common(&bmr, 1000, 2, 2), // all foreground
            direction: Direction::Reverse,
            mode: TestMode::Throughput,
            ce_array: &ces,
            dst_mac: "a0:36:9f:c5:e6:5a".parse().unwrap(),
            src_mac: "a0:36:9f:c5:fa:1e".parse().unwrap(),
            var_sport: PortVarMode::Increment,
            var_dport: PortVarMode::Increment,
            wide_port_min: 1024,
            wide_port_max: 65535,
        };
        let (mut tx, mut peer) = LoopbackPort::pair();
        send_loop(&job, &mut tx).unwrap();

        let frames = drain(&mut peer);
        let lo = ces[0].psid * 8;
        for (k, f) in frames.iter().enumerate() {
            // Same psid every frame: dport walks the set and wraps.
            let expected = lo + (k as u16 % 8);
            assert_eq!(read_u16(f, ipv4_offsets::UDP_DPORT), expected, "frame {k}");
        }
        // The wide source-port axis walks its own range independently.
        assert_eq!(read_u16(&frames[0], ipv4_offsets::UDP_SPORT), 1024);
        assert_eq!(read_u16(&frames[999], ipv4_offsets::UDP_SPORT), 1024 + 999);
    }

    #[test]
    fn pdv_counters_are_sequential_and_checksummed() {
        let _serial = pacing_guard();
        let bmr = example_bmr();
        let ces = make_ces(&bmr, 3, 4);
        let job = SenderJob {
            common: common(&bmr, 1000, 3, 2),
            direction: Direction::Forward,
            mode: TestMode::Pdv { frame_timeout: 0 },
            ce_array: &ces,
            dst_mac: "a0:36:9f:c5:e6:58".parse().unwrap(),
            src_mac: "a0:36:9f:c5:fa:1c".parse().unwrap(),
            var_sport: PortVarMode::Random,
            var_dport: PortVarMode::Random,
            wide_port_min: 1,
            wide_port_max: 49151,
        };
        let (mut tx, mut peer) = LoopbackPort::pair();
        let stamps = send_loop(&job, &mut tx).unwrap();

        let SenderTimestamps::Pdv(snd_ts) = stamps else {
            panic!("expected PDV timestamps");
        };
        assert_eq!(snd_ts.len(), 1000);
        assert!(snd_ts.iter().all(|&ts| ts != 0));

        let frames = drain(&mut peer);
        for (k, f) in frames.iter().enumerate() {
            let counter_off = ipv6_offsets::UDP_DATA + frame::PAYLOAD_COUNTER_OFFSET;
            let counter =
                u64::from_le_bytes(f[counter_off..counter_off + 8].try_into().unwrap());
            assert_eq!(counter, k as u64);
            assert_eq!(
                read_u16(f, ipv6_offsets::UDP_CHKSUM),
                recompute_udp_checksum(f),
                "frame {k}"
            );
            // Background frames carry the counter too.
            let is_fg = (k % 3) < 2;
            let dst = &f[ipv6_offsets::DST_ADDR..ipv6_offsets::DST_ADDR + 16];
            assert_eq!(dst == &job.common.dmr_ipv6.octets()[..], is_fg);
        }
    }

    #[test]
    fn latency_tags_land_on_schedule() {
        let _serial = pacing_guard();
        let bmr = example_bmr();
        let ces = make_ces(&bmr, 5, 5);
        let job = SenderJob {
            common: common(&bmr, 1000, 2, 1),
            direction: Direction::Forward,
            mode: TestMode::Latency {
                first_tagged_delay: 0,
                num_of_tagged: 4,
            },
            ce_array: &ces,
            dst_mac: "a0:36:9f:c5:e6:58".parse().unwrap(),
            src_mac: "a0:36:9f:c5:fa:1c".parse().unwrap(),
            var_sport: PortVarMode::Random,
            var_dport: PortVarMode::Random,
            wide_port_min: 1,
            wide_port_max: 49151,
        };
        let (mut tx, mut peer) = LoopbackPort::pair();
        let stamps = send_loop(&job, &mut tx).unwrap();

        let SenderTimestamps::Latency(send_ts) = stamps else {
            panic!("expected latency timestamps");
        };
        assert_eq!(send_ts.len(), 4);
        assert!(send_ts.iter().all(|&ts| ts != 0));

        let frames = drain(&mut peer);
        assert_eq!(frames.len(), 1000);
        let mut tagged_at = Vec::new();
        for (k, f) in frames.iter().enumerate() {
            assert_eq!(
                read_u16(f, ipv6_offsets::UDP_CHKSUM),
                recompute_udp_checksum(f),
                "frame {k}"
            );
            let magic = &f[ipv6_offsets::UDP_DATA..ipv6_offsets::UDP_DATA + 8];
            if magic == &MAGIC_LATENCY {
                let id_off = ipv6_offsets::UDP_DATA + frame::PAYLOAD_ID_OFFSET;
                let id = u16::from_le_bytes([f[id_off], f[id_off + 1]]);
                assert_eq!(usize::from(id), tagged_at.len());
                tagged_at.push(k);
            } else {
                assert_eq!(magic, &MAGIC_TEST);
            }
        }
        // 4 tags over a 1000-frame window starting at frame 0.
        assert_eq!(tagged_at, vec![0, 250, 500, 750]);
    }

    #[test]
    fn latency_delay_defers_first_tag() {
        let _serial = pacing_guard();
        let bmr = example_bmr();
        let ces = make_ces(&bmr, 5, 6);
        let mut common = common(&bmr, 1000, 2, 1);
        common.test_duration = 2;
        let job = SenderJob {
            common,
            direction: Direction::Forward,
            mode: TestMode::Latency {
                first_tagged_delay: 1,
                num_of_tagged: 8,
            },
            ce_array: &ces,
            dst_mac: "a0:36:9f:c5:e6:58".parse().unwrap(),
            src_mac: "a0:36:9f:c5:fa:1c".parse().unwrap(),
            var_sport: PortVarMode::Random,
            var_dport: PortVarMode::Random,
            wide_port_min: 1,
            wide_port_max: 49151,
        };
        let (mut tx, mut peer) = LoopbackPort::pair();
        send_loop(&job, &mut tx).unwrap();

        let frames = drain(&mut peer);
        assert_eq!(frames.len(), 2000);
        let tagged_at: Vec<usize> = frames
            .iter()
            .enumerate()
            .filter(|(_, f)| &f[ipv6_offsets::UDP_DATA..ipv6_offsets::UDP_DATA + 8] == MAGIC_LATENCY)
            .map(|(k, _)| k)
            .collect();
        // One second of delay, then 8 tags spread over the second half.
        assert_eq!(
            tagged_at,
            vec![1000, 1125, 1250, 1375, 1500, 1625, 1750, 1875]
        );
    }

    #[test]
    fn empty_ce_array_is_fatal() {
        let bmr = example_bmr();
        let job = SenderJob {
            common: common(&bmr, 1000, 2, 1),
            direction: Direction::Forward,
            mode: TestMode::Throughput,
            ce_array: &[],
            dst_mac: "a0:36:9f:c5:e6:58".parse().unwrap(),
            src_mac: "a0:36:9f:c5:fa:1c".parse().unwrap(),
            var_sport: PortVarMode::Random,
            var_dport: PortVarMode::Random,
            wide_port_min: 1,
            wide_port_max: 49151,
        };
        let (mut tx, _peer) = LoopbackPort::pair();
        assert!(matches!(
            send_loop(&job, &mut tx),
            Err(RunError::NoCeArray { .. })
        ));
    }
}
