//! MAP-T address arithmetic
//!
//! Derives the working values of a Basic Mapping Rule, composes MAP
//! addresses from EA-bit pairs (RFC 7597) and embeds IPv4 addresses into
//! the Default Mapping Rule prefix (RFC 6052 section 2.2).

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// DMR prefix lengths admitted by RFC 6052 section 2.2.
pub const DMR_PREFIX_LENGTHS: [u8; 6] = [32, 40, 48, 56, 64, 96];

#[derive(Debug, Error)]
pub enum MapError {
    #[error("BMR EA-bits length {ea} is shorter than the IPv4 suffix length {suffix}")]
    EaShorterThanSuffix { ea: u8, suffix: u8 },
    #[error("PSID length {0} exceeds the 16-bit port space")]
    PsidTooLong(u8),
    #[error("end-user IPv6 prefix length {0} exceeds 64 bits")]
    EndUserPrefixTooLong(u16),
    #[error("number of CEs ({requested}) exceeds what the EA-bits allow ({available})")]
    TooManyCes { requested: u64, available: u64 },
}

/// A Basic Mapping Rule as configured.
#[derive(Debug, Clone, Copy)]
pub struct Bmr {
    pub ipv6_prefix: Ipv6Addr,
    pub ipv6_prefix_length: u8,
    pub ipv4_prefix: Ipv4Addr,
    pub ipv4_prefix_length: u8,
    pub ea_length: u8,
}

/// Values derived from a [`Bmr`], fixed for the whole run.
#[derive(Debug, Clone, Copy)]
pub struct BmrDerived {
    pub ipv4_suffix_length: u8,
    pub psid_length: u8,
    pub num_port_sets: u32,
    pub ports_per_set: u32,
    /// Number of usable (suffix, psid) pairs. Suffix all-zeros and
    /// all-ones are excluded as subnet and broadcast addresses.
    pub ea_cardinality: u64,
}

impl Bmr {
    pub fn derive(&self) -> Result<BmrDerived, MapError> {
        let suffix_length = 32 - self.ipv4_prefix_length;
        if self.ea_length < suffix_length {
            return Err(MapError::EaShorterThanSuffix {
                ea: self.ea_length,
                suffix: suffix_length,
            });
        }
        let psid_length = self.ea_length - suffix_length;
        if psid_length > 16 {
            return Err(MapError::PsidTooLong(psid_length));
        }
        let end_user_bits = u16::from(self.ipv6_prefix_length) + u16::from(self.ea_length);
        if end_user_bits > 64 {
            return Err(MapError::EndUserPrefixTooLong(end_user_bits));
        }
        let num_port_sets = 1u32 << psid_length;
        let num_suffixes = (1u64 << suffix_length).saturating_sub(2);
        Ok(BmrDerived {
            ipv4_suffix_length: suffix_length,
            psid_length,
            num_port_sets,
            ports_per_set: 65536 / num_port_sets,
            ea_cardinality: num_suffixes * u64::from(num_port_sets),
        })
    }

    /// The CE's public IPv4 address: rule prefix with the suffix OR-ed in.
    pub fn ce_ipv4(&self, suffix: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ipv4_prefix) | suffix)
    }

    /// The MAP IPv6 address of the CE identified by (suffix, psid):
    /// end-user prefix (rule prefix || suffix || psid) in the upper 64
    /// bits, interface identifier (RFC 7597 section 6) in the lower 64.
    pub fn map_address(&self, derived: &BmrDerived, suffix: u32, psid: u16) -> Ipv6Addr {
        let prefix = self.ipv6_prefix.octets();
        let whole_bytes = usize::from(self.ipv6_prefix_length / 8);
        let stray_bits = u32::from(self.ipv6_prefix_length % 8);

        let mut end_user_prefix: u64 = 0;
        for byte in &prefix[..whole_bytes] {
            end_user_prefix = (end_user_prefix << 8) | u64::from(*byte);
        }
        if stray_bits != 0 {
            end_user_prefix = (end_user_prefix << stray_bits)
                | u64::from(prefix[whole_bytes] >> (8 - stray_bits));
        }
        end_user_prefix = (end_user_prefix << derived.ipv4_suffix_length) | u64::from(suffix);
        end_user_prefix = (end_user_prefix << derived.psid_length) | u64::from(psid);

        let ipv4 = u64::from(u32::from(self.ce_ipv4(suffix)));
        let interface_id = (ipv4 << 16) | u64::from(psid);

        concat64(end_user_prefix, interface_id)
    }
}

/// Concatenates two 64-bit halves into an IPv6 address.
fn concat64(upper: u64, lower: u64) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[..8].copy_from_slice(&upper.to_be_bytes());
    octets[8..].copy_from_slice(&lower.to_be_bytes());
    Ipv6Addr::from(octets)
}

/// Embeds `ipv4` into `prefix` per RFC 6052 section 2.2. For prefixes
/// shorter than /96 the address crosses the reserved u-octet (bits
/// 64..72), which stays zero.
pub fn dmr_address(prefix: Ipv6Addr, prefix_length: u8, ipv4: Ipv4Addr) -> Ipv6Addr {
    let mut octets = prefix.octets();
    let v4 = ipv4.octets();
    if prefix_length >= 96 {
        octets[12..16].copy_from_slice(&v4);
    } else {
        let before_u = usize::from((64 - prefix_length) / 8);
        for (i, byte) in v4[..before_u].iter().enumerate() {
            octets[8 - before_u + i] = *byte;
        }
        octets[8] = 0;
        for (i, byte) in v4[before_u..].iter().enumerate() {
            octets[9 + i] = *byte;
        }
    }
    Ipv6Addr::from(octets)
}

/// Recovers the IPv4 address embedded by [`dmr_address`].
pub fn dmr_extract(addr: Ipv6Addr, prefix_length: u8) -> Ipv4Addr {
    let octets = addr.octets();
    let mut v4 = [0u8; 4];
    if prefix_length >= 96 {
        v4.copy_from_slice(&octets[12..16]);
    } else {
        let before_u = usize::from((64 - prefix_length) / 8);
        v4[..before_u].copy_from_slice(&octets[8 - before_u..8]);
        v4[before_u..].copy_from_slice(&octets[9..9 + 4 - before_u]);
    }
    Ipv4Addr::from(v4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn example_bmr() -> Bmr {
        Bmr {
            ipv6_prefix: "2001:db8:ce::".parse().unwrap(),
            ipv6_prefix_length: 51,
            ipv4_prefix: "198.18.0.0".parse().unwrap(),
            ipv4_prefix_length: 24,
            ea_length: 13,
        }
    }

    #[test]
    fn derive_example_rule() {
        let d = example_bmr().derive().unwrap();
        assert_eq!(d.ipv4_suffix_length, 8);
        assert_eq!(d.psid_length, 5);
        assert_eq!(d.num_port_sets, 32);
        assert_eq!(d.ports_per_set, 2048);
        assert_eq!(d.ea_cardinality, 254 * 32);
    }

    #[test]
    fn derive_rejects_short_ea() {
        let mut bmr = example_bmr();
        bmr.ea_length = 6;
        assert!(matches!(
            bmr.derive(),
            Err(MapError::EaShorterThanSuffix { .. })
        ));
    }

    #[test]
    fn derive_suffix_only_rule() {
        // PSID length 0: one port set covering the whole range.
        let mut bmr = example_bmr();
        bmr.ea_length = 8;
        let d = bmr.derive().unwrap();
        assert_eq!(d.psid_length, 0);
        assert_eq!(d.num_port_sets, 1);
        assert_eq!(d.ports_per_set, 65536);
    }

    #[test]
    fn map_address_layout() {
        let bmr = example_bmr();
        let d = bmr.derive().unwrap();
        let addr = bmr.map_address(&d, 0x2a, 5);
        let octets = addr.octets();

        // Upper half: 51 prefix bits, then 8 suffix bits, then 5 psid bits.
        let upper = u64::from_be_bytes(octets[..8].try_into().unwrap());
        assert_eq!(upper, 0x20010db800ce0000u64 | (0x2au64 << 5) | 5);
        // Lower half: 16 zero bits, IPv4 address, psid.
        let lower = u64::from_be_bytes(octets[8..].try_into().unwrap());
        assert_eq!(lower, (u64::from(u32::from(bmr.ce_ipv4(0x2a))) << 16) | 5);
        assert_eq!(bmr.ce_ipv4(0x2a), "198.18.0.42".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn dmr_96_prefix() {
        let dmr: Ipv6Addr = "64:ff9b::".parse().unwrap();
        let addr = dmr_address(dmr, 96, "192.0.2.1".parse().unwrap());
        assert_eq!(addr, "64:ff9b::c000:201".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn dmr_64_prefix_keeps_u_octet_zero() {
        let dmr: Ipv6Addr = "64:ff9b::".parse().unwrap();
        let addr = dmr_address(dmr, 64, "192.0.2.1".parse().unwrap());
        let octets = addr.octets();
        assert_eq!(octets[8], 0);
        assert_eq!(&octets[9..13], &[192, 0, 2, 1]);
    }

    #[test]
    fn dmr_40_prefix_splits_around_u_octet() {
        let dmr: Ipv6Addr = "64:ff9b::".parse().unwrap();
        let addr = dmr_address(dmr, 40, "192.0.2.1".parse().unwrap());
        let octets = addr.octets();
        assert_eq!(&octets[5..8], &[192, 0, 2]);
        assert_eq!(octets[8], 0);
        assert_eq!(octets[9], 1);
    }

    proptest! {
        /// Embed followed by extract is the identity for every admitted
        /// prefix length.
        #[test]
        fn dmr_round_trip(a in any::<u32>(), len_idx in 0usize..DMR_PREFIX_LENGTHS.len()) {
            let len = DMR_PREFIX_LENGTHS[len_idx];
            let ipv4 = Ipv4Addr::from(a);
            let dmr: Ipv6Addr = "64:ff9b::".parse().unwrap();
            prop_assert_eq!(dmr_extract(dmr_address(dmr, len, ipv4), len), ipv4);
        }
    }
}
