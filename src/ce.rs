//! Simulated CE population
//!
//! A measurement run impersonates `num_of_CEs` customer edges. Their
//! (IPv4 suffix, PSID) pairs are the first elements of a uniform random
//! permutation of the whole EA-bit space, so the population is
//! collision-free and pseudorandom at the same time. Everything a sender
//! touches per frame (addresses, checksums) is precomputed here.

use rand::Rng;

use crate::checksum::folded_sum;
use crate::map::{Bmr, BmrDerived, MapError};

/// One point of the EA-bit lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EaPair {
    pub suffix: u32,
    pub psid: u16,
}

/// Everything the sender needs about one simulated CE.
#[derive(Debug, Clone, Copy)]
pub struct CeRecord {
    /// Public IPv4 address, network byte order.
    pub ipv4_addr: [u8; 4],
    /// Uncomplemented one's-complement sum of `ipv4_addr`.
    pub ipv4_addr_chksum: u16,
    /// MAP IPv6 address, network byte order.
    pub map_addr: [u8; 16],
    /// Uncomplemented one's-complement sum of `map_addr`.
    pub map_addr_chksum: u16,
    pub psid: u16,
}

/// Durstenfeld's inside-out Fisher-Yates shuffle over the EA lattice,
/// enumerated column-major: index -> (suffix = index / 2^P + 1,
/// psid = index mod 2^P). Suffix 0 and 2^L - 1 never enter the lattice.
pub fn random_permutation<R: Rng>(suffix_length: u8, psid_length: u8, rng: &mut R) -> Vec<EaPair> {
    let ysize = 1u64 << psid_length;
    let size = (1u64 << suffix_length).saturating_sub(2) * ysize;
    if size == 0 {
        return Vec::new();
    }

    let mut array = Vec::with_capacity(size as usize);
    array.push(EaPair { suffix: 1, psid: 0 });
    for index in 1..size {
        let pair = EaPair {
            suffix: (index / ysize) as u32 + 1,
            psid: (index % ysize) as u16,
        };
        let j = rng.gen_range(0..=index) as usize;
        if j == index as usize {
            array.push(pair);
        } else {
            array.push(array[j]);
            array[j] = pair;
        }
    }
    array
}

/// Builds the CE array from the first `num_of_ces` permuted EA pairs.
pub fn build_ce_array(
    bmr: &Bmr,
    derived: &BmrDerived,
    num_of_ces: usize,
    permutation: &[EaPair],
) -> Result<Vec<CeRecord>, MapError> {
    if num_of_ces > permutation.len() {
        return Err(MapError::TooManyCes {
            requested: num_of_ces as u64,
            available: permutation.len() as u64,
        });
    }

    let mut ces = Vec::with_capacity(num_of_ces);
    for ea in &permutation[..num_of_ces] {
        let ipv4_addr = bmr.ce_ipv4(ea.suffix).octets();
        let map_addr = bmr.map_address(derived, ea.suffix, ea.psid).octets();
        ces.push(CeRecord {
            ipv4_addr,
            ipv4_addr_chksum: folded_sum(&ipv4_addr),
            map_addr,
            map_addr_chksum: folded_sum(&map_addr),
            psid: ea.psid,
        });
    }
    Ok(ces)
}
