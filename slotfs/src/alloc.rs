//! Packed bit-vector operations shared by every allocation structure on the
//! volume: the block bitmap, the inode bitmap, and the per-directory-block
//! slot occupancy maps.

use std::ops::Range;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// Reads one bit of a packed bit-vector. Bits are numbered LSB-first within
/// each byte, matching the on-disk layout.
pub fn get(map: &[u8], index: usize) -> State {
    debug_assert!(index < map.len() * 8);
    match (map[index / 8] >> (index % 8)) & 1 {
        0 => State::Free,
        _ => State::Used,
    }
}

pub fn set_used(map: &mut [u8], index: usize) {
    debug_assert!(index < map.len() * 8);
    map[index / 8] |= 1 << (index % 8);
}

pub fn set_free(map: &mut [u8], index: usize) {
    debug_assert!(index < map.len() * 8);
    map[index / 8] &= !(1 << (index % 8));
}

/// Implements a naive next-available allocation policy: scan the range in
/// order and hand out the first clear bit.
///
/// ## Other Pre-Allocation Policies
///
/// 1. Allocation that attempts to find enough contiguous available bits so
///    data can be allocated close together (speed ups through sequential
///    reads).
/// 2. Allocation that attempts to spread randomly over blocks to prevent
///    wear of physical devices in the front section.
pub fn first_free(map: &[u8], range: Range<usize>) -> Option<usize> {
    for index in range {
        if let State::Free = get(map, index) {
            return Some(index);
        }
    }
    None
}
