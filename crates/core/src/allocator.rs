//! Tunnel address allocation
//!
//! Pure first-fit scan over a closed address range. The allocator does
//! not reserve anything itself; the caller persists the assignment
//! atomically (the device insert claims the slot and the partial
//! unique index arbitrates races).

use std::collections::HashSet;
use std::net::Ipv4Addr;

/// First free address in [start, end] not present in `allocated`, in
/// ascending numeric order. None when the range is fully taken.
pub fn allocate(
    allocated: &HashSet<Ipv4Addr>,
    start: Ipv4Addr,
    end: Ipv4Addr,
) -> Option<Ipv4Addr> {
    for raw in u32::from(start)..=u32::from(end) {
        let candidate = Ipv4Addr::from(raw);
        if !allocated.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}
