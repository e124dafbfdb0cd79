//! Well-known replication-group ids.
//!
//! Static tables get fixed ids so every node agrees on them without
//! coordination. Per-farm event logs and per-device telemetry streams derive
//! their group ids at runtime via [`crate::ids`].

pub const ORGANIZATIONS: u64 = 100;
pub const USERS: u64 = 101;
pub const CUSTOMERS: u64 = 102;
pub const FARMS: u64 = 103;
pub const FARM_CONFIGS: u64 = 104;
pub const ROLES: u64 = 105;
pub const ALGORITHMS: u64 = 106;
pub const DEVICES: u64 = 107;

/// All statically assigned group ids.
pub const WELL_KNOWN: &[u64] = &[
    ORGANIZATIONS,
    USERS,
    CUSTOMERS,
    FARMS,
    FARM_CONFIGS,
    ROLES,
    ALGORITHMS,
    DEVICES,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_ids_are_unique() {
        let mut ids = WELL_KNOWN.to_vec();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), WELL_KNOWN.len());
    }

    #[test]
    fn derived_group_ids_avoid_the_static_range() {
        for device in 0..64u64 {
            assert!(!WELL_KNOWN.contains(&crate::ids::telemetry_group_id(device)));
        }
    }
}
