//! Per address block admission budget for IPv6 candidates.
//!
//! A dense IPv6 block can advertise an unbounded number of addresses. Each
//! block gets a fixed number of crawl attempts per epoch, counted in the
//! shared state so every worker process draws from the same budget. Counts
//! only go up until the rollover clears them.

use crate::error::StoreError;
use crate::state::CrawlState;
use crate::store::StateStore;
use bitcoin_census_connection::NodeAddress;
use std::net::Ipv6Addr;

/// Prefix length at or above which no throttling happens.
const FULL_PREFIX: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionController {
    prefix_len: u8,
    cap: u64,
}

impl AdmissionController {
    /// Allow `cap` attempts per `/prefix_len` block.
    pub fn new(prefix_len: u8, cap: u64) -> Self {
        AdmissionController {
            prefix_len: prefix_len.min(FULL_PREFIX),
            cap,
        }
    }

    /// Whether `address` is subject to the budget.
    pub fn applies_to(&self, address: &NodeAddress) -> bool {
        self.prefix_len < FULL_PREFIX && address.is_ipv6()
    }

    /// The block of `ip`, e.g. `2001:db8::/32`.
    pub fn prefix_of(&self, ip: Ipv6Addr) -> String {
        let host_bits = u32::from(FULL_PREFIX - self.prefix_len);
        let mask = u128::MAX.checked_shl(host_bits).unwrap_or(0);
        let network = Ipv6Addr::from(u128::from(ip) & mask);
        format!("{network}/{}", self.prefix_len)
    }

    /// Spend one unit of the block's budget.
    ///
    /// Returns `false` once the block is over its cap. The count is never
    /// given back, a rejected attempt still consumed budget. Addresses the
    /// budget does not apply to are always admitted.
    pub async fn admit<S: StateStore>(
        &self,
        state: &CrawlState<S>,
        address: &NodeAddress,
    ) -> Result<bool, StoreError> {
        let NodeAddress::Ipv6(ip) = address else {
            return Ok(true);
        };
        if !self.applies_to(address) {
            return Ok(true);
        }

        let count = state.admit_prefix(&self.prefix_of(*ip)).await?;
        Ok(u64::try_from(count).is_ok_and(|count| count <= self.cap))
    }
}
