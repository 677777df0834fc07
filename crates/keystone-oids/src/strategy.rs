use keystone_types::OidBlock;

use crate::error::OidResult;

/// Source of oid blocks.
///
/// Implementations must guarantee that blocks returned by distinct calls are
/// pairwise disjoint and strictly increasing, and that the reservation is
/// durable before the block is returned.
pub trait OidAllocationStrategy: Send + Sync {
    fn reserve_block(&self) -> OidResult<OidBlock>;
}
