//! Typed ID definitions.

use crate::define_id;

// =============================================================================
// Scheduling
// =============================================================================

define_id!(TenantId, "tnt");
define_id!(ServiceId, "svc");

// =============================================================================
// Placement
// =============================================================================

define_id!(HostId, "host");
define_id!(PoolId, "pool");

// =============================================================================
// Tests
// =============================================================================
