//! Domain model: payments, escrows, the audit trail and the ports the
//! engine talks through.

pub mod escrow;
pub mod event;
pub mod money;
pub mod payment;
pub mod ports;
pub mod split;
