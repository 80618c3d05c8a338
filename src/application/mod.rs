//! Application layer orchestrating the payment lifecycle.
//!
//! `EscrowEngine` composes the deposit matcher and the escrow and payout
//! orchestrators over the domain ports. Every money-moving call passes
//! through the `ReconciliationGuard`. The `Scheduler` drives the engine on
//! fixed intervals.

pub mod context;
pub mod deposit_matcher;
pub mod engine;
pub mod escrow_orchestrator;
pub mod guard;
pub mod payout_orchestrator;
pub mod scheduler;
