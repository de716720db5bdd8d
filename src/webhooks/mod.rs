//! # Webhooks
//!
//! Signature verification, the per-delivery claim ledger and the processor
//! tying them to the registered webhook handler.

pub mod ledger;
pub mod processor;
pub mod verify;

pub use ledger::{ClaimLedger, ClaimOutcome, DeliveryRecord};
pub use processor::{WebhookOutcome, WebhookProcessor};
pub use verify::{VerificationError, VerifierRegistry, WebhookVerifier};
