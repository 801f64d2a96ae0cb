//! The pause-and-resume authorization flow.
//!
//! The flow subsystem owns everything between the client's authorization
//! request and the moment a downstream code lands back on the client:
//! transaction records, their stores, the consent-pause policy, and the
//! engine that drives the state machine.

pub mod engine;
pub mod policy;
pub mod store;
pub mod transaction;

pub use engine::{AuthorizeRequest, CallbackOutcome, ConsentView, FlowEngine};
pub use policy::{AlwaysRequireConsent, ConsentOncePolicy, ConsentPolicy};
pub use store::{PendingStore, Sweep, TransactionStore, spawn_sweeper};
pub use transaction::{ClientBinding, PendingAuthorization, Transaction, TransactionStatus};
