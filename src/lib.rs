// UFI - farmer registration with generated identifiers and a locally persisted record store

pub mod config;
pub mod filter;
pub mod link;
pub mod models;
pub mod record;
pub mod registry;
pub mod slot;
pub mod store;
pub mod ufi;

// Re-export main types for convenience
pub use config::Config;
pub use filter::{Filter, FilterOp};
pub use link::{ProfileCode, profile_url};
pub use models::{FarmerRecord, RegistrationForm};
pub use record::{Record, SeenIds, SequenceDelta};
pub use registry::{Profile, Registration, Registry};
pub use store::{Store, SubscriptionId, now_ms};
pub use ufi::{IdGenerator, IdPolicy, RandomIdGenerator};
