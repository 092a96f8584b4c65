//! Identifiers, error taxonomy and clocks shared by every cadence crate.
//!
//! This crate contains no storage or runtime concerns.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{HandlerError, RegistrarError, StoreError, ValidationError};
pub use id::{JobDefinitionId, JobRunId, QueueEntryId, TenantId, UserId, WorkspaceId};
