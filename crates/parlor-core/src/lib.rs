//! # parlor-core
//!
//! Foundation types shared by every parlor crate:
//!
//! - **Branded IDs**: `UserId`, `ChannelId`, `MessageId`, `ConnectionId` and friends
//!   as `String` newtypes so one cannot be passed where another is expected
//! - **Clocks**: wall-clock milliseconds for persisted timestamps and a
//!   process-local monotonic clock for liveness bookkeeping
//! - **Errors**: `StoreError` returned by every external collaborator
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod clock;
pub mod errors;
pub mod ids;
pub mod logging;

pub use errors::StoreError;
pub use ids::{ChannelId, ConnectionId, IdentityId, MessageId, UserId, WorldId};
