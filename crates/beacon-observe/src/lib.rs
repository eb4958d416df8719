//! Audit layer for the beacon mesh.
//!
//! Every security-relevant mesh action (invite redemption failures,
//! fingerprint mismatches, federation outcomes, reachability changes) is
//! appended to an audit log that operators can query.
//!
//! # Event domains
//!
//! | Domain | Example events |
//! |--------|---------------|
//! | `INVITE` | `INVITE_CREATED`, `INVITE_REDEEMED`, `SECRET_MISMATCH` |
//! | `PEER` | `PEER_ADDED`, `PEER_REMOVED`, `SELF_PEERING_REJECTED` |
//! | `HANDSHAKE` | `HANDSHAKE_COMPLETED`, `HANDSHAKE_REJECTED`, `SPOOF_DETECTED` |
//! | `FEDERATION` | `FEDERATION_CONFIGURED`, `FEDERATION_FAILED`, `FEDERATION_TORN_DOWN` |
//! | `HEALTH` | `PEER_UNREACHABLE`, `PEER_RECOVERED` |
//!
//! # Usage
//!
//! ```rust,ignore
//! use beacon_observe::{record_or_warn, EventPayload};
//!
//! record_or_warn(
//!     sink.as_ref(),
//!     &invite_id,
//!     &EventPayload::SecretMismatch { invite_id: invite_id.clone() },
//! );
//! ```

mod error;
mod event;
mod sink;
mod store;

pub use error::ObserveError;
pub use event::{AuditEvent, EventDomain, EventPayload, Severity};
pub use sink::{record_or_warn, record_or_warn_async, AuditSink, MemoryAuditSink, SqliteAuditSink};
pub use store::{emit_event, query_events, EventFilter};
