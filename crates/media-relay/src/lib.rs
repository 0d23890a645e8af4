//! Datagram media relay engine.
//!
//! Sits between two call participants whose signaling layer has negotiated
//! media endpoints and forwards their audio/video packet streams without the
//! endpoints needing direct reachability to each other. The engine owns:
//!
//! - a bounded [`port::PortPool`] handing out transport ports without
//!   collision,
//! - a session table with a `Reserved` → `Active` → `Closed` lifecycle,
//!   driven through the [`session::SessionController`] façade,
//! - a pair of cancellable forwarding loops per active session that latch
//!   peer addresses from observed traffic and relay datagrams verbatim,
//! - a background reaper that reclaims ports reserved for sessions whose
//!   relay never started.
//!
//! Signaling, the control-channel protocol, and media payload semantics are
//! out of scope: the engine forwards opaque datagrams and is driven purely
//! through the controller's `allocate`/`start`/`stop`/`lookup` operations.
//!
//! # Example
//!
//! ```no_run
//! use media_relay::{CallId, MediaKind, RelayConfig, SessionController};
//!
//! # async fn example() -> media_relay::Result<()> {
//! let controller = SessionController::new(RelayConfig::default())?;
//!
//! let call_id = CallId::from("call-1");
//! let session = controller.allocate_session(call_id.clone(), MediaKind::Audio).await?;
//! // hand session.port_a / session.port_b to the signaling layer...
//! controller.start_session(&call_id).await?;
//! // ...media flows...
//! controller.stop_session(&call_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod port;
pub mod relay;
pub mod session;
pub mod types;

pub use error::{Error, Result};
pub use port::{PoolUsage, PortPool, PortStatus};
pub use relay::RelayStats;
pub use session::{CloseReason, SessionController, SessionEvent, SessionSnapshot};
pub use types::{CallId, MediaKind, RelayConfig, SessionState};
