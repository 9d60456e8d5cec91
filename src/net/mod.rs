//! Networking module for GhostDrop
//!
//! This module provides everything needed to move a file directly between
//! two peers:
//!
//! - **Signaling**: the abstract directory both peers use to bootstrap a
//!   connection, plus the in-memory implementation
//! - **Room**: short human-typeable codes identifying one signaling session
//! - **Session**: handshake, lifecycle and coordinated teardown of one peer
//!   connection
//! - **Transfer**: chunked file streaming with backpressure over the open
//!   data channel
//!
//! # Architecture
//!
//! The connectivity layer is WebRTC: the directory only carries the SDP
//! offer/answer and trickled ICE candidates, after which all data flows
//! peer-to-peer over a single ordered, reliable data channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ghostdrop::net::{MemoryDirectory, Session, SessionConfig, SessionEvent};
//!
//! let directory = Arc::new(MemoryDirectory::new());
//! let (session, mut events) =
//!     Session::offer(directory, SessionConfig::default()).await?;
//! println!("share this code: {}", session.room_code());
//!
//! session.wait_open().await;
//! session.send_file("report.pdf", "application/pdf", &bytes).await?;
//! ```

pub mod room;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use room::{RoomCode, RoomCodeError};
pub use session::{Session, SessionConfig, SessionError, SessionEvent, SessionEvents, SessionState};
pub use signaling::{DirectoryEvent, MemoryDirectory, SignalingDirectory, SignalingError};
pub use transfer::{ReceivedFile, TransferEnvelope, TransferError};
