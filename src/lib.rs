//! GhostDrop - ephemeral peer-to-peer file drops
//!
//! A library for streaming files directly between two endpoints over an
//! ephemeral data channel, bootstrapped through a shared signaling
//! directory and identified by a short human-typeable room code, plus a
//! steganographic codec for hiding short messages inside images.
//!
//! # Architecture
//!
//! The crate is organized into two independent parts:
//!
//! - [`net`]: Session negotiation, room lifecycle, and chunked file
//!   transfer over WebRTC data channels
//! - [`stego`]: Bit-plane embedding and extraction of text payloads in
//!   RGBA pixel buffers
//!
//! # Sending a file
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ghostdrop::net::{MemoryDirectory, Session, SessionConfig, SessionEvent};
//!
//! let directory = Arc::new(MemoryDirectory::new());
//!
//! // Offerer: create a room and share its code out of band.
//! let (session, _events) = Session::offer(directory.clone(), SessionConfig::default()).await?;
//! println!("room code: {}", session.room_code());
//!
//! // Joiner (elsewhere): enter the code.
//! let code = ghostdrop::net::RoomCode::parse("482913")?;
//! let (peer, mut events) = Session::join(directory, code, SessionConfig::default()).await?;
//!
//! session.wait_open().await;
//! session.send_file("report.pdf", "application/pdf", &bytes).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::FileReceived(file) = event {
//!         println!("got {} ({} bytes)", file.name, file.bytes.len());
//!     }
//! }
//! ```
//!
//! # Hiding a message
//!
//! ```rust
//! let mut pixels = vec![0u8; 128 * 128 * 4]; // RGBA
//! ghostdrop::stego::encode(&mut pixels, "the drop is at midnight", "shared-key").unwrap();
//! let message = ghostdrop::stego::decode(&pixels, "shared-key").unwrap();
//! assert_eq!(message, "the drop is at midnight");
//! ```

pub mod net;
pub mod stego;

pub use net::{Session, SessionConfig, SessionEvent};
