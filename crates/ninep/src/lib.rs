#![forbid(unsafe_code)]
//! Asynchronous 9P2000 protocol engine for Rust.
//!
//! This crate provides a tokio-based implementation of both ends of the 9P2000
//! file protocol: a wire codec, a client that multiplexes concurrent requests over
//! one connection, and a server that routes requests to a [`srv::Filesystem`].
//!
//! # Overview
//!
//! The 9P protocol was originally developed for the Plan 9 distributed operating system.
//! Every request (T-message) carries a 16-bit tag which the reply (R-message) echoes,
//! so a client can have many requests outstanding and match replies in any order.
//!
//! # Serving
//!
//! 1. Define a type to represent your per-fid state (or use `()` for stateless fids)
//! 2. Implement the [`srv::Filesystem`] trait for your filesystem type
//! 3. Start the server with [`srv::srv_async`], or hand any byte stream to [`srv::dispatch`]
//!
//! ```no_run
//! use ninep::{srv::{Filesystem, FId, srv_async}, Result, FCall, QId, QIdType};
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type FId = ();
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &FId<Self::FId>,
//!         _afid: Option<&FId<Self::FId>>,
//!         _uname: &str,
//!         _aname: &str,
//!     ) -> Result<FCall> {
//!         Ok(FCall::RAttach {
//!             qid: QId { typ: QIdType::DIR, version: 0, path: 0 },
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv_async(MyFs, "tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Calling
//!
//! ```no_run
//! use ninep::{Client, ClientOptions, NOFID, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::connect("tcp!127.0.0.1!564", ClientOptions::default()).await?;
//!     let root = client.tattach(0, NOFID, "glenda", "").await?;
//!     println!("root qid: {:?}", root);
//!     Ok(())
//! }
//! ```
//!
//! # Message Flow
//!
//! 1. **Version Negotiation**: `Tversion`/`Rversion`; only `9P2000` is spoken
//! 2. **Authentication** (optional): `Tauth`/`Rauth` exchange
//! 3. **Attach**: the client binds a fid to a tree root with `Tattach`
//! 4. **Operations**: `walk`, `open`, `read`, `write`, `stat`, ...
//! 5. **Cleanup**: the client clunks fids with `Tclunk`
//!
//! # Error Handling
//!
//! Backends return [`error::Error`]; the server sends it as `Rerror` with the
//! text of [`Error::ename`]. On the client side an `Rerror` surfaces as
//! `Error::Str`.
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!564"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
pub mod client;
pub mod debug;
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod srv;
pub mod tag;
#[macro_use]
pub mod utils;

pub use crate::client::{Client, ClientOptions};
pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::srv::ServerOptions;
pub use crate::utils::{Result, Tracer};
