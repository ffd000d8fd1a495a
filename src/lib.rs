//! xrpc - Lightweight RPC framework with pluggable codecs
//!
//! A client and a server exchange calls over any byte stream. Each connection
//! starts with a JSON handshake choosing the codec; after that every call is a
//! header frame followed by a body frame. Calls on one connection are
//! multiplexed: the server runs them concurrently and replies in any order,
//! and the client matches replies to calls by sequence number.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xrpc::{Client, Server, Service};
//!
//! struct Arith;
//!
//! impl Arith {
//!     async fn sum(self: Arc<Self>, args: (i64, i64)) -> Result<i64, String> {
//!         Ok(args.0 + args.1)
//!     }
//! }
//!
//! # async fn run() -> xrpc::Result<()> {
//! let server = Arc::new(Server::new());
//! server.register(Service::builder(Arith).method("Sum", Arith::sum).build()?)?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9999").await?;
//! tokio::spawn(Arc::clone(&server).accept(listener));
//!
//! let client = Client::dial("tcp", "127.0.0.1:9999", None).await?;
//! let sum: i64 = client.call("Arith.Sum", &(2, 3)).await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Multiplexed calls** - many in-flight calls per connection
//! - **Explicit registration** - typed async handlers, no reflection
//! - **Pluggable codecs** - codec chosen per connection at handshake
//! - **Client-side balancing** - random or round-robin over a server list,
//!   plus broadcast to every server

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod client;
pub mod discovery;
pub mod protocol;
pub mod server;
pub mod service;
pub mod xclient;

pub use client::{Call, Client, PendingCall, x_dial};
pub use discovery::{Discovery, MultiServerDiscovery, SelectMode};
pub use protocol::{CodecType, Error, Header, MAGIC_NUMBER, Options, Result};
pub use server::Server;
pub use service::{MethodType, Service, ServiceBuilder};
pub use xclient::XClient;

/// xrpc version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
