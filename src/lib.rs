//! A peer-to-peer LAN chat and file-transfer protocol runtime.
//!
//! The crate is organized the way the protocol itself is: a wire codec at
//! the bottom ([`codec`]), transport and dispatch above it
//! ([`transport`], [`dispatcher`]), the three state machines built on top
//! ([`discovery`], [`message_engine`], [`file_engine`]), and
//! [`runtime::spawn`] wiring all of it into a handle a host embeds.
//!
//! Host applications — a GUI, a CLI, a headless daemon — are expected to
//! drive [`runtime::PeerRuntime`] and drain its [`events::EventReceiver`];
//! this crate has no opinion on presentation, chat history persistence,
//! or how a host discovers its own broadcast address.

pub mod codec;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod file_engine;
pub mod message_engine;
pub mod peer_table;
pub mod runtime;
pub mod transport;
pub mod worker_pool;

pub use codec::{Header, OpCode, PeerId, Response, Status};
pub use config::PeerConfig;
pub use error::{LcpError, Result};
pub use events::{EventReceiver, EventSender, FileStatus, PeerEvent};
pub use runtime::PeerRuntime;
