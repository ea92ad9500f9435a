//! # Keeper Server Library
//!
//! A session keeper: one long-running process hosting many concurrent
//! real-time matches, each holding a set of authenticated users connected
//! over paired TCP + UDP channels with symmetric encryption.
//!
//! ## Architecture
//!
//! Two planes share one [`state::State`]:
//!
//! - The **control plane** (`router`, `rpc`) is HTTP. Applications
//!   authenticate users here, mint one-shot keys, create matches and
//!   search for them through the tag index.
//! - The **data plane** (`listener`, `udp`, `connection`, `packets`) is
//!   raw TCP + UDP. A client proves possession of its one-shot key by
//!   sending an encrypted `ConnectionRequest` on both channels; the
//!   verifier correlates the pair by session id and hands the resulting
//!   [`connection::Connection`] to a named acceptor.
//!
//! The match [`manager::Manager`] is the acceptor in practice: it routes
//! each connection into a [`matches::Match`], whose tick loop owns the
//! users from then on and drives the application-supplied
//! [`matches::Core`] callbacks at a fixed rate.
//!
//! ## Threads
//!
//! One thread per: TCP accept loop, UDP reader, per-connection TCP
//! reader, per-match tick loop. The HTTP control plane runs on the tokio
//! runtime. There is no global shutdown token; killing the process closes
//! the sockets, which surfaces as fatal errors up the stack.
//!
//! ## Discoverability
//!
//! Matches advertise a tag ("mode: ffa size: 8"); clients search with
//! the same query language (`query`), answered from per-field sorted
//! containers (`index`) aggregated by how many fields matched.

pub mod app;
pub mod config;
pub mod connection;
pub mod index;
pub mod listener;
pub mod manager;
pub mod matches;
pub mod packets;
pub mod query;
pub mod router;
pub mod rpc;
pub mod state;
pub mod udp;
