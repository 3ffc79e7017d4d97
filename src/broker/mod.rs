//! Privileged command broker.
//!
//! The web process cannot run the container tool itself. It sends one JSON
//! line over a local socket to a root-owned daemon, which creates units or
//! starts commands on its behalf.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{BrokerAck, BrokerClient, BrokerError, BrokerTimeouts};
pub use protocol::{BrokerRequest, BrokerResponse, ErrorCode};
pub use server::{BrokerContext, BrokerServer};
