//! # rtlink
//!
//! `rtlink` is a routing netlink control library for Linux network
//! namespaces. It creates, inspects and removes network interfaces, IP
//! addresses, routes, policy rules and neighbor entries by speaking the
//! rtnetlink wire protocol directly: fixed kernel ABI headers plus nested
//! type-length-value attribute streams.
//!
//! Operations are synchronous and namespace-scoped. A [`context::Context`]
//! names the target namespace; every read or mutation dials its own
//! routing socket there and releases it when done. Reads are fresh kernel
//! round trips, never cached, and the `present`/`absent` verbs converge
//! instead of failing when the kernel already agrees with the desired
//! state.

pub mod addr;
pub mod bridge;
pub mod consts;
pub mod context;
pub mod error;
pub mod handle;
pub mod kind;
pub mod link;
pub mod macvlan;
pub mod message;
pub mod neighbor;
pub mod request;
pub mod route;
pub mod rule;
pub mod socket;
pub mod utils;
pub mod veth;
pub mod vrf;
pub mod vxlan;
