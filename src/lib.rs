//! # BMI Core
//!
//! A pluggable, asynchronous message-passing substrate for a parallel
//! distributed filesystem client, in the shape of the BMI/PVFS2 network
//! layer: transport methods (TCP, and simulated GM/MX), a message-passing
//! shim multiplexing them behind one address/op/context surface, a
//! table-driven state-machine engine for composing multi-step client
//! operations, and a flow engine for scatter/gather transfers.

pub mod addr;
pub mod cli;
pub mod error;
pub mod flow;
pub mod ids;
pub mod mp;
pub mod op_list;
pub mod sme;
pub mod transport;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
