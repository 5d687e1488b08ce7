//! Array command layer
//!
//! Typed commands, the response parser, checked execution and the SSH
//! transport.

pub mod client;
pub mod command;
pub mod response;
pub mod ssh;

pub use client::{created_id, ArrayClient};
pub use command::{
    validate_object_name, ArrayCommand, CreateVolume, FabricFilter, HostPort, PitFilter,
    ProvisioningParams, DELIM,
};
pub use response::{CliResponse, FieldValue, Layout, Record};
pub use ssh::{SshConfig, SshGateway};
