//! Storage Array Driver - Block volumes on CLI-managed arrays
//!
//! A volume driver that maps a uniform volume lifecycle (create, delete,
//! extend, snapshot, clone, attach, migrate) onto a storage array reachable
//! only through its command line over SSH.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              ArrayDriver                                     │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌────────────┐ ┌─────────────┐  │
//! │  │  setup    │ │  volume   │ │ flashcopy │ │ connection │ │ migrate /   │  │
//! │  │  check    │ │ lifecycle │ │ snap/clone│ │  + hosts   │ │ stats       │  │
//! │  └─────┬─────┘ └─────┬─────┘ └─────┬─────┘ └─────┬──────┘ └──────┬──────┘  │
//! │        └─────────────┴──────┬──────┴─────────────┴───────────────┘          │
//! │                     ┌───────┴────────┐        ┌──────────────────┐          │
//! │                     │  PollPolicy    │        │  VolumeCatalog   │          │
//! │                     │ (timeout loop) │        │  (injected port) │          │
//! │                     └───────┬────────┘        └──────────────────┘          │
//! ├─────────────────────────────┼───────────────────────────────────────────────┤
//! │                        ArrayClient                                           │
//! │        typed ArrayCommand ─► checked execution ─► CliResponse parser         │
//! ├─────────────────────────────┼───────────────────────────────────────────────┤
//! │                      ArrayGateway (port)                                     │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │        SshGateway           │  │          ArraySimulator             │   │
//! │  │   (system ssh client)       │  │  (in-process array, PiT machine)    │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`driver`]: The driver core and its operations
//! - [`cli`]: Typed commands, response parsing, SSH transport
//! - [`array`]: Array object model, PiT state machine and simulator
//! - [`retry`]: Timeout-budgeted polling
//! - [`catalog`]: In-memory volume catalog
//! - [`config`]: Driver configuration
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod array;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod retry;

// Re-export commonly used types
pub use array::{ArrayModel, ArraySimulator, Fault, PitEvent, PitState};

pub use catalog::MemoryCatalog;

pub use cli::{ArrayClient, ArrayCommand, CliResponse, Record, SshConfig, SshGateway};

pub use config::{DriverConfig, VolumeOptions};

pub use domain::ports::{
    ArrayGateway, ArrayGatewayRef, CommandOutput, ConnectionInfo, Connector, MigrationHint,
    MigrationOutcome, Protocol, SnapshotSpec, VolumeCatalog, VolumeCatalogRef, VolumeSpec,
    VolumeStats,
};

pub use driver::{ArrayDriver, ArrayProfile, PitStatus};

pub use error::{Error, ErrorAction, ObjectKind, Result};

pub use retry::{PollPolicy, Progress};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
