//! Foundry: turns OpenAPI documents into hosted tool servers.
//!
//! A submitted document is parsed, its base URL resolved and its operations
//! extracted as tools. A background job then scaffolds a server project with
//! an external generator, installs its dependencies, writes a startup script,
//! and launches it on a port from a managed range. Each hosted server runs a
//! health sidecar on `port + offset`, which the supervisor checks on start
//! and on a timer.

pub mod config;
pub mod error;
pub mod generator;
pub mod health;
pub mod hosting;
pub mod pipeline;
pub mod port;
pub mod sidecar;
pub mod spec;
pub mod store;
pub mod supervisor;

pub use config::{FoundryConfig, GeneratorConfig, HealthConfig, HostingConfig};
pub use error::{FoundryError, Result};
pub use hosting::{HostingParts, HostingService, SubmitReceipt, TargetStatus};
pub use pipeline::{JobSnapshot, JobState};
pub use port::PortAllocator;
pub use spec::tool::ToolDescriptor;
pub use spec::{ResolvedSpec, SpecProcessor};
pub use store::{FileStatusStore, HostedTargetRecord, HostingStatus, MemoryStatusStore, StatusStore};
pub use supervisor::{ProcessStatus, ProcessSupervisor};
