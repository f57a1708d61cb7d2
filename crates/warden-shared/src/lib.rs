//! Shared types and utilities for hostwarden components.
//!
//! Leaf building blocks with no process execution: error taxonomy, descriptors,
//! status snapshots, stack documents, secrets, the credential store and the
//! template renderer.

pub mod component;
pub mod credentials;
pub mod error;
pub mod fsutil;
pub mod report;
pub mod secret;
pub mod stack;
pub mod status;
pub mod template;

pub use component::{Category, ComponentDescriptor, LifecycleAction, Outcome};
pub use credentials::{CredentialInstance, CredentialRecord, CredentialStore, ROOT_PRINCIPAL};
pub use error::{WardenError, WardenResult};
pub use fsutil::{write_text, Ownership, WriteOptions, WriteReport};
pub use report::{OperationReport, Severity, StepFailure};
pub use secret::Secret;
pub use status::{HostStatus, RuntimeStatus, ServiceStatus, SystemFacts};
pub use template::{render_source, TemplateContext, TemplateRenderer};
