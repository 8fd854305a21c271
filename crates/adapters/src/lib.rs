//! ERP / e-commerce adapters.
//!
//! Every connector implements [`ErpAdapter`] and is constructed through the
//! [`AdapterRegistry`]. Adapters return source-neutral records; turning them
//! into ledger effects is the sync orchestrator's job.

pub mod contract;
pub mod http;
pub mod memory;
pub mod mystore;
pub mod phc;
pub mod primavera;
pub mod registry;
pub mod saft;
pub mod sage;

pub use contract::{
    AdapterConfig, AdapterError, AdapterInfo, ConfigValidation, ConnectionStatus,
    DEFAULT_PAGE_SIZE, EntityKind, ErpAdapter, ExternalCategory, ExternalLocation,
    ExternalMovement, ExternalProduct, ExternalTenant, HealthReport, HealthStatus,
    SupportedFeatures, SyncOutcome, SyncResult,
};
pub use memory::{MemoryAdapter, MemorySource};
pub use registry::{
    AdapterDescriptor, AdapterFactory, AdapterRegistry, AdapterRegistryBuilder, RegistryError, global,
    install_global,
};
pub use saft::SaftAdapter;
