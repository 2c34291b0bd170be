//! VIP allocation and load-balancer reconciliation controller.
//!
//! This crate primarily ships the `vlb-controller` binary, but we expose the
//! library surface to enable integration testing and reuse.
//!
//! ## Architecture
//!
//! ```text
//! event feed ──► ServiceWorker ──► ServiceReconciler
//!                                   ├── AllocationStore   (VIP + port allocation)
//!                                   ├── VridAllocator     (redundancy identifiers)
//!                                   ├── Publisher         (nginx / keepalived config)
//!                                   ├── EndpointResolver  (backend addresses)
//!                                   └── StatusSink        (status, finalizers, events)
//! ```

pub mod appliance;
pub mod config;
pub mod error;
pub mod feed;
pub mod ipam;
pub mod orchestrator;
pub mod pool;
pub mod publisher;
pub mod reconciler;
pub mod service;
pub mod store;
pub mod vrid;
pub mod worker;

pub use error::ControllerError;
pub use ipam::{Allocation, AllocationStore};
pub use reconciler::{PassOutcome, ServiceReconciler};
pub use service::{ServiceEvent, ServiceSpec};
pub use vrid::{VridAllocator, VridPair};
pub use worker::ServiceWorker;
