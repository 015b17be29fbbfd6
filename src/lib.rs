//! Cluster-edge proxy bridging internal API services to an external
//! supervisor: instance registration into a shared catalog, authenticated
//! reverse proxying of control-plane traffic, outbound forwarding with
//! identity rewriting, and service-discovery proxying with ranked,
//! idempotency-gated retries.

pub mod catalog;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod proxy;
pub mod ranker;
pub mod registry;
pub mod router;
pub mod schema;
pub mod supervisor;
pub mod token;
pub mod utils;
pub mod version;
