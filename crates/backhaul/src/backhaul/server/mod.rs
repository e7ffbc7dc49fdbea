pub mod client;
pub mod edge;
pub mod ids;
pub mod ingress;
pub mod pool;
pub mod registry;
