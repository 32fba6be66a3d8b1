pub mod connector;
pub mod models;
pub mod rpc;
