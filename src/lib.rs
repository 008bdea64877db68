pub mod chain;
pub mod config;
pub mod cooperative;
pub mod error;
pub mod lightning;
pub mod logging;
pub mod service;
pub mod swap;
pub mod wallet;

pub mod proto {
    pub mod v1 {
        tonic::include_proto!("settlement.v1");
    }
}
