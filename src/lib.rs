pub mod bias;
pub mod config;
pub mod desk;
pub mod dispatch;
pub mod drift;
pub mod error;
pub mod governor;
pub mod logging;
pub mod market;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod plan;
pub mod reliability;
pub mod risk;
pub mod store;
