pub mod alias;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod selector;
pub mod server;
pub mod stream_guard;
pub mod translate;

pub use config::{ConfigHierarchy, ConfigSource, EffectiveConfig};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayResponse, InboundRequest};
pub use metrics::{MetricsSink, RequestLedger};
pub use server::{build_router, AppState};
