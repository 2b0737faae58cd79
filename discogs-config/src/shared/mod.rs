//! Shared configuration types for the extractor and loader services.

mod base;
mod batch;
mod bus;
mod destination;
mod extractor;
mod health;
mod loader;
mod resilience;
mod service;

pub use base::ValidationError;
pub use batch::BatchConfig;
pub use bus::{AmqpConfig, AmqpConfigWithoutSecrets};
pub use destination::{
    DestinationConfig, DestinationConfigWithoutSecrets, Neo4jSinkConfig, PostgresSinkConfig,
};
pub use extractor::ExtractorConfig;
pub use health::HealthServerConfig;
pub use loader::LoaderConfig;
pub use resilience::{CircuitBreakerConfig, HealthCheckConfig, ResilienceConfig, RetryConfig};
pub use service::{
    ExtractorServiceConfig, ExtractorServiceConfigWithoutSecrets, LoaderServiceConfig,
    LoaderServiceConfigWithoutSecrets,
};
