pub mod loader;
pub mod schema;

pub use loader::{apply_env_overrides, load_config};
pub use schema::{
    AuthConfig, ChatConfig, Config, EncryptionConfig, Environment, GatewayConfig, HealthConfig,
    RateLimitConfig, SummarizerConfig,
};
