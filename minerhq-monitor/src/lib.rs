pub mod alerts;
pub mod api;
pub mod config;
pub mod device;
pub mod hub;
pub mod orchestrator;
pub mod pricing;
pub mod session;
pub mod storage;

pub use alerts::{Alert, AlertConfig, AlertError, AlertEvaluator, AlertKind};
pub use config::{
    CollectorConfig, Config, HubConfig, PricingConfig, RetentionConfig, ServerConfig,
    StorageConfig,
};
pub use device::{DeviceClient, DeviceError, SystemInfo};
pub use hub::{Hub, HubHandle, Subscription};
pub use orchestrator::{DeviceStatus, MonitorError, Orchestrator};
pub use pricing::{PriceService, Pricing};
pub use session::{SessionRegistry, SessionStatus};
pub use storage::Store;
pub use storage::memory::MemoryStore;
pub use storage::sqlite::SqliteStore;
