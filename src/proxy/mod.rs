pub mod endpoint;
pub mod fetcher;
pub mod pool;
pub mod share;
pub mod vendor;

pub use endpoint::{Endpoint, EndpointHandle, EndpointState, ProxyServer};
pub use fetcher::{FetcherHandle, FetchResult};
pub use pool::{PoolContext, ProxyPool};
pub use share::{ShareBus, ShareMessage, WorkerRegistry};
pub use vendor::ExtractionStats;
