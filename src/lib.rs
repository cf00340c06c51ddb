pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod geojson;
pub mod layers;
pub mod logging;
pub mod merge;
pub mod poller;
pub mod retry;
pub mod stream;
pub mod stream_manager;
pub mod visibility;

pub use cache::{CacheConfig, CacheEntry, CacheStats, PayloadCache};
pub use cancel::CancelToken;
pub use config::GeoJsonSource;
pub use error::LiveError;
pub use fetcher::{FetchOptions, FetchOutcome, FetcherConfig, FetcherStats, GeoJsonFetcher};
pub use geojson::{Feature, FeatureCollection};
pub use layers::{LayerCallbacks, LayerManager};
pub use merge::{merge, MergeOutcome, UpdateStrategy};
pub use poller::{PollConfig, PollState, Poller};
pub use retry::{RetryExecutor, RetryHooks, RetryPolicy};
pub use stream::{ConnectionState, StreamConfig, StreamConnection, StreamEvent, StreamKind};
pub use stream_manager::{StreamCallbacks, StreamManager, StreamStatus};
pub use visibility::VisibilitySignal;
