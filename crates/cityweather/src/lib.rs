pub mod aggregator;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod events;
pub mod ingest;
pub mod logging;
pub mod lookup;
pub mod models;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod secrets;
pub mod service;
pub mod status;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, Config};
pub use coordinator::{ImportSummary, JobCoordinator};
pub use db::{Database, DatabaseError};
pub use error::{
    CityWeatherError, ConfigError, DispatchError, ImportError, IngestError, LookupError,
    QueryError, Result,
};
pub use events::{JobEventKind, JobProgressBroadcaster, JobProgressEvent};
pub use models::{BulkJob, City, JobStatus, Page, RefreshStatus, TaskResult, Weather};
pub use provider::{ErrorKind, ProviderError, WeatherProvider};
pub use secrets::{resolve_secret, SecretError};
pub use service::CityWeatherService;
pub use status::{JobStatusView, TaskResultView};
