pub mod auth;
pub mod bootstrap;
pub mod channel_cache;
pub mod classify;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod registry;
pub mod request_context;
pub mod retry;
pub mod state;
pub mod telemetry;
pub mod upstream_client;

pub use auth::{CallerIdentity, resolve_caller_identity};
pub use bootstrap::{
    Bootstrap, CliArgs, apply_setting, bootstrap, bootstrap_from_env, generate_admin_key,
    hash_admin_key, load_patch_from_settings, persist_patch,
};
pub use channel_cache::ChannelCache;
pub use classify::{Route, classify};
pub use error::{
    ErrorKind, ProxyError, STATUS_CLIENT_CLOSED, STATUS_FIRST_BYTE_TIMEOUT, classify_status,
    external_status, synthesize_exhausted,
};
pub use forwarder::{ForwardBody, ForwardOutcome, ForwardRequest, Forwarder, StreamSummary};
pub use handler::proxy_handler;
pub use registry::{ActiveRequest, ActiveRequestGuard, ActiveRequestRegistry};
pub use request_context::{FirstByteOutcome, RequestContext};
pub use retry::{RetryInput, RetryOrchestrator, RetryOutcome};
pub use state::{AppState, spawn_health_refresh, spawn_log_cleanup};
pub use telemetry::TelemetrySender;
pub use upstream_client::{UpstreamClient, UpstreamResponse};
