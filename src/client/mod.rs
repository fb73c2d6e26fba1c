//! Upstream HTTP clients
//!
//! `transport` is the raw network port, `credentials` supplies auth headers
//! and `resilient` wraps both with caching, rate limiting and retries.

pub mod credentials;
pub mod resilient;
pub mod transport;

pub use credentials::{BearerToken, CredentialProvider, NoCredentials, StaticHeaders};
pub use resilient::{CacheTarget, RequestOptions, ResilientClient, Response};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
