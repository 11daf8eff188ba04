//! Request routing for the registry's HTTP surface

use hyper::Method;

/// Endpoints served by the gateway process
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Liveness of the gateway itself
    Healthz,
    /// Prometheus scrape endpoint
    Metrics,
    /// Health summary of every service
    Status,
    /// Pick a healthy instance of the named service
    Select(String),
    /// Outcome report from a dispatcher
    Report,
    NotFound,
}

impl Route {
    /// Match a request method and path to a route
    pub fn resolve(method: &Method, path: &str) -> Route {
        let path = path.trim_end_matches('/');

        match (method, path) {
            (&Method::GET, "/healthz") => Route::Healthz,
            (&Method::GET, "/metrics") => Route::Metrics,
            (&Method::GET, "/status") => Route::Status,
            (&Method::POST, "/report") => Route::Report,
            (&Method::GET, _) => match path.strip_prefix("/select/") {
                Some(service) if !service.is_empty() && !service.contains('/') => {
                    Route::Select(service.to_string())
                }
                _ => Route::NotFound,
            },
            _ => Route::NotFound,
        }
    }
}
