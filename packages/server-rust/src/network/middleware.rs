//! HTTP middleware stack applied to every listener.
//!
//! Tracing wraps the body limit, so rejected oversized requests are still
//! logged.

use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

/// The composed Tower layer type produced by [`build_http_layers`].
type HttpLayers = tower::layer::util::Stack<
    RequestBodyLimitLayer,
    tower::layer::util::Stack<
        TraceLayer<
            tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
        >,
        tower::layer::util::Identity,
    >,
>;

/// Builds the HTTP-level middleware stack.
///
/// 1. `Tracing` -- one span per HTTP request/response
/// 2. `RequestBodyLimit` -- rejects bodies above `max_body_bytes` with 413
///
/// No timeout layer: the response wait is owned by the listener adapter,
/// which answers with its fallback instead of an error status.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_http_layers_with_defaults() {
        let _layers = build_http_layers(&NetworkConfig::default());
    }

    #[test]
    fn build_http_layers_with_small_limit() {
        let config = NetworkConfig {
            max_body_bytes: 16,
            ..NetworkConfig::default()
        };
        let _layers = build_http_layers(&config);
    }
}
