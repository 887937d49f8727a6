//! Shared scaffolding for the HTTP-driven integration tests: a throwaway
//! mock upstream LAPI plus a router wired to point at it.

#![allow(dead_code)]

use std::net::SocketAddr;

use axum::Router;
use crowdsec_scoring_proxy::config::Config;
use crowdsec_scoring_proxy::handler::{create_router, AppState};
use crowdsec_scoring_proxy::upstream::UpstreamClient;

/// Bind `router` to an ephemeral localhost port and serve it in the
/// background for the life of the test process. Returns the bound address.
pub async fn spawn_mock_upstream(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("mock upstream failed to bind an ephemeral port");
    let addr = listener.local_addr().expect("bound listener has a local addr");
    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("mock upstream server crashed");
    });
    addr
}

/// A validated [`Config`] pointed at `upstream_addr`, with `extra_yaml`
/// merged in under the top level (scoring tables, cache TTL overrides,
/// etc).
pub fn test_config(upstream_addr: SocketAddr, extra_yaml: &str) -> Config {
    let yaml = format!(
        "upstream_lapi_url: \"http://{upstream_addr}\"\nupstream_lapi_key: \"test-key\"\n{extra_yaml}"
    );
    Config::from_yaml_str(&yaml).expect("test config document failed to validate")
}

/// Build the proxy's router against a mock upstream, ready for
/// `tower::ServiceExt::oneshot`.
pub fn build_router(config: Config) -> (Router, AppState) {
    let upstream = UpstreamClient::new(
        &config.upstream_lapi_url,
        config.upstream_lapi_key.clone(),
        config.upstream_timeout,
    );
    let state = AppState::new(std::sync::Arc::new(config), upstream);
    (create_router(state.clone()), state)
}
