//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let node_routes = Router::new()
        .route("/v1/sync/{kind}", get(handlers::list_after_version))
        .route("/v1/node/heartbeat", post(handlers::heartbeat))
        .route("/v1/node/tasks", get(handlers::list_node_tasks))
        .route("/v1/node/tasks/ack", post(handlers::ack_node_tasks))
        .route("/v1/node/stream", get(handlers::command_stream));

    let admin_routes = Router::new()
        // Clusters and nodes
        .route(
            "/v1/admin/clusters",
            post(handlers::create_cluster).get(handlers::list_clusters),
        )
        .route(
            "/v1/admin/clusters/{cluster_id}",
            get(handlers::get_cluster)
                .put(handlers::update_cluster)
                .delete(handlers::delete_cluster),
        )
        .route(
            "/v1/admin/clusters/{cluster_id}/nodes",
            post(handlers::create_node).get(handlers::list_nodes),
        )
        .route(
            "/v1/admin/nodes/{node_id}",
            get(handlers::get_node).delete(handlers::delete_node),
        )
        .route(
            "/v1/admin/nodes/{node_id}/ips",
            post(handlers::add_ip_address).get(handlers::list_ip_addresses),
        )
        .route(
            "/v1/admin/nodes/{node_id}/commands",
            post(handlers::send_command),
        )
        // DNS
        .route(
            "/v1/admin/clusters/{cluster_id}/domains",
            post(handlers::create_domain),
        )
        .route("/v1/admin/domains/{domain_id}", put(handlers::rename_domain))
        .route(
            "/v1/admin/domains/{domain_id}/records",
            post(handlers::create_record),
        )
        .route("/v1/admin/records/{record_id}", put(handlers::update_record))
        .route(
            "/v1/admin/domains/{domain_id}/keys",
            post(handlers::create_key),
        )
        .route("/v1/admin/keys/{key_id}", put(handlers::update_key))
        .route(
            "/v1/admin/clusters/{cluster_id}/routes",
            post(handlers::create_route),
        )
        .route("/v1/admin/routes/{route_id}", put(handlers::update_route))
        // Any syncable kind
        .route(
            "/v1/admin/entities/{kind}/{id}",
            get(handlers::get_entity).delete(handlers::delete_entity),
        )
        .route(
            "/v1/admin/entities/{kind}/{id}/recreate",
            post(handlers::recreate_entity),
        )
        // Operations
        .route("/v1/admin/messages", get(handlers::list_messages))
        .route(
            "/v1/admin/messages/{message_id}/read",
            post(handlers::mark_message_read),
        )
        .route(
            "/v1/admin/cluster-tasks",
            get(handlers::list_cluster_tasks).post(handlers::enqueue_cluster_task),
        )
        .route("/v1/admin/versions", get(handlers::list_versions))
        .route(
            "/v1/admin/tokens",
            post(handlers::create_token).get(handlers::list_tokens),
        )
        .route(
            "/v1/admin/tokens/{token_id}",
            delete(handlers::revoke_token),
        );

    let mut router = Router::new()
        .route("/v1/auth/whoami", get(handlers::whoami))
        // Unauthenticated for load balancers and orchestrator probes.
        .route("/v1/health", get(handlers::health_check))
        .merge(node_routes)
        .merge(admin_routes);

    // When enabled, restrict this endpoint to the Prometheus scraper at the
    // network level. See crate::metrics.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
