pub mod auth;
mod config;
mod docstore;
mod error;
pub mod metrics_server;
mod routes;
pub mod share;

pub use config::{Cli, IndexSettings, ServerConfig};
pub use docstore::DocStore;
pub use error::{ApiError, ApiErrorExt};

use axum::http::StatusCode;
use std::sync::Arc;

/// Process-wide state threaded through every request handler.
pub struct App {
    pub config: ServerConfig,
    pub oidc: auth::OidcClient,
    pub docstore: DocStore,
    pub index: databrowser::IndexConfig,
    cache: tokio::sync::OnceCell<portal_cache::Cache>,
}

impl App {
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let docstore = DocStore::connect(&config.database_url)?;
        if let Err(error) = docstore.ensure_schema().await {
            tracing::warn!(%error, "document store not reachable yet; continuing");
        }

        let index = match &config.index {
            IndexSettings::Solr { host, port, core } => {
                databrowser::IndexConfig::Solr(databrowser::SolrConfig {
                    host: host.clone(),
                    port: *port,
                    cores: (core.clone(), "latest".to_string()),
                    fields: databrowser::default_fields(),
                })
            }
            IndexSettings::Rdbms {
                table,
                pagination_column,
            } => databrowser::IndexConfig::Rdbms(databrowser::RdbmsConfig {
                pool: docstore.pool(),
                table: table.clone(),
                pagination_column: pagination_column.clone(),
                lookup: databrowser::RdbmsConfig::default_lookup(),
                fields: databrowser::default_fields(),
            }),
            IndexSettings::SearchEngine { url, index } => {
                databrowser::IndexConfig::SearchEngine(databrowser::SearchEngineConfig {
                    url: url.clone(),
                    index: index.clone(),
                    lookup: databrowser::RdbmsConfig::default_lookup(),
                    fields: databrowser::default_fields(),
                })
            }
        };

        let oidc = auth::OidcClient::new(
            &config.oidc_url,
            &config.oidc_client_id,
            config.oidc_client_secret.clone(),
            config.token_claims.clone(),
            config.admin_claims.clone(),
        );

        Ok(Self {
            config,
            oidc,
            docstore,
            index,
            cache: tokio::sync::OnceCell::new(),
        })
    }

    pub fn service_enabled(&self, name: &str) -> bool {
        self.config.services.contains(name)
    }

    /// The shared cache client, created on first use. Requests that need it
    /// while the zarr-stream service is disabled are turned away.
    pub async fn cache(&self) -> Result<&portal_cache::Cache, ApiError> {
        if !self.service_enabled("zarr-stream") {
            return Err(ApiError::detail(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service not enabled.",
            ));
        }
        self.cache
            .get_or_try_init(|| async {
                portal_cache::Cache::connect(&self.config.cache).await
            })
            .await
            .map_err(|error| {
                tracing::error!(%error, "could not connect to cache");
                ApiError::detail(StatusCode::SERVICE_UNAVAILABLE, "Cache gone.")
            })
    }
}

/// Build the public router: databrowser, flavours, data-portal, auth and
/// the minimal STAC API, all rooted below the configured prefix.
pub fn build_router(app: Arc<App>) -> axum::Router<()> {
    let api = axum::Router::new()
        .merge(routes::databrowser::router())
        .merge(routes::flavours::router())
        .merge(routes::zarr::router())
        .merge(routes::stacapi::router())
        .merge(auth::endpoints::router());

    axum::Router::new()
        .nest(&app.config.prefix, api)
        .route(
            "/.well-known/openid-configuration",
            axum::routing::get(auth::endpoints::well_known),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_methods(tower_http::cors::AllowMethods::any())
                .allow_origin(tower_http::cors::AllowOrigin::any())
                .allow_headers(tower_http::cors::AllowHeaders::any()),
        )
        .with_state(app)
}
