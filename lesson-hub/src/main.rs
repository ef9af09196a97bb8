use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use lesson_hub::{
    api,
    config::{load_callouts, load_config, load_keycloak, Cli, Settings},
    watcher::{self, Rescanner, DEFAULT_DEBOUNCE},
};
use lesson_hub_core::{
    index::DocumentIndex,
    keycloak::KeycloakClient,
    permission::Evaluator,
    pipeline::Pipeline,
    preferences::{AttributeStore, MemoryAttributeStore},
    principal::SessionRefresher,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOCAL_CLIENT_ID: &str = "lesson-hub";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::new(&cli, load_config());
    let callouts = load_callouts(cli.callouts.as_deref())?;

    let (store, refresher, client_id) = match &cli.keycloak_config {
        Some(path) => {
            let client = Arc::new(KeycloakClient::new(load_keycloak(path)?));
            let client_id = client.client_id().to_string();
            let store: Arc<dyn AttributeStore> = client.clone();
            let refresher: Arc<dyn SessionRefresher> = client;
            (store, Some(refresher), client_id)
        }
        None => {
            warn!("no keycloak config given, user attributes are kept in memory");
            let store: Arc<dyn AttributeStore> = Arc::new(MemoryAttributeStore::new());
            (store, None, LOCAL_CLIENT_ID.to_string())
        }
    };

    let index = Arc::new(DocumentIndex::new());
    let diff = index.scan(&settings.prefix, &settings.content_root, true, &settings.excluded_dirs);
    info!(documents = index.current().entries.len(), added = diff.added.len(), "initial scan complete");

    let pipeline = Pipeline::new(Evaluator::new(store, client_id), index.clone())
        .with_callouts(callouts)
        .with_plantuml_url(settings.plantuml_url.clone());

    let _watcher = if settings.autoscan {
        let rescanner = Arc::new(Rescanner::new(
            index.clone(),
            settings.content_root.clone(),
            settings.prefix.clone(),
            settings.excluded_dirs.clone(),
            DEFAULT_DEBOUNCE,
        ));
        Some(watcher::watch(rescanner, &settings.content_root)?)
    } else {
        None
    };

    let addr = settings.addr.clone();
    let app = api::router(api::AppState::new(pipeline, refresher, settings));
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
