use easyexpense_auth::{telemetry, AppConfig, BackendConfig, CredentialService};

/// Opens the configured credential store so it is ready for the web layer:
/// runs Postgres migrations, or creates the users file directory.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = AppConfig::from_env()?;
    match &config.backend {
        BackendConfig::File { path } => {
            tracing::info!(path = %path.display(), "using file credential store")
        }
        BackendConfig::Postgres(pg) => {
            tracing::info!(
                from_url = pg.database_url.is_some(),
                database = %pg.database,
                "using postgres credential store"
            )
        }
    }

    let service = CredentialService::from_config(&config).await?;
    tracing::info!(backend = service.backend_kind(), "credential store ready");
    Ok(())
}
