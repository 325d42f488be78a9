use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tessera_iam::auth::CredentialVerifier;
use tessera_iam::config::AppConfig;
use tessera_iam::handlers;
use tessera_iam::state::AppState;

#[derive(Parser)]
#[command(name = "tessera-iam", about = "Multi-tenant IAM service", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Seed system roles, permissions, the capability catalog, and
    /// optionally a bootstrap system owner
    Seed {
        #[arg(long)]
        admin_username: Option<String>,
        #[arg(long)]
        admin_email: Option<String>,
        #[arg(long)]
        admin_password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    config.validate().context("configuration invalid")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Seed {
            admin_username,
            admin_email,
            admin_password,
        } => seed(config, admin_username, admin_email, admin_password).await,
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let bind_addr = config.server.bind_addr.clone();
    let (state, audit_pipeline) = AppState::connect(config)
        .await
        .context("failed to build application state")?;

    let app = handlers::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", bind_addr))?;
    tracing::info!("tessera-iam listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Flush pending audit events before exit.
    audit_pipeline.shutdown().await;
    Ok(())
}

async fn seed(
    config: AppConfig,
    admin_username: Option<String>,
    admin_email: Option<String>,
    admin_password: Option<String>,
) -> anyhow::Result<()> {
    let (state, audit_pipeline) = AppState::connect(config)
        .await
        .context("failed to build application state")?;

    let credentials = CredentialVerifier::new(
        state.storage.clone(),
        state.config.security.max_failed_logins,
        state.config.security.lockout_minutes,
    );
    let admin = match (&admin_username, &admin_email, &admin_password) {
        (Some(username), Some(email), Some(password)) => {
            Some((username.as_str(), email.as_str(), password.as_str()))
        }
        (None, None, None) => None,
        _ => anyhow::bail!(
            "--admin-username, --admin-email and --admin-password must be given together"
        ),
    };

    let report = tessera_iam::seed::seed(&state.storage, &credentials, admin)
        .await
        .context("seeding failed")?;
    tracing::info!(
        roles = report.roles_created,
        capabilities = report.capabilities_seeded,
        admin = report.admin_created,
        "Seed complete"
    );

    audit_pipeline.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
