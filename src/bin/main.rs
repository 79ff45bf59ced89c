use anyhow::{Context, Result};
use authgate::auth::verifier::sign_request;
use authgate::auth::{AuthService, IdentityStore, MemoryIdentityStore};
use authgate::config::MAX_DURATION_SECS;
use authgate::crypto::HmacKey;
use authgate::{AuthSettings, PrincipalId, create_service, generate_api_key, load_settings};
use clap::{Parser, Subcommand};
use http::Method;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "authgate")]
#[command(about = "Multi-scheme request authentication and token service")]
struct Cli {
    /// Settings file (defaults to $AUTHGATE_CONFIG, then XDG, then ./auth.json)
    #[arg(long, global = true, env = "AUTHGATE_CONFIG")]
    config: Option<PathBuf>,
    /// Override jwt.secret from the settings file
    #[arg(long, global = true, env = "AUTHGATE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Bind address, e.g. 0.0.0.0:8080
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
        /// JSON identity document with roles and identities
        #[arg(long)]
        identities: Option<PathBuf>,
    },
    /// Mint a bearer token for an identity
    MintToken {
        principal_id: u64,
        #[arg(long)]
        identities: PathBuf,
        /// Extra claims as a JSON object
        #[arg(long)]
        claims: Option<String>,
        /// Lifetime in seconds (defaults to jwt.token_ttl_secs)
        #[arg(long)]
        ttl_secs: Option<i64>,
    },
    /// Print the HMAC headers for a request
    SignRequest {
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        identity: u64,
        #[arg(long, default_value = "")]
        body: String,
        /// Unix seconds (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },
    /// Generate a new API key
    GenerateApiKey {
        /// Principal the key authenticates as
        #[arg(long)]
        principal_id: Option<u64>,
    },
    /// Load and validate the settings file
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("authgate=info".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, identities } => {
            let settings = settings(cli.config, cli.jwt_secret)?;
            let store = identity_store(identities.as_deref()).await?;
            let service = create_service(settings, store)?;

            let app = authgate::api::create_router(service);
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("Listening on http://{}", bind);

            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await?;
        }
        Commands::MintToken {
            principal_id,
            identities,
            claims,
            ttl_secs,
        } => {
            let settings = settings(cli.config, cli.jwt_secret)?;
            let store = identity_store(Some(identities.as_path())).await?;
            let service: Arc<AuthService> = create_service(settings, store)?;

            let extra: Map<String, Value> = match claims {
                Some(raw) => serde_json::from_str(&raw).context("--claims must be a JSON object")?,
                None => Map::new(),
            };
            let principal_id = PrincipalId::new(principal_id);
            let issued = match ttl_secs {
                Some(secs) => {
                    let ttl = chrono::Duration::try_seconds(secs)
                        .filter(|_| secs.unsigned_abs() <= MAX_DURATION_SECS)
                        .context("--ttl-secs is out of range")?;
                    service.issuer().mint_with_ttl(principal_id, extra, ttl).await?
                }
                None => service.mint(principal_id, extra).await?,
            };

            println!("{}", issued.token);
            eprintln!(
                "Expires: {}",
                issued.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        Commands::SignRequest {
            method,
            path,
            identity,
            body,
            timestamp,
        } => {
            let settings = settings(cli.config, cli.jwt_secret)?;
            if settings.hmac.secret.is_empty() {
                anyhow::bail!("hmac.secret is not configured");
            }
            let key = HmacKey::new(settings.hmac.secret.as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid hmac.secret: {}", e))?;
            let method: Method = method.to_uppercase().parse().context("invalid --method")?;
            let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
            let identity = PrincipalId::new(identity);

            let signature =
                sign_request(&key, &method, &path, timestamp, identity, body.as_bytes());
            println!("X-Auth-Signature: {}", signature);
            println!("X-Auth-Identity: {}", identity);
            println!("X-Auth-Timestamp: {}", timestamp);
        }
        Commands::GenerateApiKey { principal_id } => {
            let (full_key, prefix, key_hash) = generate_api_key();

            println!("API Key generated successfully!");
            println!();
            println!("  Key:     {}", full_key);
            println!("  Prefix:  {}", prefix);
            println!("  SHA-256: {}", key_hash);
            println!();
            if let Some(id) = principal_id {
                println!("Add to the settings file under \"api_keys\":");
                println!("  \"{}\": {}", full_key, id);
                println!();
            }
            println!("IMPORTANT: Save this key now. It cannot be retrieved later.");
            println!("Use with: -H 'X-API-Key: {}'", full_key);
        }
        Commands::CheckConfig => {
            let settings = settings(cli.config, cli.jwt_secret)?;
            println!("Settings OK");
            println!("  Issuer:            {}", settings.jwt.issuer);
            println!("  Token TTL:         {}s", settings.jwt.token_ttl_secs);
            println!("  Refresh threshold: {}s", settings.jwt.refresh_threshold_secs);
            println!(
                "  HMAC:              {}",
                if settings.hmac.secret.is_empty() {
                    "disabled".to_string()
                } else {
                    format!("enabled ({}s window)", settings.hmac.replay_window_secs)
                }
            );
            println!("  API keys:          {}", settings.api_keys.len());
            println!("  Session fallback:  {}", settings.session_fallback);
            for (tier, limit) in [
                ("anonymous", settings.rate_limit.anonymous),
                ("authenticated", settings.rate_limit.authenticated),
                ("premium", settings.rate_limit.premium),
            ] {
                println!(
                    "  Rate limit {:<14} {}/{}s",
                    format!("{}:", tier),
                    limit.requests,
                    limit.window_secs
                );
            }
        }
    }

    Ok(())
}

/// Load settings, apply CLI overrides and validate.
fn settings(path: Option<PathBuf>, jwt_secret: Option<String>) -> Result<AuthSettings> {
    let mut settings = load_settings(path)?;
    if let Some(secret) = jwt_secret {
        settings.jwt.secret = secret;
    }
    settings.validate()?;
    Ok(settings)
}

async fn identity_store(path: Option<&Path>) -> Result<Arc<dyn IdentityStore>> {
    match path {
        Some(path) => Ok(Arc::new(MemoryIdentityStore::from_file(path).await?)),
        None => {
            warn!("No identity document given, every credential will be rejected");
            Ok(Arc::new(MemoryIdentityStore::new()))
        }
    }
}
