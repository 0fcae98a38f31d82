use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use tenant_gate::auth::{AuthState, GateBuilder, GuardRequest, Operation, RoleRegistry, TokenSet};
use tenant_gate::config::{self, ConfigBuilder};
use tenant_gate::observability::init_observability;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "tenant-gate")]
#[command(about = "Authorization and tenant isolation diagnostics", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Expected token issuer
    #[arg(long, global = true)]
    issuer: Option<Url>,

    /// JWKS URI for asymmetric token signatures
    #[arg(long, global = true)]
    jwks_uri: Option<Url>,

    /// Refresh scheduling threshold in seconds
    #[arg(long, global = true, default_value = "30")]
    refresh_threshold: u64,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable JSON logging output
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a token, resolve its identity and evaluate one access
    Check(CheckArgs),
    /// Print the seeded role registry
    Roles,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Bearer access token
    #[arg(long, env = "TG_TOKEN", hide_env_values = true)]
    token: String,

    /// Resource to access
    #[arg(short, long)]
    resource: String,

    /// Action on the resource
    #[arg(short, long, default_value = "read")]
    action: String,

    /// Operation name recorded in the audit event
    #[arg(long)]
    operation: Option<String>,

    /// Role of which at least one is required (repeatable)
    #[arg(long = "role")]
    roles: Vec<String>,

    /// Target tenant (defaults to the caller's own)
    #[arg(short, long)]
    tenant: Option<String>,

    /// Request the admin cross-tenant override
    #[arg(long)]
    cross_tenant: bool,
}

fn remaining_secs(exp: Option<i64>) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    exp.and_then(|e| u64::try_from(e).ok())
        .map_or(0, |e| e.saturating_sub(now))
}

async fn check(config: &tenant_gate::Config, args: CheckArgs) -> anyhow::Result<()> {
    #[allow(unused_mut)]
    let mut auth = config.auth.clone();

    #[cfg(feature = "oidc")]
    {
        if auth.jwt.jwks_uri.is_none()
            && let Some(issuer) = auth.jwt.issuer.clone()
        {
            tenant_gate::auth::oidc::discover(&issuer)
                .await?
                .apply(&mut auth);
        }
    }

    let gate = GateBuilder::from_config(&auth)?.build();

    let claims = gate.verifier().verify(&args.token).await?;
    let tokens = TokenSet::new(args.token, "").with_lifetimes(remaining_secs(claims.exp), 0);
    let state = gate.initialize(Some(tokens)).await;

    let operation = Operation::new(
        args.operation
            .unwrap_or_else(|| format!("{}:{}", args.resource, args.action)),
        args.resource,
        args.action,
    );
    let mut request = GuardRequest::new(operation)
        .with_roles(args.roles)
        .cross_tenant(args.cross_tenant);
    if let Some(tenant) = args.tenant {
        request = request.for_tenant(tenant);
    }

    let decision = gate.guard(&request);
    let user = gate.user().map(|u| {
        serde_json::json!({
            "user_id": u.user_id(),
            "tenant_id": u.tenant_id(),
            "roles": u.roles(),
        })
    });

    gate.flush_audit().await;
    let report = serde_json::json!({
        "state": state,
        "user": user,
        "decision": decision,
        "audit": gate.audit_health(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if state != AuthState::Authenticated {
        anyhow::bail!("credential not accepted (state: {state})");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Apply CLI arguments first: precedence is env > file > CLI > defaults
    let mut base = ConfigBuilder::new()
        .refresh_threshold(Duration::from_secs(cli.refresh_threshold))
        .json_logs(cli.json_logs);
    if let Some(issuer) = cli.issuer {
        base = base.issuer(issuer);
    }
    if let Some(uri) = cli.jwks_uri {
        base = base.jwks_uri(uri);
    }
    if cli.verbose {
        base = base.log_level("debug".to_string());
    }

    let args = match cli.command {
        Command::Roles => {
            let roles = RoleRegistry::seeded().roles();
            println!("{}", serde_json::to_string_pretty(&roles)?);
            return Ok(());
        }
        Command::Check(args) => args,
    };

    let builder = if let Some(ref path) = cli.config {
        config::load_config_from_path(path, base)?
    } else {
        config::load_config(base)?
    };
    let config = builder.build()?;

    init_observability(&config.telemetry)?;
    tracing::debug!(auth = ?config.auth, "Configuration loaded");

    check(&config, args).await
}
