//! Auth probe
//!
//! Single-binary service that:
//! 1. Loads one provider and one token store from TOML
//! 2. Attaches credentials to a single outbound request
//! 3. Prints the response status
//!
//! Interactive providers prompt on stderr (device code) or open the system
//! browser (authorization code). `--sign-out` deletes the stored token for
//! the configured session instead of sending a request.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use oauth_flows::{CallbackFuture, DeviceAuthorization, DevicePrompt, OpenUrl};
use provider::{AuthenticationProvider, ProviderContext};
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    config: Option<String>,
    sign_out: bool,
}

/// Simple flag parsing: `--config <path>` and `--sign-out`.
fn parse_args(args: &[String]) -> CliArgs {
    CliArgs {
        config: args
            .iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1))
            .cloned(),
        sign_out: args.iter().any(|a| a == "--sign-out"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting auth-probe");

    let args: Vec<String> = std::env::args().collect();
    let cli = parse_args(&args);

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        provider = %config.provider.name,
        scheme = config.provider.auth.kind(),
        store = config.store.kind(),
        session = %config.request.session,
        "configuration loaded"
    );

    let context = provider_context(&config)?;

    if cli.sign_out {
        let provider = build_provider(&config, &context)?;
        provider
            .sign_out(&config.request.session)
            .await
            .with_context(|| format!("failed to sign out of {}", provider.name()))?;
        info!(provider = provider.name(), session = %config.request.session, "signed out");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let status = probe(&config, &context, &cancel).await?;
    println!("{status}");
    if !status.is_success() {
        bail!("request to {} returned {status}", config.request.url);
    }
    Ok(())
}

/// Shared pieces every provider variant may need.
fn provider_context(config: &Config) -> Result<ProviderContext> {
    let store = config.store.open().context("failed to open token store")?;
    let http = oauth_flows::http_client(config.request.timeout())
        .context("failed to build HTTP client")?;
    Ok(ProviderContext {
        http,
        store,
        device_prompt: terminal_prompt(),
        open_url: system_browser(),
    })
}

fn build_provider(config: &Config, context: &ProviderContext) -> Result<AuthenticationProvider> {
    AuthenticationProvider::from_config(&config.provider, context)
        .with_context(|| format!("invalid provider {:?}", config.provider.name))
}

/// Authenticate and send the configured request once.
async fn probe(
    config: &Config,
    context: &ProviderContext,
    cancel: &CancellationToken,
) -> Result<StatusCode> {
    let provider = build_provider(config, context)?;
    let url = Url::parse(&config.request.url).context("invalid request.url")?;
    let mut request = reqwest::Request::new(config.request.method(), url);

    provider
        .apply_for_session(&mut request, &config.request.session, cancel)
        .await
        .with_context(|| format!("failed to authenticate with {}", provider.name()))?;

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => bail!("interrupted before the request completed"),
        result = context.http.execute(request) => result
            .with_context(|| format!("request to {} failed", config.request.url))?,
    };

    let status = response.status();
    info!(
        provider = provider.name(),
        status = status.as_u16(),
        "probe request completed"
    );
    Ok(status)
}

fn terminal_prompt() -> DevicePrompt {
    Arc::new(|auth: DeviceAuthorization| -> CallbackFuture {
        Box::pin(async move {
            eprintln!(
                "To sign in, open {} and enter the code {}",
                auth.verification_uri, auth.user_code
            );
            if let Some(complete) = &auth.verification_uri_complete {
                eprintln!("Or open {complete}");
            }
            eprintln!("The code expires in {} seconds.", auth.expires_in.as_secs());
        })
    })
}

/// Open the authorization URL in the default browser, printing it when no
/// browser can be launched.
fn system_browser() -> OpenUrl {
    Arc::new(|url: String| -> CallbackFuture {
        Box::pin(async move {
            let target = url.clone();
            match tokio::task::spawn_blocking(move || open::that(target)).await {
                Ok(Ok(())) => info!("opened browser for sign-in"),
                Ok(Err(e)) => warn!(error = %e, "failed to open browser"),
                Err(e) => warn!(error = %e, "browser launch task failed"),
            }
            eprintln!("If the browser did not open, visit:\n{url}");
        })
    })
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, cancelling"),
        _ = terminate => info!("received SIGTERM, cancelling"),
    }
}
