use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use url::Url;

use webauth_core::{
    AuthHandle, ChallengeMethod, ContextBridge, FileSessionStore, HandshakeController, Navigator,
    ProviderConfig, SessionStore,
};

mod loopback;

use loopback::LoopbackNavigator;

/// Walk through the authorization-code-with-PKCE handshake from a terminal.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Identity provider base URI, e.g. https://id.example.com
    #[arg(long)]
    issuer: Url,

    /// OAuth client identifier.
    #[arg(long)]
    client_id: String,

    /// Requested scopes, space separated.
    #[arg(long, default_value = "")]
    scope: String,

    /// Requested audience.
    #[arg(long, default_value = "")]
    audience: String,

    /// Loopback port for the redirect; 0 picks a free one.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Print the authorization URL instead of opening the system browser.
    #[arg(long)]
    no_browser: bool,

    /// Send a derived S256 code challenge instead of the verifier.
    #[arg(long)]
    s256: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    if let Err(err) = run() {
        eprintln!("{err:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let cli = Cli::parse();

    let listener = loopback::bind(cli.port).await?;
    let redirect_uri = listener.redirect_uri().clone();

    let mut config = ProviderConfig::new(cli.issuer, cli.client_id, redirect_uri)
        .with_scope(cli.scope)
        .with_audience(cli.audience);
    if cli.s256 {
        config = config.with_challenge_method(ChallengeMethod::S256);
    }

    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::with_default_locator()?);
    let navigator = Arc::new(LoopbackNavigator::new(!cli.no_browser));
    let controller = HandshakeController::new(
        config,
        Arc::clone(&store),
        Arc::clone(&navigator) as Arc<dyn Navigator>,
    )?;

    let bridge = ContextBridge::new();
    let _scope = bridge.install(AuthHandle::new(Arc::new(controller)));
    let value = bridge.value();
    let auth = value.handle()?;

    // First activation mints and persists the verifier/state pair.
    auth.activate().await;
    auth.authenticate().await?;

    let callback = listener.accept_redirect(store.as_ref()).await?;
    navigator.set_location(callback);

    // Post-redirect activation performs the code exchange.
    auth.activate().await;
    let snapshot = auth.snapshot().await;
    if !snapshot.is_authenticated {
        match &snapshot.last_error {
            Some(failure) => bail!("token exchange failed: {}", failure.detail),
            None => bail!("authentication did not complete"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
