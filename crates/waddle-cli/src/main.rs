// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Waddle Social

//! waddle-connect - log in to an XMPP server and stay online until Ctrl-C.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use waddle_xmpp_client::config::{load_config_from, DEFAULT_CONFIG_TOML};
use waddle_xmpp_client::{ClientConfig, MucModule, PresenceModule, XmppClient};

/// Connect to an XMPP server with the Waddle client engine
#[derive(Parser)]
#[command(name = "waddle-connect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "WADDLE_CONFIG", default_value = "waddle.toml")]
    config: PathBuf,

    /// Write a configuration template to the config path and exit
    #[arg(long)]
    init: bool,

    /// Presence status text to announce after login
    #[arg(short, long)]
    status: Option<String>,

    /// Multi-user chat room to join, as room@service
    #[arg(short, long)]
    room: Option<String>,

    /// Nickname used in the room (defaults to the account username)
    #[arg(short, long)]
    nick: Option<String>,
}

fn init_tracing(level: &str) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn write_template(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists, not overwriting", path.display());
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote configuration template to {}", path.display());
    Ok(())
}

async fn run(cli: &Cli, config: &ClientConfig) -> Result<()> {
    let client: XmppClient = config.apply(XmppClient::builder()).build();

    client
        .connect(config.host(), config.server.port, &config.server.domain)
        .context("connect rejected")?
        .await
        .with_context(|| format!("failed to connect to {}:{}", config.host(), config.server.port))?;

    client
        .login(
            &config.account.username,
            &config.account.password,
            config.account.resource.as_deref(),
        )
        .context("login rejected")?
        .await
        .context("login failed")?;
    info!(jid = %client.jid(), "online");

    let presence = client.module::<PresenceModule>()?;
    presence.send_available(None, cli.status.as_deref())?;

    if let Some(room) = &cli.room {
        let nick = cli.nick.as_deref().unwrap_or(&config.account.username);
        let muc = client.module::<MucModule>()?;
        let mut messages = muc.subscribe();
        muc.join_room(room, nick)?;
        info!(%room, %nick, "joined room");

        tokio::spawn(async move {
            while let Ok(message) = messages.recv().await {
                let from = message.nickname.as_deref().unwrap_or(&message.room);
                println!("[{}] {from}: {}", message.room, message.body);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");

    if let Err(error) = presence.send_unavailable() {
        warn!(%error, "could not announce unavailability");
    }
    client.disconnect().await.context("disconnect failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.init {
        return write_template(&cli.config);
    }

    let config = load_config_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_tracing(&config.logging.level);

    run(&cli, &config).await
}
