use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{load_settings, SessionClient};
use shared::domain::{CallId, UserId};
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Account username; required unless --guest.
    #[arg(long)]
    username: Option<String>,
    /// Connect the anonymous endpoint instead of signing in.
    #[arg(long)]
    guest: bool,
    /// Look up a peer by id after connecting.
    #[arg(long)]
    peer_id: Option<i64>,
    /// Request a call token for this call id and print it.
    #[arg(long)]
    call_id: Option<String>,
    /// List system audio sources for screen sharing, then exit.
    #[arg(long)]
    list_audio_sources: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    if args.list_audio_sources {
        return list_audio_sources().await;
    }

    let settings = load_settings();
    let client = SessionClient::new(settings).await;

    if args.guest {
        client.open_guest().await?;
        info!("connected as guest");
    } else {
        let username = args
            .username
            .as_deref()
            .ok_or_else(|| anyhow!("--username is required unless --guest is set"))?;
        let me = client.sign_in(username).await?;
        println!("Signed in as {} (user_id={})", me.display_name, me.user_id.0);
        client.open().await?;
    }

    if let Some(peer_id) = args.peer_id {
        let record = client.directory().get(UserId(peer_id), false).await;
        println!("{}", serde_json::to_string_pretty(&record)?);
    }

    if let Some(call_id) = args.call_id {
        let token = client
            .calls()
            .get_call_token(&CallId::new(call_id))
            .await?;
        println!("call token: {token}");
    }

    client.close().await;
    Ok(())
}

async fn list_audio_sources() -> Result<()> {
    let platform = capture::detect_platform();
    let backend = capture::backend_for(platform, None);
    println!(
        "platform: {platform} (loopback available: {})",
        backend.is_available()
    );
    for source in backend.list_sources().await? {
        println!("  {} [{:?}]", source.label, source.kind);
    }
    Ok(())
}
