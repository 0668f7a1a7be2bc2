use anyhow::Result;
use clap::Parser;
use client_core::{load_settings, ClientEvent, WorkshopClient};
use shared::domain::ContactId;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Signs in and follows unread and session notices until interrupted.
#[derive(Parser, Debug)]
struct Args {
    /// Overrides the API base URL from workshop.toml or the environment.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long, env = "WORKSHOP_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    #[arg(long, default_value = "/dashboard")]
    route: String,
    /// Opens a conversation after startup, marking it read.
    #[arg(long)]
    open: Option<ContactId>,
}

/// `RUST_LOG` when set, otherwise `info`.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(log_filter()).init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    let client = WorkshopClient::new(&settings)?;

    if let (Some(email), Some(password)) = (&args.email, &args.password) {
        let identity = client.session().sign_in(email, password).await?;
        println!("Signed in as {} <{}>", identity.name, identity.email);
    }

    let mut events = client.subscribe_events();
    let mut unread = client.unread().subscribe();
    client.start(args.route).await;
    println!("unread: {}", *unread.borrow_and_update());

    if let Some(contact_id) = args.open {
        match client.unread().open_conversation(contact_id).await {
            Ok(messages) => {
                for message in messages {
                    println!("[{}] {:?}: {}", message.sent_at, message.direction, message.body);
                }
            }
            Err(err) => warn!(%err, %contact_id, "could not open conversation"),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = unread.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("unread: {}", *unread.borrow_and_update());
            }
            event = events.recv() => match event {
                Ok(ClientEvent::Notice(notice)) => println!("{}", notice.message()),
                Ok(ClientEvent::Navigated(route)) => info!(%route, "navigated"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}
