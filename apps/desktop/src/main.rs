use anyhow::Result;
use clap::Parser;
use inbox_core::{config, InboxEvent, InboxService, SessionIdentity};
use shared::domain::PropertyId;
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the configured REST base url.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    user: String,
    #[arg(long)]
    token: String,
    /// Open the conversation for this property after the inbox loads.
    #[arg(long)]
    property: Option<i64>,
    /// Send one message into the opened conversation.
    #[arg(long)]
    say: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }

    let service = InboxService::new(
        settings,
        SessionIdentity {
            user: args.user,
            auth_token: args.token,
        },
    );
    let mut events = service.subscribe_events();
    service.start_session().await?;

    for entry in service.inbox_snapshot().await {
        let preview = entry
            .last_message
            .as_ref()
            .map(|message| message.text.as_str())
            .unwrap_or("<no messages yet>");
        println!(
            "chat {} (property {}): {} unread | {}",
            entry.chat_id.0, entry.property_id.0, entry.unread_count, preview
        );
    }

    if let Some(property) = args.property {
        let chat_id = service.open_conversation(PropertyId(property)).await?;
        info!(chat_id = chat_id.0, "conversation opened");
        for message in service.open_messages().await {
            println!("  {}: {}", message.sender, message.text);
        }
        if let Some(text) = args.say {
            service.send_message(&text).await?;
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(InboxEvent::MessageReceived { chat_id, message }) => {
                    println!("[chat {}] {}: {}", chat_id.0, message.sender, message.text);
                }
                Ok(InboxEvent::ReadMarked { chat_id }) => {
                    println!("[chat {}] marked read", chat_id.0);
                }
                Ok(_) => {}
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    service.end_session().await;
    Ok(())
}
