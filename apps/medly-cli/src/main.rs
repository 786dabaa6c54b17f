use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use medly_store::{DirectMessaging, SessionIdentity, StoreConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and drive a Medly message database", long_about = None)]
struct Args {
    /// SQLite database file
    #[arg(long, env = "MEDLY_DB", default_value = "medly-store.db")]
    db: PathBuf,

    /// Act as this participant
    #[arg(short, long)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the Alice/Bob walkthrough against the database
    Demo,
    /// List the conversations of the current user
    Conversations,
    /// Open (or reuse) a conversation with another participant
    Open {
        peer: String,
        #[arg(long, default_value = "")]
        my_name: String,
        #[arg(long, default_value = "")]
        peer_name: String,
    },
    /// Show the message history of a conversation
    History { conversation_id: String },
    /// Send a message to the other side of a conversation
    Send {
        conversation_id: String,
        content: String,
    },
    /// Mark incoming messages of a conversation as delivered
    Delivered { conversation_id: String },
    /// Mark incoming messages of a conversation as read
    Read { conversation_id: String },
    /// Print the current user's total unread count
    Unread,
    /// Rebuild unread counters of a conversation from its messages
    Repair { conversation_id: String },
    /// Print conversation snapshots as they change, until Ctrl-C
    Watch,
    /// Hide a conversation; its messages are kept
    Delete { conversation_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let args = Args::parse();

    let identity = Arc::new(match &args.user {
        Some(user) => SessionIdentity::signed_in(user.clone()),
        None => SessionIdentity::signed_out(),
    });
    let config = StoreConfig {
        db_path: args.db.clone(),
        ..Default::default()
    };
    let dm = DirectMessaging::open(&config, identity.clone())
        .await
        .with_context(|| format!("opening {}", args.db.display()))?;

    match args.command {
        Command::Demo => demo(&dm, &identity).await?,
        Command::Conversations => print_json(&dm.my_conversations().await?)?,
        Command::Open {
            peer,
            my_name,
            peer_name,
        } => {
            let me = dm.current_user()?;
            let my_name = if my_name.is_empty() { me.clone() } else { my_name };
            let peer_name = if peer_name.is_empty() { peer.clone() } else { peer_name };
            let conv = dm
                .create_or_get_conversation(&me, &peer, &my_name, &peer_name)
                .await?;
            print_json(&conv)?;
        }
        Command::History { conversation_id } => {
            print_json(&dm.list_messages(&conversation_id).await?)?
        }
        Command::Send {
            conversation_id,
            content,
        } => print_json(&dm.reply(&conversation_id, &content).await?)?,
        Command::Delivered { conversation_id } => {
            let me = dm.current_user()?;
            print_json(&dm.mark_messages_as_delivered(&conversation_id, &me).await?)?;
        }
        Command::Read { conversation_id } => {
            let me = dm.current_user()?;
            print_json(&dm.mark_messages_as_read(&conversation_id, &me).await?)?;
        }
        Command::Unread => println!("{}", dm.my_total_unread_count().await?),
        Command::Repair { conversation_id } => {
            print_json(&dm.tracker().recompute_unread(&conversation_id).await?)?
        }
        Command::Watch => watch(&dm).await?,
        Command::Delete { conversation_id } => {
            dm.delete_conversation(&conversation_id).await?;
            println!("Deleted {}", conversation_id);
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn watch(dm: &DirectMessaging) -> Result<()> {
    let me = dm.current_user()?;
    let mut conversations = dm.subscribe_conversations(&me);
    info!("Watching conversations of {}", me);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            snapshot = conversations.next() => match snapshot {
                Some(snapshot) => print_json(&snapshot)?,
                None => break,
            },
        }
    }

    conversations.cancel().await;
    Ok(())
}

async fn demo(dm: &DirectMessaging, identity: &SessionIdentity) -> Result<()> {
    let conv = dm
        .create_or_get_conversation("u1", "u2", "Alice", "Bob")
        .await?;
    println!("Conversation {} between Alice and Bob", conv.id);

    identity.sign_in("u1");
    let receipt = dm.reply(&conv.id, "hello").await?;
    println!(
        "Alice sent {:?} ({:?})",
        receipt.message.content, receipt.message.delivery_status
    );

    identity.sign_in("u2");
    println!("Bob has {} unread", dm.my_total_unread_count().await?);

    let delivered = dm.mark_messages_as_delivered(&conv.id, "u2").await?;
    println!("Delivered {} message(s) to Bob", delivered.len());

    let read = dm.mark_messages_as_read(&conv.id, "u2").await?;
    println!(
        "Bob read {} message(s), counter reset: {:?}",
        read.message_ids.len(),
        read.counter_reset
    );

    let remaining = dm.my_total_unread_count().await?;
    if remaining != 0 {
        bail!("Bob still has {} unread after reading", remaining);
    }
    println!("Bob has {} unread", remaining);

    identity.sign_out();
    Ok(())
}
