use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::{Config, StorageBackend};
use crate::model::EventKind;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::state::DeliverySettings;

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Courier delivery server and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "COURIER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Tracing filter directives.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    /// Storage backend: `memory` or `redis`.
    #[arg(long, env = "COURIER_STORAGE", default_value = "memory")]
    pub storage: String,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Namespace for every Redis key the server writes.
    #[arg(long, env = "COURIER_KEY_PREFIX", default_value = "courier")]
    pub key_prefix: String,

    /// How long a live delivery waits for the client's acknowledgement.
    #[arg(long, env = "COURIER_ACK_TIMEOUT_MS", default_value_t = 2000)]
    pub ack_timeout_ms: u64,

    /// Stored events sent per outbox batch on reconnect.
    #[arg(long, env = "COURIER_FLUSH_BATCH_SIZE", default_value_t = 10)]
    pub flush_batch_size: usize,

    #[arg(long, env = "COURIER_FLUSH_ACK_TIMEOUT_MS", default_value_t = 2000)]
    pub flush_ack_timeout_ms: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Invoke one operation against a running server and print what comes back
    Call {
        /// Server URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Bind the connection to this user with `connectUser` first
        #[arg(long)]
        uid: Option<String>,

        /// Operation name, e.g. `checkUsernameAvailable`
        event: String,

        /// JSON payload for the operation
        #[arg(default_value = "{}")]
        payload: String,

        /// Keep printing (and acknowledging) server events for this many seconds
        #[arg(long, default_value_t = 0)]
        listen: u64,
    },
}

impl TryFrom<ServerArgs> for Config {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let storage: StorageBackend = args.storage.parse().map_err(|e: String| anyhow!(e))?;
        if args.flush_batch_size == 0 {
            return Err(anyhow!("flush batch size must be at least 1"));
        }
        Ok(Config {
            listen_addr,
            log_filter: args.log_filter,
            storage,
            redis_url: args.redis_url,
            key_prefix: args.key_prefix,
            delivery: DeliverySettings {
                ack_timeout: Duration::from_millis(args.ack_timeout_ms),
                flush_batch_size: args.flush_batch_size,
                flush_ack_timeout: Duration::from_millis(args.flush_ack_timeout_ms),
            },
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Answer the server would expect from a well-behaved client: every id of a
/// pending-events batch is accepted, anything else is acknowledged with `true`.
fn acknowledge(event: &str, payload: Option<&Value>) -> Value {
    match payload {
        Some(Value::Object(batch)) if event == EventKind::ReceivedPendingEvents.as_str() => {
            let accepted: Map<String, Value> = batch
                .keys()
                .map(|id| (id.clone(), Value::Bool(true)))
                .collect();
            Value::Object(accepted)
        }
        _ => Value::Bool(true),
    }
}

async fn send_frame(ws: &mut WsStream, frame: &ClientFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    ws.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Reads frames until the reply to `ack_id` arrives, printing and
/// acknowledging any server events seen on the way.
async fn await_reply(ws: &mut WsStream, ack_id: u64) -> Result<(Option<String>, Option<Value>)> {
    while let Some(msg) = ws.next().await {
        let Message::Text(text) = msg? else {
            continue;
        };
        match serde_json::from_str::<ServerFrame>(&text)? {
            ServerFrame::Ack {
                ack_id: id,
                error,
                result,
            } if id == ack_id => return Ok((error, result)),
            ServerFrame::Error { message } => return Err(anyhow!("Server error: {}", message)),
            frame => print_and_ack(ws, frame).await?,
        }
    }
    Err(anyhow!("Connection closed before the server replied"))
}

async fn print_and_ack(ws: &mut WsStream, frame: ServerFrame) -> Result<()> {
    if let ServerFrame::Event {
        event,
        payload,
        ack_id,
    } = frame
    {
        println!(
            "<- {} {}",
            event,
            payload
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_default()
        );
        if let Some(ack_id) = ack_id {
            let result = acknowledge(&event, payload.as_ref());
            send_frame(
                ws,
                &ClientFrame::Ack {
                    ack_id,
                    error: None,
                    result: Some(result),
                },
            )
            .await?;
        }
    }
    Ok(())
}

async fn call(ws: &mut WsStream, ack_id: u64, event: &str, payload: Value) -> Result<Value> {
    send_frame(
        ws,
        &ClientFrame::Request {
            event: event.to_string(),
            payload,
            ack_id: Some(ack_id),
        },
    )
    .await?;
    match timeout(Duration::from_secs(10), await_reply(ws, ack_id)).await {
        Ok(Ok((None, result))) => Ok(result.unwrap_or(Value::Null)),
        Ok(Ok((Some(error), _))) => Err(anyhow!("{} failed: {}", event, error)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow!("Timeout waiting for the reply to {}", event)),
    }
}

pub async fn run_call_client(
    url: String,
    uid: Option<String>,
    event: String,
    payload: String,
    listen: u64,
) -> Result<()> {
    let payload: Value = serde_json::from_str(&payload).context("payload is not valid JSON")?;
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("Connecting to {}", ws_url);

    let (mut ws, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow!("Connection timeout - is the courier server running?"));
        }
    };

    let mut next_ack = 1;
    if let Some(uid) = uid {
        let profile = call(&mut ws, next_ack, "connectUser", serde_json::json!({ "uid": uid })).await?;
        println!("connected as {}", profile);
        next_ack += 1;
    }

    let result = call(&mut ws, next_ack, &event, payload).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    let deadline = Instant::now() + Duration::from_secs(listen);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let frame = match timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<ServerFrame>(&text)?,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) | Err(_) => break,
        };
        print_and_ack(&mut ws, frame).await?;
    }

    ws.send(Message::Close(None)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test_timeout::timeout]
    fn defaults_produce_the_documented_config() {
        let cli = parse(&["courier", "--log-filter", "info", "--storage", "memory"]);
        let config = Config::try_from(cli.server).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.delivery, DeliverySettings::default());
    }

    #[test_timeout::timeout]
    fn rejects_bad_addresses_backends_and_batch_sizes() {
        let bad_addr = parse(&["courier", "--listen-addr", "nope"]);
        assert!(Config::try_from(bad_addr.server).is_err());
        let bad_backend = parse(&["courier", "--storage", "postgres"]);
        assert!(Config::try_from(bad_backend.server).is_err());
        let bad_batch = parse(&["courier", "--flush-batch-size", "0"]);
        assert!(Config::try_from(bad_batch.server).is_err());
    }

    #[test_timeout::timeout]
    fn call_subcommand_parses() {
        let cli = parse(&[
            "courier",
            "call",
            "--uid",
            "alice",
            "checkChannels",
            r#"{"channelIDs":[]}"#,
        ]);
        match cli.command {
            Some(Commands::Call { uid, event, .. }) => {
                assert_eq!(uid.as_deref(), Some("alice"));
                assert_eq!(event, "checkChannels");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn pending_batches_are_accepted_id_by_id() {
        let batch = json!({"3": {"eventName": "receivedCD"}, "4": {"eventName": "receivedMessage"}});
        assert_eq!(
            acknowledge("receivedPendingEvents", Some(&batch)),
            json!({"3": true, "4": true})
        );
        assert_eq!(acknowledge("receivedCR", Some(&batch)), json!(true));
        assert_eq!(acknowledge("receivedPendingEvents", None), json!(true));
    }
}
