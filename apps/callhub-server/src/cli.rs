use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use crate::client::ClientSession;
use crate::config::Config;
use crate::peer_link::{MediaEngine, MediaError, Opening, Side};
use crate::signaling::{ClientMessage, MediaLink, Role, ServerMessage, SignalPayload};

#[derive(Parser, Debug)]
#[command(name = "callhub-server")]
#[command(about = "CallHub room registry and signaling server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind (overrides CALLHUB_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to listen on (overrides CALLHUB_PORT)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the signaling server (default)
    Serve,

    /// Join a room on a running server and print every event it receives
    Watch {
        /// Server base URL
        #[arg(short, long, default_value = "ws://localhost:5000")]
        url: String,

        /// Room to join
        #[arg(short, long)]
        room: String,

        /// Display name
        #[arg(short, long, default_value = "watcher")]
        name: String,

        /// Role to claim, `admin` or `user`
        #[arg(long, default_value = "user")]
        role: Role,

        /// How long to stay in the room after joining
        #[arg(long, default_value_t = 10)]
        listen_secs: u64,

        /// Accept screen-share requests from the admin
        #[arg(long)]
        accept_screen_share: bool,
    },
}

impl Cli {
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub url: String,
    pub room: String,
    pub name: String,
    pub role: Role,
    pub listen: Duration,
    pub accept_screen_share: bool,
    pub join_timeout: Duration,
}

/// Media engine for a client without any media: connections are bare
/// handles and no descriptions are produced.
#[derive(Debug, Default)]
pub struct SilentEngine {
    next: u64,
}

impl MediaEngine for SilentEngine {
    type Connection = u64;

    fn open(&mut self, remote_id: &str, link: MediaLink, side: Side) -> Result<Opening<u64>, MediaError> {
        self.next += 1;
        debug!(remote_id = %remote_id, ?link, ?side, "link opened");
        Ok(Opening::Ready {
            connection: self.next,
            local: None,
        })
    }

    fn apply_remote(
        &mut self,
        connection: &mut u64,
        _payload: &SignalPayload,
    ) -> Result<Option<SignalPayload>, MediaError> {
        debug!(connection = *connection, "remote description ignored");
        Ok(None)
    }

    fn close(&mut self, connection: u64) {
        debug!(connection, "link closed");
    }

    fn set_microphone(&mut self, enabled: bool) {
        info!(enabled, "microphone");
    }
}

pub async fn run_watch(options: WatchOptions) -> Result<()> {
    let ws_url = format!("{}/ws", options.url.trim_end_matches('/'));
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => bail!("Connection to {ws_url} failed: {e}"),
        Err(_) => bail!("Connection timeout - is the CallHub server running?"),
    };
    let (mut write, mut read) = ws_stream.split();
    let mut session = ClientSession::new(SilentEngine::default(), options.role);

    let join = session.join_request(&options.room, &options.name);
    send(&mut write, &join).await?;

    // The join round trip is bounded; silence counts as failure.
    let joined = timeout(options.join_timeout, async {
        while let Some(frame) = read.next().await {
            let Some(message) = decode(frame?)? else {
                continue;
            };
            print_event(&message)?;
            for reply in session.handle(message) {
                send(&mut write, &reply).await?;
            }
            if let Some(view) = session.view() {
                return Ok::<_, anyhow::Error>(view.participant_id().to_string());
            }
            if let Some(failure) = session.join_failure() {
                bail!("Join failed ({}): {}", failure.code.as_str(), failure.reason);
            }
        }
        Err(anyhow!("Connection closed before the join was acknowledged"))
    })
    .await;

    let participant_id = match joined {
        Ok(result) => result?,
        Err(_) => bail!(
            "No join acknowledgement within {}s",
            options.join_timeout.as_secs()
        ),
    };
    info!(participant_id = %participant_id, room_id = %options.room, "joined");

    let deadline = sleep(options.listen);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = read.next() => {
                let Some(frame) = frame else { break };
                let Some(message) = decode(frame?)? else { continue };
                print_event(&message)?;
                let mut replies = session.handle(message);
                if options.accept_screen_share {
                    replies.extend(session.accept_screen_share());
                }
                for reply in replies {
                    send(&mut write, &reply).await?;
                }
            }
        }
    }

    if let Some(leave) = session.leave() {
        send(&mut write, &leave).await?;
    }
    let _ = write.close().await;
    Ok(())
}

async fn send<S>(write: &mut S, message: &ClientMessage) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(message)?;
    write
        .send(Message::Text(text.into()))
        .await
        .with_context(|| format!("failed to send {}", message.kind()))
}

fn decode(frame: Message) -> Result<Option<ServerMessage>> {
    match frame {
        Message::Text(text) => Ok(Some(serde_json::from_str(&text)?)),
        Message::Close(_) => Err(anyhow!("Server closed the connection")),
        _ => Ok(None),
    }
}

fn print_event(message: &ServerMessage) -> Result<()> {
    println!("{}", serde_json::to_string(message)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn flags_override_the_environment() {
        let cli = Cli::parse_from(["callhub-server", "--host", "127.0.0.1", "--port", "7000"]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.bind_addr(), "127.0.0.1:7000");
        assert!(cli.command.is_none());
    }

    #[test_timeout::timeout]
    fn watch_parses_role() {
        let cli = Cli::parse_from(["callhub-server", "watch", "--room", "r1", "--role", "admin"]);
        match cli.command {
            Some(Commands::Watch { role, room, .. }) => {
                assert_eq!(role, Role::Admin);
                assert_eq!(room, "r1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["callhub-server", "watch", "--room", "r1", "--role", "boss"]).is_err());
    }
}
