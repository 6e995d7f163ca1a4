mod client;
mod config;
mod error;
mod protocol;
mod reconciler;
mod send;
mod server;
mod sse;
mod turns;
mod ui;

use clap::{Args, Parser, Subcommand};
use config::{ClientConfig, DEFAULT_ENDPOINT, resolve_token};
use protocol::ChatMode;
use reconciler::SessionState;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "connect-relay", about = "Streaming chat client for the Connect endpoint")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat in the terminal.
    Chat(ConnectArgs),
    /// Send one message and print the reply as it streams.
    Send {
        #[command(flatten)]
        connect: ConnectArgs,
        message: String,
        /// Also print the thinking trace to stderr.
        #[arg(long)]
        show_thinking: bool,
    },
    /// Run a local endpoint that streams scripted echo replies.
    Serve {
        #[arg(long, env = "CONNECT_LISTEN", default_value = "127.0.0.1:4870")]
        listen: String,
        #[arg(long, env = "CONNECT_TOKEN")]
        token: Option<String>,
        #[arg(long, default_value_t = 60)]
        word_delay_ms: u64,
    },
}

#[derive(Args)]
struct ConnectArgs {
    #[arg(long, env = "CONNECT_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,
    #[arg(long, env = "CONNECT_TOKEN")]
    token: Option<String>,
    #[arg(long, env = "CONNECT_MODE", value_enum, default_value_t = ChatMode::Execute)]
    mode: ChatMode,
    #[arg(long, env = "CONNECT_PROJECT_ID")]
    project_id: Option<String>,
}

impl ConnectArgs {
    fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig::new(self.endpoint);
        config.token = resolve_token(self.token);
        config.mode = self.mode;
        config.project_id = self.project_id;
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Chat(connect) => {
            init_file_logging()?;
            ui::run_tui(connect.into_config())
        }
        Command::Send {
            connect,
            message,
            show_thinking,
        } => {
            init_stderr_logging();
            let state = send::run(connect.into_config(), message, show_thinking).await?;
            if state == SessionState::Failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Serve {
            listen,
            token,
            word_delay_ms,
        } => {
            init_stderr_logging();
            server::run(server::ServerConfig {
                listen,
                auth_token: token,
                word_delay: Duration::from_millis(word_delay_ms),
            })
            .await
        }
    }
}

fn init_stderr_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// The TUI owns the terminal, so logs only go to a file and only on request.
fn init_file_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Ok(filter) = EnvFilter::try_from_default_env() else {
        return Ok(());
    };
    let file = std::fs::File::create("connect-relay.log")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}
