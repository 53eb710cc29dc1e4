use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crest::controller::SendOutcome;
use crest::draft::RequestDraft;
use crest::notify::ConsoleNotifier;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the host service
    Serve,
    /// Send one request and print the exchange
    Send {
        #[arg(short, long, default_value = "GET")]
        method: String,
        #[arg(short, long)]
        url: String,
        /// `name: value`, repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        #[arg(short, long)]
        body: Option<String>,
        /// milliseconds, 0 disables the timeout
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match args.config_path {
        Some(path) => read_config(&path)?,
        None => crest::Config::default(),
    };

    let (router, engine) = crest::app(&config).await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let listener = TcpListener::bind(&config.listen).await?;
            tracing::info!("host service listening on {}", config.listen);
            axum::serve(listener, router).await?;
        }
        Command::Send {
            method,
            url,
            headers,
            body,
            timeout,
        } => {
            let draft = RequestDraft {
                method,
                url,
                headers: headers.join("\n"),
                body: body.unwrap_or_default(),
                timeout,
                ..Default::default()
            };

            let controller = engine.controller(Arc::new(ConsoleNotifier));
            let send = controller.send(&draft);
            tokio::pin!(send);

            let outcome = tokio::select! {
                outcome = &mut send => outcome,
                _ = tokio::signal::ctrl_c() => {
                    controller.abort();
                    send.await
                }
            };

            engine.storage.flush().await?;

            match outcome {
                SendOutcome::Completed(exchange)
                | SendOutcome::TimedOut(exchange)
                | SendOutcome::NetworkError(exchange) => {
                    println!("{}", serde_json::to_string_pretty(&exchange)?);
                }
                SendOutcome::Aborted => bail!("request aborted"),
                other => bail!("request was not sent: {:?}", other),
            }
        }
    }

    Ok(())
}

fn read_config(config_path: &str) -> Result<crest::Config> {
    let content = std::fs::read_to_string(config_path)?;
    Ok(toml::from_str(&content)?)
}
