//! `pairlink`: pair, watch and drive a messaging session from the terminal.

mod error;
mod render;
mod runtime;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pairlink_api::HttpSessionApi;
use pairlink_core::config::{self, Config};
use pairlink_core::credential::{self, Credential, CredentialHandle};
use pairlink_core::event::EventPayload;
use pairlink_core::state::PollKind;
use pairlink_session::{CommandOutcome, PollSlot};
use tracing::warn;

use crate::error::CliError;
use crate::runtime::{Runtime, credential_file};

/// Pairlink - keep a paired messaging session connected
#[derive(Parser)]
#[command(name = "pairlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the session state and push channel until Ctrl-C
    Watch,
    /// Fetch and print the current session state once
    Status,
    /// Start pairing and wait until the session connects or polling gives up
    Connect,
    /// Log the session out on the backend
    Disconnect,
    /// Ask the backend for a fresh pairing code
    Qr,
    /// Send a test message through the connected session
    SendTest {
        /// Recipient phone number in international format
        phone_number: String,
        /// Message body
        message: String,
    },
    /// Follow the delivery progress of a bulk campaign
    Campaign {
        /// Campaign identifier
        id: String,
    },
    /// Store a credential, either given directly or obtained by password login
    Login {
        /// Bearer token issued by the backend
        #[arg(long, requires = "user_id", conflicts_with_all = ["email", "password"])]
        token: Option<String>,

        /// User identifier the token belongs to
        #[arg(long)]
        user_id: Option<String>,

        /// Account email for password login
        #[arg(short, long, requires = "password")]
        email: Option<String>,

        /// Account password for password login
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Forget the stored credential
    Logout,
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: Option<PathBuf>) -> Result<Config, CliError> {
    let config = match path {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load(cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.logging.level);

    if let Err(e) = run(cli.command, config).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: Config) -> Result<(), CliError> {
    match command {
        Commands::Login {
            token,
            user_id,
            email,
            password,
        } => login(&config, token, user_id, email, password).await,
        Commands::Logout => {
            credential::remove_credential(&credential_file(&config))?;
            println!("logged out");
            Ok(())
        }
        command => {
            let mut runtime = Runtime::open(config)?;
            let result = session_command(&mut runtime, command).await;
            runtime.shutdown("command finished").await;
            result
        }
    }
}

async fn session_command(runtime: &mut Runtime, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Watch => {
            runtime.start_background()?;
            let events = runtime.subscribe()?;
            if let Err(error) = runtime.engine().fetch_status().await {
                warn!(%error, "initial status fetch failed");
            }
            runtime.follow(events, |_| false).await
        }
        Commands::Connect => {
            runtime.start_background()?;
            let events = runtime.subscribe()?;
            report("connect", runtime.engine().connect().await)?;
            if !runtime.engine().store().is_polling(&PollSlot::Connection) {
                return Ok(());
            }
            runtime
                .follow(events, |event| {
                    matches!(
                        event.payload,
                        EventPayload::PollerStopped {
                            kind: PollKind::Connection,
                            ..
                        }
                    )
                })
                .await
        }
        command => one_shot(runtime, command).await,
    }
}

async fn one_shot(runtime: &Runtime, command: Commands) -> Result<(), CliError> {
    let engine = runtime.engine();

    match command {
        Commands::Status => {
            let state = engine
                .fetch_status()
                .await
                .map_err(|error| failed("status", error))?;
            println!("{}", render::state_line(&state));
            Ok(())
        }
        Commands::Disconnect => report("disconnect", engine.disconnect().await),
        Commands::Qr => report("qr", engine.refresh_qr().await),
        Commands::SendTest {
            phone_number,
            message,
        } => report(
            "send-test",
            engine.send_test_message(&phone_number, &message).await,
        ),
        Commands::Campaign { id } => {
            let events = runtime.subscribe()?;
            engine.watch_campaign(id.clone());
            runtime
                .follow(events, move |event| {
                    matches!(&event.payload, EventPayload::CampaignFinished { id: finished, .. } if *finished == id)
                })
                .await
        }
        Commands::Watch | Commands::Connect | Commands::Login { .. } | Commands::Logout => {
            Err(CliError::InvalidArguments(
                "command does not run as a one-shot session request".to_string(),
            ))
        }
    }
}

fn failed(command: &str, reason: impl ToString) -> CliError {
    CliError::CommandFailed {
        command: command.to_string(),
        reason: reason.to_string(),
    }
}

fn report(command: &str, outcome: CommandOutcome) -> Result<(), CliError> {
    println!("{}", render::outcome_line(&outcome));
    if outcome.success {
        Ok(())
    } else {
        Err(failed(command, outcome.message))
    }
}

async fn login(
    config: &Config,
    token: Option<String>,
    user_id: Option<String>,
    email: Option<String>,
    password: Option<String>,
) -> Result<(), CliError> {
    let credential = match (token, user_id, email, password) {
        (Some(token), Some(user_id), None, None) => Credential::new(token, user_id),
        (None, None, Some(email), Some(password)) => {
            let api = HttpSessionApi::new(&config.backend, CredentialHandle::empty())?;
            let data = api.login(&email, &password).await?;
            Credential::new(data.token, data.user.id)
        }
        _ => {
            return Err(CliError::InvalidArguments(
                "pass either --token and --user-id, or --email and --password".to_string(),
            ));
        }
    };

    credential::save_credential(&credential_file(config), &credential)?;
    println!("logged in as {}", credential.user_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn login_takes_a_token_or_a_password_but_not_both() {
        assert!(Cli::try_parse_from(["pairlink", "login", "--token", "t", "--user-id", "u"]).is_ok());
        assert!(
            Cli::try_parse_from(["pairlink", "login", "--email", "a@b.c", "--password", "pw"])
                .is_ok()
        );
        assert!(Cli::try_parse_from(["pairlink", "login", "--token", "t"]).is_err());
        assert!(
            Cli::try_parse_from([
                "pairlink", "login", "--token", "t", "--user-id", "u", "--email", "a@b.c",
                "--password", "pw"
            ])
            .is_err()
        );
    }

    #[test]
    fn send_test_takes_recipient_and_body() {
        let cli = Cli::try_parse_from(["pairlink", "send-test", "+15550100", "hello"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::SendTest { ref phone_number, ref message }
                if phone_number == "+15550100" && message == "hello"
        ));
    }
}
