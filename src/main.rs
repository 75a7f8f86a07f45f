// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use podsync::config::CONFIG_FILENAME;
use podsync::{
    Credentials, FileCredentialStore, JsonFileStore, NoopReporter, ProgressEvent,
    ProgressReporter, ProtocolKind, ReqwestClient, SharedHttpClient, SharedProgressReporter,
    SyncConfig, SyncError, SyncOptions, SyncOutcome, SyncReport, SyncSession,
};

// Emoji with fallback for terminals without Unicode support
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "");
static SYNC: Emoji<'_, '_> = Emoji("🔄 ", "[~] ");
static KEY: Emoji<'_, '_> = Emoji("🔑 ", "[k] ");
static LINK: Emoji<'_, '_> = Emoji("🔗 ", "[>] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");

/// Synchronize podcast listening progress and subscriptions
#[derive(Parser, Debug)]
#[command(name = "podsync")]
#[command(about = "Synchronize podcast listening progress and subscriptions with gpodder or Nextcloud")]
#[command(version)]
struct Args {
    /// Directory holding local state, credentials and config
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data-dir>/podsync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in to a sync server
    Login {
        #[command(subcommand)]
        server: LoginCommand,
    },

    /// Forget the stored credentials
    Logout,

    /// Show the login state and the time of the last sync
    Status,

    /// Run one sync cycle
    Sync {
        /// Feed URL subscribed to on this device (repeatable)
        #[arg(long = "add", value_name = "URL")]
        add: Vec<String>,

        /// Feed URL unsubscribed from on this device (repeatable)
        #[arg(long = "remove", value_name = "URL")]
        remove: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum LoginCommand {
    /// gpodder.net compatible server, HTTP Basic auth
    Gpodder {
        /// Server URL, e.g. https://gpodder.net
        server: String,

        /// Account name
        user: String,

        /// Account password
        #[arg(long, env = "PODSYNC_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Nextcloud with the gpoddersync app, browser login flow
    Nextcloud {
        /// Nextcloud URL
        server: String,
    },
}

/// Progress reporter drawing a single spinner line
struct SpinnerReporter {
    bar: ProgressBar,
}

impl SpinnerReporter {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl ProgressReporter for SpinnerReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::CycleStarted { since } => {
                let window = if since == 0 {
                    "full history".to_string()
                } else {
                    format!("changes since {}", format_millis(since))
                };
                self.bar
                    .set_message(format!("{SYNC}Pulling {}", window.cyan()));
            }

            ProgressEvent::EpisodesPulled { count } => {
                self.bar.set_message(format!(
                    "{SYNC}Received {} episode actions",
                    count.to_string().cyan()
                ));
            }

            ProgressEvent::EpisodesApplied { applied, .. } => {
                self.bar.set_message(format!(
                    "{SYNC}Updated {} episodes",
                    applied.to_string().cyan()
                ));
            }

            ProgressEvent::EpisodesPushed { count } => {
                self.bar.set_message(format!(
                    "{SYNC}Sent {} episode states",
                    count.to_string().cyan()
                ));
            }

            ProgressEvent::SubscriptionsPulled { added, removed } => {
                self.bar.set_message(format!(
                    "{SYNC}Received {} new and {} removed subscriptions",
                    added.to_string().cyan(),
                    removed.to_string().cyan()
                ));
            }

            ProgressEvent::SubscriptionsApplied { .. } => {
                self.bar.set_message(format!("{SYNC}Subscriptions updated"));
            }

            ProgressEvent::SubscriptionsPushed { added, removed } => {
                self.bar.set_message(format!(
                    "{SYNC}Sent {} subscription changes",
                    (added + removed).to_string().cyan()
                ));
            }

            ProgressEvent::CycleCompleted { .. } => {
                self.bar.finish_and_clear();
            }

            ProgressEvent::CycleFailed { error } => {
                self.bar
                    .abandon_with_message(format!("{FAILURE}{}", error.red()));
            }
        }
    }
}

/// Only a sync cycle draws a spinner
fn shows_progress(args: &Args) -> bool {
    matches!(args.command, Command::Sync { .. }) && !args.quiet
}

fn format_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|time| {
            time.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| millis.to_string())
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("podsync"))
        .unwrap_or_else(|| PathBuf::from(".podsync"))
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "podsync=info",
        1 => "podsync=debug",
        _ => "podsync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &SyncReport) {
    println!(
        "\n{PARTY}{} {} episodes updated, {} sent, {} subscriptions added, {} removed",
        "Sync complete:".bold().green(),
        report.episodes_applied.to_string().green().bold(),
        report.episodes_pushed.to_string().cyan(),
        report.subscriptions_added.to_string().green(),
        report.subscriptions_removed.to_string().yellow()
    );
    if report.episodes_ignored > 0 {
        println!(
            "   {} non-playback actions ignored",
            report.episodes_ignored.to_string().dimmed()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            HEADPHONES,
            "podsync".bold().magenta(),
            "- Podcast Sync".dimmed()
        );
    }

    let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILENAME));
    let config = SyncConfig::load(&config_path).context("Failed to load config")?;

    let http: SharedHttpClient = Arc::new(
        ReqwestClient::with_timeouts(config.http.timeout(), config.http.connect_timeout())
            .context("Failed to create HTTP client")?,
    );
    let store = JsonFileStore::open_in_dir(&data_dir)
        .await
        .context("Failed to open local state")?;

    let reporter: SharedProgressReporter = if shows_progress(&args) {
        Arc::new(SpinnerReporter::new())
    } else {
        NoopReporter::shared()
    };

    let session = SyncSession::new(
        Arc::new(store),
        Arc::new(FileCredentialStore::in_dir(&data_dir)),
        http,
        config.sync.clone(),
        config.protocol.options()?,
    )
    .with_reporter(reporter);

    match args.command {
        Command::Login {
            server: LoginCommand::Gpodder {
                server,
                user,
                password,
            },
        } => {
            let credentials = Credentials::new(ProtocolKind::Gpodder, server, user, password);
            session.login(credentials).await.context("Login failed")?;
            println!("{SUCCESS}{}", "Logged in to gpodder".green());
        }

        Command::Login {
            server: LoginCommand::Nextcloud { server },
        } => {
            session
                .login_nextcloud(&server, |url| {
                    println!("{LINK}Open this URL to grant access:\n   {}", url.cyan().underline());
                    println!("{KEY}{}", "Waiting for confirmation...".dimmed());
                })
                .await
                .context("Login failed")?;
            println!("{SUCCESS}{}", "Logged in to Nextcloud".green());
        }

        Command::Logout => match session.logout().await.context("Logout failed")? {
            Some(protocol) => println!("{SUCCESS}Logged out of {}", protocol.to_string().cyan()),
            None => println!("Not logged in"),
        },

        Command::Status => {
            match session.active_protocol().await? {
                Some(protocol) => println!("Protocol:  {}", protocol.to_string().cyan()),
                None => println!("Protocol:  {}", "not logged in".yellow()),
            }
            let last_sync = session.last_sync().await?;
            let last_sync = if last_sync == 0 {
                "never".to_string()
            } else {
                format_millis(last_sync)
            };
            println!("Last sync: {}", last_sync.cyan());
        }

        Command::Sync { add, remove } => {
            let options = SyncOptions {
                add_subscriptions: add,
                remove_subscriptions: remove,
            };

            match session.perform_sync(options).await {
                Ok(SyncOutcome::Completed(report)) => {
                    if !args.quiet {
                        print_report(&report);
                    }
                }
                Ok(SyncOutcome::AlreadyRunning) => println!("A sync is already running"),
                Err(SyncError::NotLoggedIn) => {
                    eprintln!(
                        "{FAILURE}{} run {} first",
                        "Not logged in:".red().bold(),
                        "podsync login".cyan()
                    );
                    std::process::exit(1);
                }
                Err(e) => return Err(e).context("Sync failed"),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn spinner_only_for_sync() {
        assert!(shows_progress(&parse(&["podsync", "sync"])));
        assert!(!shows_progress(&parse(&["podsync", "sync", "--quiet"])));
        assert!(!shows_progress(&parse(&["podsync", "status"])));
        assert!(!shows_progress(&parse(&["podsync", "logout"])));
        assert!(!shows_progress(&parse(&[
            "podsync",
            "login",
            "nextcloud",
            "https://cloud.example.com"
        ])));
    }
}
