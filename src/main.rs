//! # Mimic CLI (`mimic`)
//!
//! The `mimic` binary manages organizations, connectors and credentials,
//! drives the connector runner, and answers questions against the indexed
//! documents in the asking user's own style.
//!
//! ## Usage
//!
//! ```bash
//! mimic --config ./config/mimic.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mimic init` | Create the SQLite database and schema |
//! | `mimic org add <id>` | Create an organization and its collections |
//! | `mimic user add <id> --org <org>` | Attach a user to an organization |
//! | `mimic connector add` / `list` | Manage connector rows |
//! | `mimic credential add` | Store a credential |
//! | `mimic pair link` | Link a connector with a credential |
//! | `mimic run [--once]` | Run the connector runner |
//! | `mimic status` | Show pair status and recent attempts |
//! | `mimic index-file <path>` | Index one local file directly |
//! | `mimic search --user <id> "<query>"` | Hybrid retrieval only |
//! | `mimic ask --user <id> "<query>"` | Answer, verify and rephrase |
//! | `mimic style ...` | Manage chat pairs and conversation styles |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

use mimic::commands::{self, ConnectorArgs};
use mimic::{config, migrate};

/// Mimic: answers questions from your team's documents, in your own voice.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/mimic.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "mimic",
    about = "Hybrid-retrieval question answering that replies in a user's own style",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mimic.toml")]
    config: PathBuf,

    /// Log at debug level instead of info.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again leaves existing data alone.
    Init,

    /// Manage organizations.
    Org {
        #[command(subcommand)]
        action: OrgAction,
    },

    /// Manage users.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Manage connectors.
    Connector {
        #[command(subcommand)]
        action: ConnectorAction,
    },

    /// Manage credentials.
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },

    /// Manage connector-credential pairs.
    Pair {
        #[command(subcommand)]
        action: PairAction,
    },

    /// Run the connector runner.
    ///
    /// Fails any attempt left in progress by a previous process, then
    /// creates and executes index attempts. Without `--once` it repeats
    /// every `runner.interval_secs` seconds.
    Run {
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },

    /// Show connector-credential pairs and their recent attempts.
    Status,

    /// Index a single local file into an organization.
    IndexFile {
        path: PathBuf,

        /// Organization whose collections receive the file.
        #[arg(long)]
        org: String,

        /// Restrict the file to this user; public when omitted.
        #[arg(long)]
        user: Option<String>,
    },

    /// Retrieve the most relevant chunks for a query.
    Search {
        query: String,

        /// User issuing the query; decides which documents are visible.
        #[arg(long)]
        user: String,

        /// Restrict to a source type (repeatable).
        #[arg(long)]
        source: Vec<String>,

        /// Restrict to a document id (repeatable).
        #[arg(long)]
        document: Vec<String>,

        /// Maximum number of results to print.
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Answer a question from the indexed documents.
    Ask {
        query: String,

        #[arg(long)]
        user: String,

        #[arg(long)]
        source: Vec<String>,

        #[arg(long)]
        document: Vec<String>,

        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },

    /// Manage chat pairs and conversation styles.
    Style {
        #[command(subcommand)]
        action: StyleAction,
    },
}

#[derive(Subcommand)]
enum OrgAction {
    /// Create or rename an organization.
    Add {
        id: String,
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Attach a user to an organization.
    Add {
        id: String,
        #[arg(long)]
        org: String,
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConnectorAction {
    /// Create a connector.
    Add {
        name: String,
        #[arg(long)]
        org: String,
        /// Source type, e.g. `file`, `slack`, `github`.
        #[arg(long)]
        source: String,
        /// One of `load_state`, `poll`, `event`.
        #[arg(long, default_value = "load_state")]
        input_type: String,
        /// Connector configuration as a JSON object.
        #[arg(long, default_value = "{}")]
        config_json: String,
        /// Seconds between refreshes; index once when omitted.
        #[arg(long)]
        refresh_secs: Option<i64>,
    },
    /// List connectors.
    List,
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Store a credential.
    Add {
        /// Owner of the credential and of the documents it indexes.
        #[arg(long)]
        user: Option<String>,
        /// Documents indexed with this credential are visible to everyone.
        #[arg(long)]
        public: bool,
        /// Credential payload as a JSON object.
        #[arg(long, default_value = "{}")]
        json: String,
    },
}

#[derive(Subcommand)]
enum PairAction {
    /// Link a connector with a credential.
    Link {
        #[arg(long)]
        connector: i64,
        #[arg(long)]
        credential: i64,
    },
}

#[derive(Subcommand)]
enum StyleAction {
    /// Record a message and the user's reply to it.
    AddPair {
        message: String,
        reply: String,
        #[arg(long)]
        user: String,
    },
    /// Regenerate the user's conversation style from their chat pairs.
    Generate {
        #[arg(long)]
        user: String,
    },
    /// Show the stored style and chat pair count.
    Show {
        #[arg(long)]
        user: String,
    },
    /// Rewrite a piece of text in the user's style.
    Shuffle {
        answer: String,
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Org { action } => match action {
            OrgAction::Add { id, name } => {
                commands::cmd_org_add(&cfg, &id, name.as_deref()).await?;
            }
        },
        Commands::User { action } => match action {
            UserAction::Add { id, org, name } => {
                commands::cmd_user_add(&cfg, &id, &org, name.as_deref()).await?;
            }
        },
        Commands::Connector { action } => match action {
            ConnectorAction::Add {
                name,
                org,
                source,
                input_type,
                config_json,
                refresh_secs,
            } => {
                commands::cmd_connector_add(
                    &cfg,
                    ConnectorArgs {
                        org_id: &org,
                        name: &name,
                        source: &source,
                        input_type: &input_type,
                        config_json: &config_json,
                        refresh_secs,
                    },
                )
                .await?;
            }
            ConnectorAction::List => {
                commands::cmd_connector_list(&cfg).await?;
            }
        },
        Commands::Credential { action } => match action {
            CredentialAction::Add { user, public, json } => {
                commands::cmd_credential_add(&cfg, user.as_deref(), public, &json).await?;
            }
        },
        Commands::Pair { action } => match action {
            PairAction::Link {
                connector,
                credential,
            } => {
                commands::cmd_pair_link(&cfg, connector, credential).await?;
            }
        },
        Commands::Run { once } => {
            commands::cmd_run(&cfg, once).await?;
        }
        Commands::Status => {
            commands::cmd_status(&cfg).await?;
        }
        Commands::IndexFile { path, org, user } => {
            commands::cmd_index_file(&cfg, &path, &org, user.as_deref()).await?;
        }
        Commands::Search {
            query,
            user,
            source,
            document,
            limit,
        } => {
            let filters = commands::build_filters(&source, &document)?;
            commands::cmd_search(&cfg, &user, &query, &filters, limit).await?;
        }
        Commands::Ask {
            query,
            user,
            source,
            document,
            stream,
        } => {
            let filters = commands::build_filters(&source, &document)?;
            commands::cmd_ask(&cfg, &user, &query, &filters, stream).await?;
        }
        Commands::Style { action } => match action {
            StyleAction::AddPair {
                message,
                reply,
                user,
            } => {
                commands::cmd_style_add_pair(&cfg, &user, &message, &reply).await?;
            }
            StyleAction::Generate { user } => {
                commands::cmd_style_generate(&cfg, &user).await?;
            }
            StyleAction::Show { user } => {
                commands::cmd_style_show(&cfg, &user).await?;
            }
            StyleAction::Shuffle { answer, user } => {
                commands::cmd_style_shuffle(&cfg, &user, &answer).await?;
            }
        },
    }

    Ok(())
}
