use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use zeroize::Zeroizing;

use mrreports::config::AppConfig;
use mrreports::crypto::EncryptedField;
use mrreports::report::{DataConnection, DataType, Parameter};
use mrreports::scheduler::{self, history, NewSubscription, Recurrence};
use mrreports::storage::connections::{self, PasswordChange};
use mrreports::storage::{self, reports, subscriptions};

#[derive(Parser)]
#[command(
    name = "mrreports",
    about = "Scheduled delivery of parameterized reports by email",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $MRREPORTS_CONFIG, then /etc/mrreports/mrreports.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deliver every subscription that is due now
    SendScheduled {
        /// Deliver regardless of schedule (does not move the schedule)
        #[arg(long)]
        force: bool,

        /// Only this subscription
        #[arg(long)]
        id: Option<i64>,

        /// Keep running, checking every N seconds
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage subscriptions
    Subscription {
        #[command(subcommand)]
        action: SubscriptionAction,
    },

    /// Manage reports and their parameters
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },

    /// Manage data connections
    Connection {
        #[command(subcommand)]
        action: ConnectionAction,
    },

    /// Show recent delivery attempts
    History {
        /// Only this subscription
        #[arg(long)]
        id: Option<i64>,

        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SubscriptionAction {
    /// List all subscriptions
    List,

    /// Add a subscription
    Add {
        #[arg(long)]
        report: i64,

        /// Recipient email address
        #[arg(long)]
        to: String,

        /// daily, weekly, monthly or yearly
        #[arg(long)]
        recurrence: Recurrence,

        /// Local time of day, HH:MM[:SS]
        #[arg(long, default_value = "06:00")]
        time: String,

        /// First day, YYYY-MM-DD (day of month at most 28)
        #[arg(long)]
        start: NaiveDate,

        /// Report parameters as a query string, e.g. "region=EMEA"
        #[arg(long)]
        params: Option<String>,

        #[arg(long, default_value = "")]
        subject: String,

        /// Extra HTML appended to the email body
        #[arg(long, default_value = "")]
        body_extra: String,
    },

    /// Remove a subscription
    Remove {
        #[arg(long)]
        id: i64,
    },

    /// Show when each subscription will next be delivered
    Preview,
}

#[derive(Subcommand)]
enum ReportAction {
    /// List all reports
    List,

    /// Add a report
    Add {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        byline: String,
    },

    /// Define a parameter and attach it to a report
    AddParameter {
        #[arg(long)]
        report: i64,

        /// Identifier-like name used in the query string
        #[arg(long)]
        name: String,

        #[arg(long)]
        label: Option<String>,

        /// boolean, char, date, datetime, decimal, integer or time
        #[arg(long = "type")]
        data_type: DataType,

        /// Computed default, e.g. "first_of_month" or "today-7d"
        #[arg(long)]
        default: Option<String>,

        #[arg(long)]
        required: bool,

        /// Position on the report form
        #[arg(long, default_value = "0")]
        order: i64,
    },
}

#[derive(Subcommand)]
enum ConnectionAction {
    /// List connections (passwords masked)
    List,

    /// Add a connection; the password is encrypted at rest
    Add {
        #[arg(long)]
        driver: String,

        #[arg(long)]
        dialect: Option<String>,

        #[arg(long)]
        user: Option<String>,

        #[arg(long, env = "MRREPORTS_CONNECTION_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        database: String,
    },

    /// Change a connection; fields left out keep their stored values
    Update {
        #[arg(long)]
        id: i64,

        #[arg(long)]
        driver: Option<String>,

        #[arg(long)]
        dialect: Option<String>,

        #[arg(long)]
        user: Option<String>,

        /// New password (omit to keep the stored one)
        #[arg(long, env = "MRREPORTS_CONNECTION_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        #[arg(long, conflicts_with = "password")]
        clear_password: bool,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        database: Option<String>,
    },

    /// Print the full connection URL, password included, for a query tool
    Url {
        #[arg(long)]
        id: i64,
    },

    /// Encrypt passwords that are still stored in plaintext
    EncryptLegacy,
}

fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .with_context(|| format!("Invalid time of day '{}', expected HH:MM[:SS]", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(),
    };
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    mrreports::init_tracing(&config.logging);

    let pool = storage::open_pool(&config.database.path.to_string_lossy())?;

    match cli.command {
        Commands::SendScheduled {
            force,
            id,
            watch,
            json,
        } => {
            let executor = mrreports::build_executor(&config, pool)?;
            match watch {
                Some(secs) => {
                    scheduler::run_scheduler_loop(Arc::new(executor), Duration::from_secs(secs.max(1)))
                        .await;
                }
                None => {
                    let now = Local::now().naive_local();
                    let summary = scheduler::run_batch(&executor, force, id, now).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    } else {
                        println!(
                            "Sent: {}  Not due: {}  Failed: {}",
                            summary.sent, summary.not_due, summary.failed
                        );
                    }
                }
            }
        }
        Commands::Subscription { action } => match action {
            SubscriptionAction::List => {
                let list = subscriptions::list(&pool)?;
                if list.is_empty() {
                    println!("No subscriptions found.");
                } else {
                    println!(
                        "{:<5} | {:<7} | {:<30} | {:<8} | {:<8} | {:<19} | Ok",
                        "ID", "Report", "Recipient", "Every", "At", "Last run"
                    );
                    println!("{:-<5}-|-{:-<7}-|-{:-<30}-|-{:-<8}-|-{:-<8}-|-{:-<19}-|-{:-<3}", "", "", "", "", "", "", "");
                    for s in list {
                        let last = s
                            .last_scheduled_run
                            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                            .unwrap_or_else(|| "never".into());
                        println!(
                            "{:<5} | {:<7} | {:<30} | {:<8} | {:<8} | {:<19} | {}",
                            s.id,
                            s.report_id,
                            s.recipient,
                            s.recurrence,
                            s.time_of_day.format("%H:%M:%S"),
                            last,
                            if s.last_run_succeeded { "yes" } else { "no" }
                        );
                    }
                }
            }
            SubscriptionAction::Add {
                report,
                to,
                recurrence,
                time,
                start,
                params,
                subject,
                body_extra,
            } => {
                if reports::get(&pool, report)?.is_none() {
                    anyhow::bail!("Report {} not found", report);
                }
                let id = subscriptions::insert(
                    &pool,
                    &NewSubscription {
                        report_id: report,
                        recipient: to.parse()?,
                        recurrence,
                        time_of_day: parse_time_of_day(&time)?,
                        start_date: start,
                        report_parameters: params,
                        email_subject: subject,
                        email_body_extra: body_extra,
                    },
                )?;
                println!("Subscription {} added.", id);
            }
            SubscriptionAction::Remove { id } => {
                subscriptions::remove(&pool, id)?;
                println!("Subscription {} removed.", id);
            }
            SubscriptionAction::Preview => {
                let now = Local::now().naive_local();
                let list = subscriptions::list(&pool)?;
                if list.is_empty() {
                    println!("No subscriptions found.");
                }
                for s in list {
                    match s.next_due(now) {
                        Some(at) if at <= now => println!("{} : due now ({} to {})", s.id, s.recurrence, s.recipient),
                        Some(at) => println!("{} : {} ({} to {})", s.id, at.format("%Y-%m-%d %H:%M"), s.recurrence, s.recipient),
                        None => println!("{} : not within the next 400 days", s.id),
                    }
                }
            }
        },
        Commands::Report { action } => match action {
            ReportAction::List => {
                let list = reports::list(&pool)?;
                if list.is_empty() {
                    println!("No reports found.");
                } else {
                    println!("{:<5} | {:<40} | Parameters", "ID", "Title");
                    println!("{:-<5}-|-{:-<40}-|-{:-<10}", "", "", "");
                    for (id, title, params) in list {
                        println!("{:<5} | {:<40} | {}", id, title, params);
                    }
                }
            }
            ReportAction::Add { title, byline } => {
                let id = reports::insert_report(&pool, &title, &byline)?;
                println!("Report {} added.", id);
            }
            ReportAction::AddParameter {
                report,
                name,
                label,
                data_type,
                default,
                required,
                order,
            } => {
                if reports::get(&pool, report)?.is_none() {
                    anyhow::bail!("Report {} not found", report);
                }
                let param = Parameter {
                    id: 0,
                    label: label.unwrap_or_else(|| name.clone()),
                    name,
                    data_type,
                    default_expr: default,
                    required,
                };
                let pid = reports::insert_parameter(&pool, &param)?;
                reports::attach_parameter(&pool, report, pid, order)?;
                println!("Parameter '{}' added to report {}.", param.name, report);
            }
        },
        Commands::Connection { action } => {
            let codec = EncryptedField::from_settings(&config, &config.crypto.passphrase_setting)?;
            match action {
                ConnectionAction::List => {
                    let list = connections::list(&pool, &codec)?;
                    if list.is_empty() {
                        println!("No connections found.");
                    }
                    for c in list {
                        println!("{:<5} | {}", c.id, c.display_url());
                    }
                }
                ConnectionAction::Add {
                    driver,
                    dialect,
                    user,
                    password,
                    host,
                    port,
                    database,
                } => {
                    let conn = DataConnection {
                        id: 0,
                        drivername: driver,
                        dialect,
                        username: user,
                        password: password.map(Zeroizing::new),
                        host,
                        port,
                        database,
                    };
                    let id = connections::insert(&pool, &codec, &conn)?;
                    println!("Connection {} added.", id);
                }
                ConnectionAction::Update {
                    id,
                    driver,
                    dialect,
                    user,
                    password,
                    clear_password,
                    host,
                    port,
                    database,
                } => {
                    let mut conn = connections::get(&pool, &codec, id)?
                        .with_context(|| format!("Data connection {} not found", id))?;
                    if let Some(driver) = driver {
                        conn.drivername = driver;
                    }
                    if dialect.is_some() {
                        conn.dialect = dialect;
                    }
                    if user.is_some() {
                        conn.username = user;
                    }
                    if host.is_some() {
                        conn.host = host;
                    }
                    if port.is_some() {
                        conn.port = port;
                    }
                    if let Some(database) = database {
                        conn.database = database;
                    }
                    let change = match password {
                        Some(p) => PasswordChange::Set(Zeroizing::new(p)),
                        None if clear_password => PasswordChange::Clear,
                        None => PasswordChange::Keep,
                    };
                    connections::update(&pool, &codec, &conn, change)?;
                    println!("Connection {} updated.", id);
                }
                ConnectionAction::Url { id } => {
                    let conn = connections::get(&pool, &codec, id)?
                        .with_context(|| format!("Data connection {} not found", id))?;
                    println!("{}", conn.url().as_str());
                }
                ConnectionAction::EncryptLegacy => {
                    let n = connections::encrypt_plaintext_passwords(&pool, &codec)?;
                    println!("Encrypted {} password(s).", n);
                }
            }
        }
        Commands::History { id, limit, json } => {
            let entries = history::recent(&pool, id, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No deliveries recorded.");
            } else {
                for e in entries {
                    println!(
                        "{} | sub {:<5} | {:<6} | {}{}",
                        e.started_at.format("%Y-%m-%d %H:%M:%S"),
                        e.subscription_id,
                        e.status,
                        if e.forced { "forced " } else { "" },
                        e.result_summary.unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}
