use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use permsync::authz::{user_has_all_permissions, RequiredPermission};
use permsync::lock::ClusterLock;
use permsync::scheduler::{spawn_audit_poller, ChangeSignal, Propagator};
use permsync::settings::Settings;
use permsync::{cursors, jobs, storage};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "permsync",
    version,
    about = "Incremental permission propagation"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "permsync.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every pending audit event once and exit
    Once,
    /// Keep grants in sync until interrupted
    Watch,
    /// Check whether a user holds permissions, e.g. `docs.document:view/7,8`
    Check {
        /// User key
        #[arg(short, long)]
        user: String,
        /// Required permissions as `group.type:permission[/key,...]`
        #[arg(required = true)]
        permissions: Vec<String>,
    },
    /// List rule cursors and recent passes
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::debug!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;
    storage::migrate(&db).await?;

    match cli.command {
        Command::Once => {
            let propagator = build_propagator(&settings, &db).await?;
            let report = propagator.run_once(&ChangeSignal::Manual).await?;
            for rule in &report.rules {
                println!("{:<32} {:?}", rule.rule, rule.outcome);
            }
            println!(
                "applied {} events, untagged {}, purged {}, memberships released {}",
                report.events_applied,
                report.sweep.untagged,
                report.sweep.purged,
                report.sweep.memberships_released
            );
        }
        Command::Watch => {
            let propagator = build_propagator(&settings, &db).await?;
            let (tx, rx) = mpsc::channel(16);

            let poller = settings
                .engine
                .poll_interval()
                .map(|every| spawn_audit_poller(db.clone(), every, tx.clone()));
            let mut sched = jobs::init_scheduler(&settings.engine.safety_net_cron, tx.clone()).await?;

            let runner = tokio::spawn(async move { propagator.run(rx).await });

            tokio::signal::ctrl_c().await.into_diagnostic()?;
            tracing::info!("Shutting down");

            // Dropping every sender lets the runner finish its in-flight pass
            sched.shutdown().await.map_err(permsync::SyncError::from)?;
            drop(sched);
            if let Some(poller) = poller {
                poller.abort();
            }
            drop(tx);
            runner.await.into_diagnostic()??;
        }
        Command::Check { user, permissions } => {
            let required = permissions
                .iter()
                .map(|p| {
                    RequiredPermission::parse(p)
                        .ok_or_else(|| miette::miette!("invalid permission `{p}`"))
                })
                .collect::<Result<Vec<_>>>()?;
            let allowed = user_has_all_permissions(&db, &user, &required).await?;
            println!("{}", if allowed { "allowed" } else { "denied" });
            if !allowed {
                std::process::exit(1);
            }
        }
        Command::Status => {
            for cursor in cursors::list_cursors(&db).await? {
                println!(
                    "{:<32} {:<44} last_event={:<8} {}",
                    cursor.name,
                    cursor.config_hash,
                    cursor.last_event,
                    if cursor.active { "active" } else { "stale" }
                );
            }
            for run in jobs::recent_runs(&db, 10).await? {
                println!(
                    "run {:<6} {:<10} success={:?} events={:?} {}",
                    run.id,
                    run.trigger,
                    run.success,
                    run.events_applied,
                    run.error_message.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn build_propagator(
    settings: &Settings,
    db: &sea_orm::DatabaseConnection,
) -> Result<Propagator> {
    let rules = settings.compile_rules()?;
    tracing::info!(rules = rules.len(), "Compiled rules");

    let lock = ClusterLock::connect(
        db,
        &settings.database.url,
        &settings.engine.lock_name,
        settings.engine.lock_poll(),
    )
    .await?;

    Ok(Propagator::new(
        db.clone(),
        lock,
        rules,
        settings.engine.page_size,
    ))
}
