use anyhow::Error;
use bg_change_stack::job::JobPoller;
use bg_change_stack::migration::{
    FailureOutcome, StackChangeRequest, StackMigration, venerable_name,
};
use bg_change_stack::settings::Settings;
use clap::{Parser, Subcommand};
use log::{error, warn};
use std::path::PathBuf;
use tokio::sync::watch;

#[derive(Parser)]
#[clap(about, version, author)]
struct Args {
    /// Path to the config file
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Move an app to another stack without downtime
    #[clap(name = "bg-change-stack")]
    BgChangeStack {
        /// Name of the app in the targeted space
        app_name: String,

        /// Stack to move the app to, e.g. cflinuxfs4
        stack: String,
    },

    /// Sent by the cf CLI when the plugin is uninstalled
    #[clap(name = "CLI-MESSAGE-UNINSTALL", hide = true)]
    Uninstall,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let args = Args::parse();
    let (app_name, stack) = match args.command {
        Command::Uninstall => return Ok(()),
        Command::BgChangeStack { app_name, stack } => (app_name, stack),
    };

    let settings = Settings::load(args.config.as_deref())?;
    let client = settings.get_platform().await?;

    // first Ctrl-C stops the migration at its next step or job poll, the second exits
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        warn!(
            "Interrupted, stopping before the next step or job poll. Press Ctrl-C again to exit now"
        );
        let _ = cancel_tx.send(true);
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Interrupted again, exiting without rollback");
            std::process::exit(130);
        }
    });

    let poller = JobPoller::new(client.clone(), settings.poll.policy()).with_cancel(cancel_rx);
    let migration = StackMigration::new(client, poller)
        .with_rollback_failure_message(settings.rollback_failure_message.clone());

    let req = StackChangeRequest::new(app_name, stack);
    match migration.run(&req).await {
        Ok(()) => {
            println!("application stack has been changed with no downtime !");
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            let app = &req.app_name;
            match FailureOutcome::of(&e) {
                FailureOutcome::Untouched => eprintln!("nothing was changed"),
                FailureOutcome::RolledBack => {
                    eprintln!("rollback attempted: succeeded, {} is back as it was", app)
                }
                FailureOutcome::LeftInPlace => eprintln!(
                    "no rollback after {} failed, check {} and {} before running again",
                    e.step(),
                    app,
                    venerable_name(app)
                ),
                FailureOutcome::RollbackFailed => {
                    eprintln!("rollback attempted: FAILED, check {} by hand", app)
                }
            }
            std::process::exit(1);
        }
    }
}
