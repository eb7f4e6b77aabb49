use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use loyalty_sync::app::{App, WatchTarget};
use loyalty_sync::config::Config;
use loyalty_sync::logging;

#[derive(Parser, Debug)]
#[command(name = "loyalty-sync")]
#[command(about = "Keeps loyalty points and coupon stock in sync with the server")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/loyalty-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Poll a customer's points and log every change until Ctrl-C
  Watch {
    /// Customer id
    #[arg(long)]
    customer: String,

    /// Also watch the inventory of this coupon
    #[arg(long)]
    coupon: Option<String>,
  },
  /// Show the role resolved from the token and the one the server reports
  Role,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(config.log_dir.as_deref())?;

  let app = App::new(config)?;

  match args.command {
    Command::Watch { customer, coupon } => app.watch(WatchTarget { customer, coupon }).await?,
    Command::Role => app.show_role().await?,
  }

  Ok(())
}
