use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fcn-cli")]
#[command(about = "Federal Contract Notifier command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect from every enabled source and reconcile against the store.
    Sync,
    /// Print a markdown digest of recent delta reports.
    Report {
        #[arg(
            long,
            default_value_t = 5,
            value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
        )]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fcn=info"));
    let json = std::env::var("FCN_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = fcn_sync::run_sync_once_from_env().await?;
            info!(run_id = %summary.run_id, "sync finished");
            println!(
                "sync complete: run_id={} sources={} failed_sources={} collected={} new={} updated={} unchanged={} failed_writes={} reports={}",
                summary.run_id,
                summary.sources,
                summary.failed_sources,
                summary.collected,
                summary.new,
                summary.updated,
                summary.unchanged,
                summary.failed_writes,
                summary.reports_dir
            );
        }
        Commands::Report { runs } => {
            println!("{}", fcn_sync::report_daily_markdown(runs, None)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_runs_defaults_to_five() {
        let cli = Cli::try_parse_from(["fcn-cli", "report"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Report { runs: 5 })));
    }

    #[test]
    fn report_rejects_zero_runs() {
        assert!(Cli::try_parse_from(["fcn-cli", "report", "--runs", "0"]).is_err());
        let cli = Cli::try_parse_from(["fcn-cli", "report", "--runs", "2"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Report { runs: 2 })));
    }

    #[test]
    fn sync_is_the_default_command() {
        let cli = Cli::try_parse_from(["fcn-cli"]).unwrap();
        assert!(cli.command.is_none());
    }
}
