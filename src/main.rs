use anyhow::Context;
use clap::Parser;
use homedir::my_home;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod harvest;
mod listings;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;

use cli::Command;
use config::Config;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn base_path(args: &cli::Args) -> anyhow::Result<String> {
    if let Some(dir) = &args.data_dir {
        return Ok(dir.to_string_lossy().to_string());
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(format!("{}/.local/share/vinted-lens", home.to_string_lossy()))
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_tracing(args.verbose);

    let base_path = base_path(&args)?;
    let config = Config::load_with(&base_path)
        .with_context(|| format!("could not load config from {base_path}"))?;

    match args.command {
        Command::Harvest {
            filters,
            raw_json,
            csv,
        } => cli::handle_harvest(&config, filters, raw_json, csv),

        Command::Index {
            csv,
            raw_json,
            batch_size,
            force,
        } => cli::handle_index(&config, csv, raw_json, batch_size, force),

        Command::Refresh {
            csv,
            save_csv,
            filters,
        } => cli::handle_refresh(&config, csv, save_csv, filters),

        Command::Search { query, top_k } => cli::handle_search(&config, query, top_k),

        Command::Stats {} => cli::handle_stats(&config),

        Command::Health {} => cli::handle_health(&config),
    }
}
