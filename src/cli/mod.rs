use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::harvest::IdList;
use crate::semantic::search::DEFAULT_TOP_K;

mod handlers;

pub use handlers::*;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding config.yaml, vectors.bin and downloaded models
    #[clap(long, global = true, env = "VINTED_LENS_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[clap(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct HarvestArgs {
    /// Free-text search
    #[clap(short, long)]
    pub search_text: Option<String>,

    /// Catalog id or configured name (e.g. "dresses")
    #[clap(short, long)]
    pub catalog: Option<String>,

    #[clap(long)]
    pub price_from: Option<f64>,

    #[clap(long)]
    pub price_to: Option<f64>,

    /// Comma-separated brand ids
    #[clap(long)]
    pub brand_ids: Option<IdList>,

    /// Comma-separated size ids
    #[clap(long)]
    pub size_ids: Option<IdList>,

    /// Comma-separated color ids
    #[clap(long)]
    pub color_ids: Option<IdList>,

    /// Overrides harvest.max_pages
    #[clap(long)]
    pub max_pages: Option<u32>,

    /// Overrides harvest.per_page
    #[clap(long)]
    pub per_page: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Harvest catalog listings, normalize them and write them out.
    Harvest {
        #[command(flatten)]
        filters: HarvestArgs,

        /// Write the raw API items as a JSON array
        #[clap(long)]
        raw_json: Option<PathBuf>,

        /// Write the normalized dataset
        #[clap(long, default_value = "vinted_items.csv")]
        csv: PathBuf,
    },

    /// Embed the photos of a normalized dataset into the vector index.
    Index {
        #[clap(long, required_unless_present = "raw_json")]
        csv: Option<PathBuf>,

        /// Index a raw harvest dump instead, normalizing it first
        #[clap(long, conflicts_with = "csv")]
        raw_json: Option<PathBuf>,

        /// Overrides index.batch_size
        #[clap(short, long)]
        batch_size: Option<usize>,

        /// Re-embed listings already in the index
        #[clap(short, long, default_value = "false")]
        force: bool,
    },

    /// Harvest (or load a dataset) and index it in one go.
    Refresh {
        /// Index this dataset instead of harvesting
        #[clap(long)]
        csv: Option<PathBuf>,

        /// Also write the harvested dataset here
        #[clap(long)]
        save_csv: Option<PathBuf>,

        #[command(flatten)]
        filters: HarvestArgs,
    },

    /// Find listings whose photos match a text description.
    Search {
        query: String,

        #[clap(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
    },

    /// Print index statistics.
    Stats {},

    /// Print service health.
    Health {},
}
