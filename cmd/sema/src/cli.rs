//! Command-line surface.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser as ClapParser, Subcommand as ClapSubcommand};
use tracing::info;

use sema_analysis::pipeline::{self, AnalysisOptions};
use sema_lift::explorer::ExploreLimits;

#[derive(ClapParser)]
#[command(
    name = "sema",
    about = "Behavioral summaries of EVM contracts from bytecode",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser, Debug, Clone)]
pub struct CommonOptions {
    #[arg(
        short = 'w',
        long = "working_dir",
        default_value = "./",
        help = "Directory holding the input files; outputs are written next to them",
        env = "SEMA_WORKING_DIR"
    )]
    pub working_dir: PathBuf,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    /// Statically analyze `<working_dir>/<address>.hex` into semantic units.
    #[command(name = "static_analysis")]
    StaticAnalysis {
        #[arg(short = 'a', long = "address", help = "Address of the contract")]
        address: String,
        #[command(flatten)]
        common: CommonOptions,
        #[arg(
            long = "loop_uncover_times",
            default_value_t = 16,
            help = "Maximum traversals of one CFG edge per path"
        )]
        loop_uncover_times: u32,
        #[arg(
            long = "no_feasibility_check",
            default_value_t = false,
            help = "Skip the path feasibility checker"
        )]
        no_feasibility_check: bool,
    },
    /// Analyze one transaction's pre-fetched trace against a prior static run.
    #[command(name = "transaction_analysis")]
    TransactionAnalysis {
        #[arg(
            short = 'a',
            long = "transaction_hash",
            help = "Hash of the transaction; reads <working_dir>/<hash>.trace.json"
        )]
        transaction_hash: String,
        #[command(flatten)]
        common: CommonOptions,
    },
    /// Turn `semantic_units.json` into a typed behavior graph.
    #[command(name = "build_graph")]
    BuildGraph {
        #[arg(short = 'a', long = "address", help = "Address of the contract")]
        address: String,
        #[command(flatten)]
        common: CommonOptions,
    },
    /// Render `semantic_units.json` into per-function descriptions.
    #[command(name = "description_generation")]
    DescriptionGeneration {
        #[arg(short = 'a', long = "address", help = "Address of the contract")]
        address: String,
        #[command(flatten)]
        common: CommonOptions,
    },
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Subcommand::StaticAnalysis {
            address,
            common,
            loop_uncover_times,
            no_feasibility_check,
        } => {
            let options = AnalysisOptions {
                limits: ExploreLimits {
                    loop_uncover_times,
                    ..ExploreLimits::default()
                },
                check_feasibility: !no_feasibility_check,
                ..AnalysisOptions::default()
            };
            let result = pipeline::static_analysis(&address, &common.working_dir, &options)
                .with_context(|| format!("static analysis of {address} failed"))?;
            info!(
                units = result.units.len(),
                functions = result.functions.len(),
                "static analysis finished"
            );
            Ok(())
        }
        Subcommand::TransactionAnalysis {
            transaction_hash,
            common,
        } => {
            let result = pipeline::transaction_analysis(&transaction_hash, &common.working_dir)
                .with_context(|| format!("transaction analysis of {transaction_hash} failed"))?;
            info!(units = result.units.len(), "transaction analysis finished");
            Ok(())
        }
        Subcommand::BuildGraph { address, common } => {
            let units_path = common.working_dir.join("semantic_units.json");
            let raw = std::fs::read_to_string(&units_path)
                .with_context(|| format!("reading {}", units_path.display()))?;
            let units = sema_analysis::graph::parse_units(&raw);
            let graph = sema_analysis::graph::build_graph(&units);
            let out = common.working_dir.join("graph.json");
            std::fs::write(&out, serde_json::to_string_pretty(&graph)?)?;
            info!(address, out = %out.display(), "behavior graph written");
            Ok(())
        }
        Subcommand::DescriptionGeneration { address, common } => {
            let units_path = common.working_dir.join("semantic_units.json");
            let raw = std::fs::read_to_string(&units_path)
                .with_context(|| format!("reading {}", units_path.display()))?;
            let units = sema_analysis::graph::parse_units(&raw);
            let descriptions = sema_analysis::describe::describe_units(&units);
            let out = common.working_dir.join("descriptions.json");
            std::fs::write(&out, serde_json::to_string_pretty(&descriptions)?)?;
            info!(address, out = %out.display(), "descriptions written");
            Ok(())
        }
    }
}
