use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ferrochain_config::NodeConfig;
use ferrochain_node::{init_logging, run_node};
use ferrochain_wallet::Wallet;

#[derive(Parser)]
#[command(name = "ferrochain", version, about = "ferrochain node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example config.json to the given path
    Init {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
    },
    /// Start the node
    Start {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        cmd: WalletCmd,
    },
}

#[derive(Subcommand)]
enum WalletCmd {
    /// Print the node's public key, creating a wallet if one doesn't exist
    Show {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { config } => init_config(config)?,
        Commands::Start { config, data_dir } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async move {
                init_logging();
                run_node(&config, &data_dir).await
            })?;
        }
        Commands::Wallet { cmd } => match cmd {
            WalletCmd::Show { data_dir } => {
                std::fs::create_dir_all(&data_dir)?;
                let wallet = Wallet::load_or_create(&data_dir.join("wallet.json"))?;
                println!("{}", wallet.public_key);
            }
        },
    }
    Ok(())
}

fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        println!("config already exists at {}", path.display());
        return Ok(());
    }
    let cfg = NodeConfig::example();
    std::fs::write(&path, serde_json::to_vec_pretty(&cfg)?)?;
    println!("wrote example config to {}", path.display());
    Ok(())
}
