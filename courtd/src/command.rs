mod close;
mod preimage;
mod run;
mod status;
mod watch;

use crate::{
    config::{File, Settings},
    seed::Seed,
};
use anyhow::Context;
use bitcoin::{consensus::deserialize, Script, Transaction};
use court::{
    arbitrator::Services, chain::BitcoindBroadcaster, keys::LocalSigner, witness,
    ChannelId, Database, Preimage,
};
use std::{path::PathBuf, sync::Arc};
use structopt::StructOpt;

pub use self::{close::close, preimage::preimage, run::run, status::status, watch::watch};

#[derive(StructOpt, Debug)]
pub struct Options {
    /// Path to configuration file
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config_file: Option<PathBuf>,

    /// Commands available
    #[structopt(subcommand)]
    pub cmd: Command,
}

impl Options {
    pub fn from_args() -> Self {
        StructOpt::from_args()
    }
}

/// All commands but `run` work on the database directly and must not be
/// used while the daemon is running.
#[derive(StructOpt, Debug, Clone)]
pub enum Command {
    /// Resume every arbitration and resolve channel closes as they happen
    Run,
    /// Start arbitrating the channel described by a JSON snapshot file
    Watch {
        #[structopt(parse(from_os_str))]
        snapshot: PathBuf,
    },
    /// Hand over a closing transaction of a channel seen off-chain
    Close {
        channel_id: ChannelId,
        #[structopt(parse(try_from_str = parse_transaction))]
        transaction: Transaction,
        /// Commitment number of the transaction, if known
        #[structopt(long)]
        height: Option<u64>,
    },
    /// Record the preimage of a settled invoice
    Preimage { preimage: Preimage },
    /// Print the arbitration of one channel, or of all channels
    Status { channel_id: Option<ChannelId> },
    /// Dump the current configuration
    DumpConfig,
}

pub fn dump_config(settings: Settings) -> anyhow::Result<()> {
    let file = File::from(settings);
    let serialized = toml::to_string(&file)?;
    println!("{}", serialized);
    Ok(())
}

fn parse_transaction(hex: &str) -> anyhow::Result<Transaction> {
    let bytes = hex::decode(hex)?;
    let transaction = deserialize(&bytes)?;

    Ok(transaction)
}

/// Everything the court is wired to in this process.
#[derive(Debug)]
pub struct Wiring {
    pub database: Arc<Database>,
    pub services: Services,
    pub sweep_script: Script,
}

impl Wiring {
    pub fn new(settings: &Settings, seed: &Seed) -> anyhow::Result<Self> {
        let dir = settings.data.database_dir();
        let database = Arc::new(
            Database::new(&dir)
                .with_context(|| format!("failed to open database at {}", dir.display()))?,
        );

        let sweep_script = match &settings.court.sweep_address {
            Some(address) => address.script_pubkey(),
            None => witness::p2wpkh(&seed.sweep_key()?),
        };

        let services = Services {
            store: database.clone(),
            broadcaster: Arc::new(BitcoindBroadcaster::new(
                settings.bitcoin.bitcoind.node_url.clone(),
            )),
            oracle: database.clone(),
            notifier: database.clone(),
            signer: Arc::new(LocalSigner::new(seed.base_secrets()?)),
        };

        Ok(Wiring {
            database,
            services,
            sweep_script,
        })
    }
}
