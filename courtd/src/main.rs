#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

mod command;
mod config;
mod fs;
mod seed;
mod trace;

use crate::{
    command::{close, dump_config, preimage, run, status, watch, Command, Options, Wiring},
    config::{read_config, Settings},
    fs::default_config_path,
    seed::Seed,
};
use anyhow::{Context, Result};
use rand::rngs::OsRng;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::from_args();

    let file = read_config(&options.config_file, default_config_path)?;
    let settings = Settings::from_config_file_and_defaults(file)
        .context("could not initialize configuration")?;

    if let Command::DumpConfig = options.cmd {
        return dump_config(settings);
    }

    trace::init_tracing(settings.logging.level).context("could not initialize tracing")?;

    let seed = Seed::from_file_or_generate(&settings.data.dir, OsRng)
        .context("could not retrieve/initialize seed")?;
    let wiring = Wiring::new(&settings, &seed)?;

    match options.cmd {
        Command::Run => run(&settings, &wiring).await?,
        Command::Watch { snapshot } => {
            let report = watch(&settings, &wiring, &snapshot).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Close {
            channel_id,
            transaction,
            height,
        } => {
            let report = close(&settings, &wiring, channel_id, transaction, height).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Preimage { preimage: value } => {
            let payment_hash = preimage(&wiring, value).await?;
            println!("Recorded preimage of payment hash {}", payment_hash);
        }
        Command::Status { channel_id } => {
            let status = status(&wiring, channel_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::DumpConfig => unreachable!(),
    };

    Ok(())
}
