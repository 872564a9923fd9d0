pub mod file;
mod serde;
pub mod settings;

use ::serde::{Deserialize, Serialize};
use anyhow::{anyhow, Context};
use std::path::PathBuf;
use url::Url;

pub use self::{file::File, settings::*};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Data {
    pub dir: PathBuf,
}

impl Data {
    pub fn database_dir(&self) -> PathBuf {
        self.dir.join("database")
    }
}

/// The node serving both the REST interface blocks are read from and the
/// JSON-RPC interface claims are broadcast through.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Bitcoind {
    pub node_url: Url,
}

pub fn read_config<T>(config_file: &Option<PathBuf>, default_config_path: T) -> anyhow::Result<File>
where
    T: FnOnce() -> anyhow::Result<PathBuf>,
{
    let path = config_file
        .as_ref()
        .map(|path| {
            eprintln!("Using config file {}", path.display());
            path
        })
        .map_or_else(
            || {
                // try to load default config
                let default_path = default_config_path()?;

                if default_path.exists() {
                    eprintln!(
                        "Using config file at default path: {}",
                        default_path.display()
                    );
                    Ok(default_path)
                } else {
                    eprintln!("Config file default path is {}", default_path.display());
                    Err(anyhow!("no config file at the default path"))
                }
            },
            |path| Ok(path.to_path_buf()),
        )
        .ok();
    match path {
        Some(path) => File::read(&path)
            .with_context(|| format!("failed to read config file {}", path.display())),
        None => Ok(File::default()),
    }
}
