use crate::config::{file, Bitcoind, Data, File};
use anyhow::Context;
use court::config::FeePolicy;
use log::LevelFilter;
use url::Url;

/// This structs represents the settings as they are used through out the code.
///
/// An optional setting (represented in this struct as an `Option`) has semantic
/// meaning in courtd. Contrary to that, many configuration values are optional
/// in the config file but may be replaced by default values when the
/// `Settings` are created from a given `File`.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub data: Data,
    pub logging: Logging,
    pub bitcoin: Bitcoin,
    pub court: Court,
}

#[derive(Clone, Copy, Debug, PartialEq, derivative::Derivative)]
#[derivative(Default)]
pub struct Logging {
    #[derivative(Default(value = "LevelFilter::Info"))]
    pub level: LevelFilter,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Bitcoin {
    pub network: bitcoin::Network,
    pub bitcoind: Bitcoind,
}

impl Bitcoin {
    fn default_from_network(network: bitcoin::Network) -> Self {
        Self {
            network,
            bitcoind: Bitcoind::new(network),
        }
    }
}

impl Default for Bitcoin {
    fn default() -> Self {
        Self::default_from_network(bitcoin::Network::Regtest)
    }
}

impl Bitcoind {
    fn new(network: bitcoin::Network) -> Self {
        let port = match network {
            bitcoin::Network::Bitcoin => 8332,
            bitcoin::Network::Testnet => 18332,
            bitcoin::Network::Regtest => 18443,
        };

        let mut node_url = Url::parse("http://localhost").expect("static string to be a valid url");
        let _ = node_url.set_port(Some(port));

        Bitcoind { node_url }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Court {
    pub config: court::Config,
    pub sweep_address: Option<bitcoin::Address>,
}

impl Court {
    fn from_file(court: file::Court, network: bitcoin::Network) -> anyhow::Result<Self> {
        let defaults = court::Config::default();
        let fees = court.fees.unwrap_or_default();

        if let Some(address) = &court.sweep_address {
            if address.network != network {
                anyhow::bail!(
                    "sweep address {} is not a {} address",
                    address,
                    network
                );
            }
        }

        let config = court::Config {
            safety_depth: court.safety_depth.unwrap_or(defaults.safety_depth),
            close_confirmation_depth: court
                .close_confirmation_depth
                .unwrap_or(defaults.close_confirmation_depth),
            fees: FeePolicy {
                sat_per_vbyte: fees.sat_per_vbyte.unwrap_or(defaults.fees.sat_per_vbyte),
                max_sat_per_vbyte: fees
                    .max_sat_per_vbyte
                    .unwrap_or(defaults.fees.max_sat_per_vbyte),
                escalation_percent: fees
                    .escalation_percent
                    .unwrap_or(defaults.fees.escalation_percent),
                bump_interval: fees.bump_interval.unwrap_or(defaults.fees.bump_interval),
            },
        };

        if config.safety_depth == 0 || config.close_confirmation_depth == 0 {
            anyhow::bail!("confirmation depths must be at least 1")
        }
        if config.fees.sat_per_vbyte > config.fees.max_sat_per_vbyte {
            anyhow::bail!(
                "fee rate of {} sat/vbyte exceeds the maximum of {} sat/vbyte",
                config.fees.sat_per_vbyte,
                config.fees.max_sat_per_vbyte
            )
        }

        Ok(Court {
            config,
            sweep_address: court.sweep_address,
        })
    }
}

impl Settings {
    pub fn from_config_file_and_defaults(config_file: File) -> anyhow::Result<Self> {
        let File {
            data,
            logging,
            bitcoin,
            court,
        } = config_file;

        let bitcoin = bitcoin
            .map(|file::Bitcoin { network, bitcoind }| Bitcoin {
                network,
                bitcoind: bitcoind.unwrap_or_else(|| Bitcoind::new(network)),
            })
            .unwrap_or_default();

        Ok(Self {
            data: match data {
                Some(data) => data,
                None => Data {
                    dir: crate::fs::data_dir().context("unable to determine default data path")?,
                },
            },
            logging: {
                let Logging {
                    level: default_level,
                } = Logging::default();
                logging
                    .map(|logging| Logging {
                        level: logging.level.map_or(default_level, LevelFilter::from),
                    })
                    .unwrap_or_default()
            },
            court: Court::from_file(court.unwrap_or_default(), bitcoin.network)?,
            bitcoin,
        })
    }
}

impl From<Settings> for File {
    fn from(settings: Settings) -> Self {
        let Settings {
            data,
            logging,
            bitcoin,
            court,
        } = settings;
        let fees = court.config.fees;

        File {
            data: Some(data),
            logging: Some(file::Logging {
                level: Some(logging.level.into()),
            }),
            bitcoin: Some(file::Bitcoin {
                network: bitcoin.network,
                bitcoind: Some(bitcoin.bitcoind),
            }),
            court: Some(file::Court {
                safety_depth: Some(court.config.safety_depth),
                close_confirmation_depth: Some(court.config.close_confirmation_depth),
                sweep_address: court.sweep_address,
                fees: Some(file::Fees {
                    sat_per_vbyte: Some(fees.sat_per_vbyte),
                    max_sat_per_vbyte: Some(fees.max_sat_per_vbyte),
                    escalation_percent: Some(fees.escalation_percent),
                    bump_interval: Some(fees.bump_interval),
                }),
            }),
        }
    }
}
