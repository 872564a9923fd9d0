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
    clippy::print_stdout,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

//! The contract court: per-channel arbitration of channel closes.
//!
//! Once the funding output of a channel is spent, the channel's arbitrator
//! classifies the closing transaction, spawns one resolver per contested
//! output and drives those resolvers on chain and preimage events until every
//! output is claimed, timed out or lost. Every transition is checkpointed to a
//! [`ResolutionStore`] before any transaction it decided on is broadcast.

pub mod arbitrator;
pub mod chain;
pub mod channel;
pub mod claim;
pub mod close;
pub mod config;
pub mod database;
pub mod engine;
mod error;
pub mod keys;
pub mod oracle;
pub mod resolver;
pub mod store;
pub mod witness;

pub use self::{
    arbitrator::{ArbitrationReport, ArbitratorState, ChannelArbitrator, Input, Phase, Services},
    channel::{ChannelId, ChannelSnapshot, CircuitKey, PaymentHash, Preimage, ShortChannelId},
    close::CloseType,
    config::Config,
    database::Database,
    engine::Court,
    error::Error,
    resolver::{Outcome, Resolver, ResolverKind},
    store::ResolutionStore,
};

use bitcoin::secp256k1::{All, Secp256k1};
use conquer_once::Lazy;

pub static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// A module for exporting dependencies that appear in the public API of our
/// crate.
///
/// Consumers that need to construct transactions, keys or scripts for the
/// court can use these instead of declaring their own, possibly
/// incompatible, version of the dependency.
pub mod export {
    pub use ::bitcoin;
}
