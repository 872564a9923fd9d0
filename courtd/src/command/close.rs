use crate::{command::Wiring, config::Settings};
use anyhow::Context;
use bitcoin::Transaction;
use court::{ArbitrationReport, ChannelArbitrator, ChannelId, Input, ResolutionStore};

pub async fn close(
    settings: &Settings,
    wiring: &Wiring,
    channel_id: ChannelId,
    transaction: Transaction,
    commitment_height: Option<u64>,
) -> anyhow::Result<ArbitrationReport> {
    let state = wiring
        .database
        .load(&channel_id)
        .await?
        .with_context(|| format!("channel {} is not under arbitration", channel_id))?;

    let mut arbitrator = ChannelArbitrator::new(state, settings.court.config, wiring.services.clone());
    arbitrator
        .handle(vec![Input::CloseObserved {
            transaction,
            commitment_height,
        }])
        .await?;

    Ok(arbitrator.report())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{
            watch,
            watch::tests::{settings, snapshot, write_snapshot},
        },
        seed::Seed,
    };
    use bitcoin::{Script, TxIn, TxOut};
    use court::{CloseType, Phase};
    use tempfile::TempDir;

    #[tokio::test]
    async fn observed_close_waits_for_confirmation() {
        let tmp_dir = TempDir::new().unwrap();
        let settings = settings(&tmp_dir);
        let wiring = Wiring::new(&settings, &Seed::from([7; 32])).unwrap();
        let snapshot = snapshot();
        watch(&settings, &wiring, &write_snapshot(&tmp_dir, &snapshot))
            .await
            .unwrap();

        let cooperative_close = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: snapshot.funding_outpoint,
                script_sig: Script::new(),
                sequence: 0xffff_ffff,
                witness: Vec::new(),
            }],
            output: vec![TxOut {
                value: 10_000,
                script_pubkey: wiring.sweep_script.clone(),
            }],
        };

        let report = close(
            &settings,
            &wiring,
            snapshot.channel_id,
            cooperative_close,
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.phase, Phase::ClosePending);
        assert_eq!(report.close_type, Some(CloseType::CooperativeClose));
    }

    #[tokio::test]
    async fn unknown_channel_cannot_be_closed() {
        let tmp_dir = TempDir::new().unwrap();
        let settings = settings(&tmp_dir);
        let wiring = Wiring::new(&settings, &Seed::from([7; 32])).unwrap();
        let snapshot = snapshot();

        let result = close(
            &settings,
            &wiring,
            snapshot.channel_id,
            Transaction {
                version: 2,
                lock_time: 0,
                input: Vec::new(),
                output: Vec::new(),
            },
            None,
        )
        .await;

        assert!(result.is_err());
    }
}
