use crate::{
    channel::CircuitKey,
    database::{circuit_key, deserialize, serialize, Database},
    oracle::{CircuitNotifier, CircuitResolution},
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resolution of an upstream HTLC, waiting to be picked up by the forwarding
/// layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCircuit {
    pub circuit: CircuitKey,
    pub resolution: CircuitResolution,
    pub resolved_at: DateTime<Utc>,
}

impl Database {
    pub fn resolved_circuit(&self, circuit: &CircuitKey) -> anyhow::Result<Option<ResolvedCircuit>> {
        self.circuits
            .get(circuit_key(circuit))?
            .map(|bytes| deserialize(&bytes).context("Could not deserialize resolved circuit"))
            .transpose()
    }

    pub fn resolved_circuits(&self) -> anyhow::Result<Vec<ResolvedCircuit>> {
        self.circuits
            .iter()
            .values()
            .map(|item| {
                let bytes = item.context("Could not retrieve data")?;

                deserialize(&bytes).context("Could not deserialize resolved circuit")
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl CircuitNotifier for Database {
    async fn notify_resolution(
        &self,
        circuit: CircuitKey,
        resolution: CircuitResolution,
    ) -> anyhow::Result<bool> {
        let record = ResolvedCircuit {
            circuit,
            resolution,
            resolved_at: Utc::now(),
        };

        let swapped = self
            .circuits
            .compare_and_swap(
                circuit_key(&circuit),
                Option::<Vec<u8>>::None,
                Some(serialize(&record)?),
            )
            .context("Could not write in the DB")?;

        if swapped.is_err() {
            tracing::debug!("circuit {} had already been resolved", circuit);
            return Ok(false);
        }

        self.flush().await?;
        tracing::info!("resolved circuit {} as {}", circuit, resolution);

        Ok(true)
    }
}
