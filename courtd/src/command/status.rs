use crate::command::Wiring;
use court::{
    database::{Archived, ResolvedCircuit},
    ArbitrationReport, ChannelId, ResolutionStore,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Status {
    Active(ArbitrationReport),
    Archived(Archived),
    All(Overview),
}

#[derive(Debug, Default, Serialize)]
pub struct Overview {
    pub active: Vec<ArbitrationReport>,
    pub archived: Vec<Archived>,
    pub resolved_circuits: Vec<ResolvedCircuit>,
}

pub async fn status(wiring: &Wiring, channel_id: Option<ChannelId>) -> anyhow::Result<Status> {
    let database = &wiring.database;

    let channel_id = match channel_id {
        Some(channel_id) => channel_id,
        None => return overview(wiring).await.map(Status::All),
    };

    if let Some(state) = database.load(&channel_id).await? {
        return Ok(Status::Active(ArbitrationReport::from(&state)));
    }

    match database.archived(&channel_id)? {
        Some(archived) => Ok(Status::Archived(archived)),
        None => anyhow::bail!("channel {} has never been under arbitration", channel_id),
    }
}

async fn overview(wiring: &Wiring) -> anyhow::Result<Overview> {
    let database = &wiring.database;
    let mut overview = Overview::default();

    for channel_id in database.active_channel_ids()? {
        match database.load(&channel_id).await {
            Ok(Some(state)) => overview.active.push(ArbitrationReport::from(&state)),
            Ok(None) => {}
            Err(e) => tracing::error!("cannot load channel {}: {:#}", channel_id, e),
        }
    }
    overview.archived = database.all_archived()?;
    overview.resolved_circuits = database.resolved_circuits()?;

    Ok(overview)
}
