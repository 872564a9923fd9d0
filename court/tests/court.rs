pub mod harness;

use court::{Config, Court, Phase, ResolutionStore};
use harness::{MockChain, World};
use spectral::prelude::*;
use std::{sync::Arc, time::Duration};

async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> futures::future::BoxFuture<'static, bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::delay_for(Duration::from_millis(20)).await;
    }

    panic!("condition not met in time")
}

fn court(world: &World, chain: &Arc<MockChain>) -> Arc<Court> {
    Arc::new(Court::new(
        Config::default(),
        world.services(),
        chain.clone(),
        harness::sweep_script(),
    ))
}

#[tokio::test]
async fn cooperative_close_is_archived_once_resolved() {
    let world = World::new();
    let chain = Arc::new(MockChain::default());
    let channel = harness::channel(vec![], None);
    let channel_id = channel.snapshot.channel_id;
    let court = court(&world, &chain);

    court.watch_channel(channel.snapshot.clone()).await.unwrap();
    chain.spend(
        channel.snapshot.funding_outpoint,
        harness::cooperative_close(),
        100,
    );
    for height in 100..=105 {
        chain.connect_block(height);
    }

    let db = world.db.clone();
    eventually(move || {
        let db = db.clone();
        Box::pin(async move { db.archived(&channel_id).unwrap().is_some() })
    })
    .await;

    let archived = world.db.archived(&channel_id).unwrap().unwrap();
    assert_eq!(archived.report.phase, Phase::FullyResolved);
    assert_that(&world.db.active_channels().await.unwrap()).is_empty();
}

#[tokio::test]
async fn archived_arbitrations_are_no_longer_reported() {
    let world = World::new();
    let chain = Arc::new(MockChain::default());
    let channel = harness::channel(vec![], None);
    let channel_id = channel.snapshot.channel_id;
    let court = court(&world, &chain);

    court.watch_channel(channel.snapshot.clone()).await.unwrap();
    chain.spend(
        channel.snapshot.funding_outpoint,
        harness::cooperative_close(),
        100,
    );
    chain.connect_block(100);

    let observed = court.clone();
    eventually(move || {
        let court = observed.clone();
        Box::pin(async move {
            court
                .report(&channel_id)
                .await
                .unwrap()
                .map(|report| report.phase == Phase::ClosePending)
                .unwrap_or(false)
        })
    })
    .await;
    assert_eq!(court.reports().await.unwrap().len(), 1);

    for height in 101..=105 {
        chain.connect_block(height);
    }

    let observed = court.clone();
    eventually(move || {
        let court = observed.clone();
        Box::pin(async move { court.reports().await.unwrap().is_empty() })
    })
    .await;

    assert_that(&court.report(&channel_id).await.unwrap()).is_none();
    assert_that(&world.db.archived(&channel_id).unwrap()).is_some();
}

#[tokio::test]
async fn arbitrations_are_resumed_after_a_restart() {
    let world = World::new();
    let chain = Arc::new(MockChain::default());
    let channel = harness::channel(vec![], None);
    let channel_id = channel.snapshot.channel_id;

    let first = court(&world, &chain);
    first.watch_channel(channel.snapshot.clone()).await.unwrap();
    chain.connect_block(100);
    first.shutdown().await;

    assert!(first
        .watch_channel(channel.snapshot.clone())
        .await
        .is_err());

    let second = court(&world, &chain);
    second.start().await.unwrap();
    chain.spend(channel.snapshot.funding_outpoint, channel.remote.clone(), 101);
    chain.connect_block(101);

    let court = second.clone();
    eventually(move || {
        let court = court.clone();
        Box::pin(async move {
            court
                .report(&channel_id)
                .await
                .unwrap()
                .map(|report| report.phase == Phase::ContractDeployed)
                .unwrap_or(false)
        })
    })
    .await;

    assert_eq!(world.broadcasts().len(), 1);
    assert_eq!(second.reports().await.unwrap().len(), 1);
}

#[tokio::test]
async fn preimages_are_routed_to_every_channel() {
    let world = World::new();
    let chain = Arc::new(MockChain::default());
    let preimage = court::Preimage::from([42; 32]);
    let channel = harness::channel(
        vec![court::channel::OutputKind::ReceivedHtlc(harness::htlc(
            7, preimage, 700,
        ))],
        None,
    );
    let court = court(&world, &chain);

    court.watch_channel(channel.snapshot.clone()).await.unwrap();
    chain.spend(channel.snapshot.funding_outpoint, channel.local.clone(), 100);
    chain.connect_block(100);

    let observed = court.clone();
    let channel_id = channel.snapshot.channel_id;
    eventually(move || {
        let court = observed.clone();
        Box::pin(async move {
            court
                .report(&channel_id)
                .await
                .unwrap()
                .map(|report| report.phase == Phase::ContractDeployed)
                .unwrap_or(false)
        })
    })
    .await;

    court.preimage_learned(preimage).await.unwrap();

    // notifications are flushed after the claim went out
    let log = world.log.clone();
    eventually(move || {
        let notified = log
            .lock()
            .unwrap()
            .iter()
            .any(|op| matches!(op, harness::Op::Notify(..)));
        Box::pin(async move { notified })
    })
    .await;

    assert_eq!(world.broadcasts().len(), 1);
    assert_eq!(world.notifications().len(), 1);
}

#[tokio::test]
async fn unknown_channel_has_no_report() {
    let world = World::new();
    let chain = Arc::new(MockChain::default());
    let court = court(&world, &chain);
    let channel = harness::channel(vec![], None);

    let report = court.report(&channel.snapshot.channel_id).await.unwrap();

    assert_that(&report).is_none();
}
