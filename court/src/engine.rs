//! Runs one [`ChannelArbitrator`] per channel, each on its own task.
//!
//! Arbitrators never share state. The court routes inputs to them and wires
//! their chain subscriptions, a failure in one channel never stalls the
//! others.

use crate::{
    arbitrator::{ArbitrationReport, ArbitratorState, ChannelArbitrator, Input, Phase, Services},
    chain::{ChainWatcher, OutpointUpdate},
    channel::{ChannelId, ChannelSnapshot, Preimage},
    config::Config,
    resolver::{Event, Resolver},
};
use anyhow::{anyhow, bail};
use bitcoin::{OutPoint, Script, Transaction};
use futures::{
    future::FutureExt,
    stream::{BoxStream, SelectAll, StreamExt},
};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing_futures::Instrument;

#[derive(Debug)]
enum Command {
    Inputs(Vec<Input>),
    Report(oneshot::Sender<ArbitrationReport>),
    Shutdown,
}

#[derive(Debug)]
enum Message {
    Command(Command),
    Input(Input),
}

#[derive(Debug)]
struct Running {
    /// Tells a task apart from a later one arbitrating the same channel.
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

type RunningMap = Arc<Mutex<HashMap<ChannelId, Running>>>;

pub struct Court {
    config: Config,
    services: Services,
    chain: Arc<dyn ChainWatcher>,
    sweep_script: Script,
    running: RunningMap,
    generations: AtomicU64,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for Court {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Court")
            .field("config", &self.config)
            .field("sweep_script", &self.sweep_script)
            .finish()
    }
}

impl Court {
    /// `sweep_script` is where the claims of newly watched channels pay to.
    pub fn new(
        config: Config,
        services: Services,
        chain: Arc<dyn ChainWatcher>,
        sweep_script: Script,
    ) -> Self {
        Self {
            config,
            services,
            chain,
            sweep_script,
            running: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Resumes every arbitration found in the store. A channel whose
    /// checkpoint cannot be loaded is skipped.
    pub async fn start(&self) -> anyhow::Result<()> {
        let channels = self.services.store.active_channels().await?;
        tracing::info!("resuming {} arbitrations", channels.len());

        for channel_id in channels {
            match self.services.store.load(&channel_id).await {
                Ok(Some(state)) => self.spawn(state).await?,
                Ok(None) => {}
                Err(e) => tracing::error!("cannot resume channel {}: {:#}", channel_id, e),
            }
        }

        Ok(())
    }

    /// Starts arbitrating a channel, or updates it if it is arbitrated
    /// already.
    pub async fn watch_channel(&self, snapshot: ChannelSnapshot) -> anyhow::Result<()> {
        self.ensure_accepting()?;

        let channel_id = snapshot.channel_id;
        if self.running.lock().await.contains_key(&channel_id) {
            match self.update_channel(snapshot.clone()).await {
                Ok(()) => return Ok(()),
                // the previous arbitration of this channel has ended
                Err(_) => {
                    self.running.lock().await.remove(&channel_id);
                }
            }
        }

        let state = ArbitratorState::new(snapshot, self.sweep_script.clone(), 0);
        self.services.store.checkpoint(&state).await?;
        self.spawn(state).await?;

        tracing::info!("watching channel {}", channel_id);

        Ok(())
    }

    pub async fn update_channel(&self, snapshot: ChannelSnapshot) -> anyhow::Result<()> {
        let channel_id = snapshot.channel_id;

        self.send(&channel_id, Command::Inputs(vec![Input::UpdateSnapshot(snapshot)]))
            .await
    }

    /// Hands over a closing transaction of `channel_id` seen by the
    /// channel-state layer.
    pub async fn close_observed(
        &self,
        channel_id: &ChannelId,
        transaction: Transaction,
        commitment_height: Option<u64>,
    ) -> anyhow::Result<()> {
        self.send(
            channel_id,
            Command::Inputs(vec![Input::CloseObserved {
                transaction,
                commitment_height,
            }]),
        )
        .await
    }

    /// Offers a newly learned preimage to every channel.
    pub async fn preimage_learned(&self, preimage: Preimage) -> anyhow::Result<()> {
        self.ensure_accepting()?;

        let input = Input::Resolver(Event::Preimage {
            payment_hash: preimage.hash(),
            preimage,
        });

        for running in self.running.lock().await.values() {
            let _ = running
                .commands
                .send(Command::Inputs(vec![input.clone()]));
        }

        Ok(())
    }

    /// Report of an arbitration that has not finished yet. Finished ones are
    /// kept in the archive of the store.
    pub async fn report(&self, channel_id: &ChannelId) -> anyhow::Result<Option<ArbitrationReport>> {
        let (sender, receiver) = oneshot::channel();

        if self
            .send(channel_id, Command::Report(sender))
            .await
            .is_ok()
        {
            if let Ok(report) = receiver.await {
                return Ok(Some(report));
            }
        }

        let state = self.services.store.load(channel_id).await?;

        Ok(state.as_ref().map(ArbitrationReport::from))
    }

    /// Reports of every arbitration currently running.
    pub async fn reports(&self) -> anyhow::Result<Vec<ArbitrationReport>> {
        let channels = self
            .running
            .lock()
            .await
            .keys()
            .copied()
            .collect::<Vec<_>>();

        let mut reports = Vec::with_capacity(channels.len());
        for channel_id in channels {
            if let Some(report) = self.report(&channel_id).await? {
                reports.push(report);
            }
        }

        Ok(reports)
    }

    /// Stops accepting inputs and waits for every arbitrator to finish the
    /// batch it is working on.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let running = self
            .running
            .lock()
            .await
            .drain()
            .collect::<Vec<_>>();

        for (_, running) in running.iter() {
            let _ = running.commands.send(Command::Shutdown);
        }
        for (channel_id, running) in running {
            if let Err(e) = running.task.await {
                tracing::error!("arbitrator of channel {} panicked: {}", channel_id, e);
            }
        }

        tracing::info!("court shut down");
    }

    fn ensure_accepting(&self) -> anyhow::Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            bail!("court is shutting down")
        }

        Ok(())
    }

    async fn send(&self, channel_id: &ChannelId, command: Command) -> anyhow::Result<()> {
        self.ensure_accepting()?;

        let running = self.running.lock().await;
        let running = running
            .get(channel_id)
            .ok_or_else(|| anyhow!("channel {} is not under arbitration", channel_id))?;

        running
            .commands
            .send(command)
            .map_err(|_| anyhow!("arbitration of channel {} has ended", channel_id))
    }

    async fn spawn(&self, state: ArbitratorState) -> anyhow::Result<()> {
        let channel_id = state.channel_id;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let (commands, receiver) = mpsc::unbounded_channel();
        let running_map = self.running.clone();

        // held until the task is registered, a task that ends right away
        // must not deregister before that
        let mut running = self.running.lock().await;

        let arbitrator = ChannelArbitrator::new(state, self.config, self.services.clone());
        let task = tokio::spawn(
            run(arbitrator, receiver, self.chain.clone())
                .then(move |()| deregister(running_map, channel_id, generation))
                .instrument(tracing::error_span!("arbitrator", channel_id = %channel_id)),
        );

        let previous = running.insert(
            channel_id,
            Running {
                generation,
                commands,
                task,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.commands.send(Command::Shutdown);
        }

        Ok(())
    }
}

async fn run(
    mut arbitrator: ChannelArbitrator,
    commands: mpsc::UnboundedReceiver<Command>,
    chain: Arc<dyn ChainWatcher>,
) {
    let mut streams = SelectAll::<BoxStream<'static, Message>>::new();
    streams.push(commands.map(Message::Command).boxed());
    streams.push(
        chain
            .watch_height()
            .map(|height| Message::Input(Input::Resolver(Event::BlockConnected { height })))
            .boxed(),
    );
    let mut watched = HashSet::new();
    watch_outpoints(&mut streams, &mut watched, chain.as_ref(), arbitrator.state());

    if let Err(e) = arbitrator.resume().await {
        tracing::error!("failed to resume arbitration: {:#}", e);
    }

    while let Some(message) = streams.next().await {
        let mut batch = vec![message];
        while let Some(Some(message)) = streams.next().now_or_never() {
            batch.push(message);
        }

        let mut inputs = Vec::new();
        let mut report_requests = Vec::new();
        let mut shutdown = false;

        for message in batch {
            match message {
                Message::Input(input) => inputs.push(input),
                Message::Command(Command::Inputs(more)) => inputs.extend(more),
                Message::Command(Command::Report(sender)) => report_requests.push(sender),
                Message::Command(Command::Shutdown) => shutdown = true,
            }
        }

        if !inputs.is_empty() {
            if let Err(e) = arbitrator.handle(inputs).await {
                tracing::error!("{:#}", e);
            }
        }

        for sender in report_requests {
            let _ = sender.send(arbitrator.report());
        }

        watch_outpoints(&mut streams, &mut watched, chain.as_ref(), arbitrator.state());

        if arbitrator.state().phase == Phase::FullyResolved {
            archive(&arbitrator).await;
            return;
        }

        if shutdown {
            tracing::debug!("arbitrator stopped");
            return;
        }
    }
}

/// Subscribes to the funding outpoint and to every contested outpoint not
/// watched yet.
fn watch_outpoints(
    streams: &mut SelectAll<BoxStream<'static, Message>>,
    watched: &mut HashSet<OutPoint>,
    chain: &dyn ChainWatcher,
    state: &ArbitratorState,
) {
    let outpoints = std::iter::once(state.snapshot.funding_outpoint)
        .chain(state.resolvers.iter().flat_map(Resolver::outpoints))
        .collect::<Vec<_>>();

    for outpoint in outpoints {
        if !watched.insert(outpoint) {
            continue;
        }

        streams.push(
            chain
                .watch_outpoint(outpoint)
                .map(move |update| {
                    let event = match update {
                        OutpointUpdate::Spent { spender, height } => Event::Spent {
                            outpoint,
                            spender,
                            height,
                        },
                        OutpointUpdate::Reorged { txid } => Event::SpendReorged { outpoint, txid },
                    };

                    Message::Input(Input::Resolver(event))
                })
                .boxed(),
        );
    }
}

async fn archive(arbitrator: &ChannelArbitrator) {
    let channel_id = arbitrator.state().channel_id;

    match arbitrator.services().store.delete(&channel_id).await {
        Ok(()) => tracing::info!("arbitration of channel {} finished", channel_id),
        Err(e) => tracing::error!("failed to archive channel {}: {:#}", channel_id, e),
    }
}

/// Forgets the task of `channel_id` once it ended, unless a newer task took
/// its place.
async fn deregister(running: RunningMap, channel_id: ChannelId, generation: u64) {
    let mut running = running.lock().await;

    if running
        .get(&channel_id)
        .map_or(false, |entry| entry.generation == generation)
    {
        running.remove(&channel_id);
    }
}
