use atty::Stream;
use log::LevelFilter;
use tracing::{info, level_filters::LevelFilter as TracingLevelFilter, subscriber};
use tracing_subscriber::FmtSubscriber;

pub fn init_tracing(level: LevelFilter) -> anyhow::Result<()> {
    if level == LevelFilter::Off {
        return Ok(());
    }

    let is_terminal = atty::is(Stream::Stdout);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing_level(level))
        .with_ansi(is_terminal)
        .finish();

    subscriber::set_global_default(subscriber)?;
    info!("Initialized tracing with level: {}", level);

    Ok(())
}

fn tracing_level(level: LevelFilter) -> TracingLevelFilter {
    match level {
        LevelFilter::Off => TracingLevelFilter::OFF,
        LevelFilter::Error => TracingLevelFilter::ERROR,
        LevelFilter::Warn => TracingLevelFilter::WARN,
        LevelFilter::Info => TracingLevelFilter::INFO,
        LevelFilter::Debug => TracingLevelFilter::DEBUG,
        LevelFilter::Trace => TracingLevelFilter::TRACE,
    }
}
