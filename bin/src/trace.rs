//! Tracing setup, mirroring the teacher's `dora_core::config::trace`
//! module: level comes from `IGNITE_LOG`, format from `LOG_FORMAT`.
use anyhow::Result;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{
        self,
        format::{Format, PrettyFields},
    },
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// Initializes the global `tracing` subscriber from the parsed config.
/// Call exactly once, before anything else logs.
pub fn init(ignite_log: &str, log_format: &str) -> Result<()> {
    let filter = EnvFilter::try_new(ignite_log)
        .or_else(|_| EnvFilter::try_new("info"))?
        .add_directive("hyper=off".parse()?);

    match log_format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .event_format(Format::default().pretty().with_source_location(false))
                        .fmt_fields(PrettyFields::new()),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
    Ok(())
}
