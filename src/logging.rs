//! Tracing setup. Follows the teacher's `logging.rs`: an `EnvFilter`
//! defaulting to `info`, with sled's own chatter suppressed, and a
//! `ConditionalLocationFormatter` that only prints file:line for ERROR and
//! WARN (INFO/DEBUG stay uncluttered).
//!
//! Permanent, durable lifecycle events (upload accepted, checkpointed,
//! finalized, resumed) are marked with an emoji per the teacher's
//! "emoji marks a permanent log" convention; everything else at INFO/DEBUG
//! is a plain, disposable diagnostic.

use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub struct ConditionalLocationFormatter;

impl<S, N> FormatEvent<S, N> for ConditionalLocationFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &tracing::Event<'_>) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = metadata.level();

        write!(&mut writer, "{level}")?;

        if matches!(level, &Level::ERROR | &Level::WARN) {
            write!(&mut writer, " {}", metadata.target())?;
            if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
                write!(&mut writer, " {file}:{line}")?;
            }
        }

        write!(&mut writer, ": ")?;

        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                if !first {
                    write!(&mut writer, ":")?;
                }
                first = false;
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<tracing_subscriber::fmt::FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
            write!(writer, " ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

pub fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        .add_directive("sled=warn".parse().unwrap())
        .add_directive("pagecache=warn".parse().unwrap());

    tracing_subscriber::fmt().with_env_filter(env_filter).event_format(ConditionalLocationFormatter).init();
}
