//! A `tracing_subscriber` event formatter matching the runtime's line shape:
//! `<timestamp> - <component> - <level> - <reqid>: <msg>` (spec §6 Ambient
//! stack / Logging). Grounded in `original_source/runtime/log.py`'s
//! `logging.Formatter` format string, re-expressed as a `FormatEvent` impl
//! the way the teacher wires `tracing_subscriber::fmt()` in `main.rs`.

use std::fmt;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::field::Visit;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub struct KiwiFormatter;

impl<S, N> FormatEvent<S, N> for KiwiFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, writer: &mut dyn fmt::Write, event: &Event<'_>) -> fmt::Result {
        let meta = event.metadata();
        let mut visitor = MessageAndRequestId::default();
        event.record(&mut visitor);

        let request_id = visitor.request_id.unwrap_or_else(|| "-".to_owned());
        let component = meta.target();
        let level = level_label(meta.level());

        write!(
            writer,
            "{} - {} - {} - {}: ",
            chrono::Utc::now().to_rfc3339(),
            component,
            level,
            request_id,
        )?;

        if let Some(message) = visitor.message {
            write!(writer, "{}", message)?;
        } else {
            ctx.format_fields(writer, event)?;
        }

        writeln!(writer)
    }
}

fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARN",
        Level::ERROR => "ERROR",
    }
}

#[derive(Default)]
struct MessageAndRequestId {
    message: Option<String>,
    request_id: Option<String>,
}

impl Visit for MessageAndRequestId {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "request_id" {
            self.request_id = Some(value.to_owned());
        } else if field.name() == "message" {
            self.message = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else if field.name() == "request_id" {
            self.request_id = Some(format!("{:?}", value));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn level_label_matches_upper_case_names() {
        assert_eq!("INFO", level_label(&Level::INFO));
        assert_eq!("ERROR", level_label(&Level::ERROR));
    }
}
