//! Log output of the supervisor itself.
//!
//! Log lines are emitted with the `tracing` macros and rendered by a [LogTemplate]
//! chosen with `--log-format`. Lines always go to stdout, which the supervisor
//! points at its [logfile::LogFile] once it has daemonized.
pub mod escape;
pub mod logfile;
pub mod template;

use cfg_if::cfg_if;
use chrono::Local;
use const_format::concatcp;
use std::{
    fmt::{
        self,
        Write as _,
    },
    str::FromStr,
};
use thiserror::Error;
use tracing::{
    Event,
    Subscriber,
    field::{
        Field,
        Visit,
    },
};
use tracing_subscriber::{
    fmt::{
        FmtContext,
        FormatEvent,
        FormatFields,
        format::Writer,
    },
    registry::LookupSpan,
};

use crate::PROGRAM_NAME;
pub use self::template::{
    LogTemplate,
    Record,
    TemplateError,
};


cfg_if! {
    if #[cfg(debug_assertions)] {
        const TEMPLATE_TEXT: &str = concatcp!("[%t] ", PROGRAM_NAME, ": [%L] %f:%n: %s");
        const TEMPLATE_JSON: &str = concatcp!(
            r#"{"level":"%l","timestamp":"%T","source":""#, PROGRAM_NAME,
            r#"","filename":"%jf","lineno":%n,"message":"%js"}"#
        );
        const TEMPLATE_XML: &str = concatcp!(
            r#"<log level="%l" timestamp="%T" source=""#, PROGRAM_NAME,
            r#"" filename="%xf" lineno="%n">%xs</log>"#
        );
        const TEMPLATE_SQL: &str = concatcp!(
            "INSERT INTO logs (level, timestamp, source, filename, lineno, message) VALUES ('%l', '%T', '",
            PROGRAM_NAME, "', '%qf', %n, '%qs');"
        );
        const TEMPLATE_CSV: &str = concatcp!(r#""%l","%T",""#, PROGRAM_NAME, r#"","%cs","%cf",%n"#, "\r");
    } else {
        const TEMPLATE_TEXT: &str = concatcp!("[%t] ", PROGRAM_NAME, ": [%L] %s");
        const TEMPLATE_JSON: &str = concatcp!(
            r#"{"level":"%l","timestamp":"%T","source":""#, PROGRAM_NAME, r#"","message":"%js"}"#
        );
        const TEMPLATE_XML: &str = concatcp!(
            r#"<log level="%l" timestamp="%T" source=""#, PROGRAM_NAME, r#"">%xs</log>"#
        );
        const TEMPLATE_SQL: &str = concatcp!(
            "INSERT INTO logs (level, timestamp, source, message) VALUES ('%l', '%T', '",
            PROGRAM_NAME, "', '%qs');"
        );
        const TEMPLATE_CSV: &str = concatcp!(r#""%l","%T",""#, PROGRAM_NAME, r#"","%cs""#, "\r");
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogFormatError {
    #[error("unknown log format {0:?} (expected text, json, xml, sql, csv or template:<TEMPLATE>)")]
    Unknown(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// The value of `--log-format`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
    Xml,
    Sql,
    Csv,
    Template(LogTemplate),
}

impl LogFormat {
    pub fn template(&self) -> LogTemplate {
        match self {
            LogFormat::Text => LogTemplate::parse(TEMPLATE_TEXT),
            LogFormat::Json => LogTemplate::parse(TEMPLATE_JSON),
            LogFormat::Xml => LogTemplate::parse(TEMPLATE_XML),
            LogFormat::Sql => LogTemplate::parse(TEMPLATE_SQL),
            LogFormat::Csv => LogTemplate::parse(TEMPLATE_CSV),
            LogFormat::Template(template) => template.clone(),
        }
    }
}

impl Default for LogFormat {
    fn default() -> LogFormat {
        LogFormat::Text
    }
}

impl FromStr for LogFormat {
    type Err = LogFormatError;

    fn from_str(value: &str) -> Result<LogFormat, LogFormatError> {
        const TEMPLATE_PREFIX: &str = "template:";

        let prefixed = value.get(..TEMPLATE_PREFIX.len())
            .map_or(false, |head| head.eq_ignore_ascii_case(TEMPLATE_PREFIX));
        if prefixed {
            let template = LogTemplate::parse(&value[TEMPLATE_PREFIX.len()..]);
            template.validate()?;
            return Ok(LogFormat::Template(template));
        }

        match value.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "xml" => Ok(LogFormat::Xml),
            "sql" => Ok(LogFormat::Sql),
            "csv" => Ok(LogFormat::Csv),
            _ => Err(LogFormatError::Unknown(value.to_string())),
        }
    }
}

/// Collects the `message` field of an event, followed by any other fields as
/// ` key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    extra: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.extra, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.extra, " {}={:?}", field.name(), value);
        }
    }
}

/// `tracing-subscriber` event formatter rendering every event through a [LogTemplate].
pub struct TemplateFormat {
    template: LogTemplate,
}

impl TemplateFormat {
    pub fn new(template: LogTemplate) -> TemplateFormat {
        TemplateFormat {
            template,
        }
    }
}

impl<S, N> FormatEvent<S, N> for TemplateFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.extra);

        let meta = event.metadata();
        let record = Record {
            level: *meta.level(),
            message: &visitor.message,
            file: meta.file().unwrap_or("?"),
            line: meta.line().unwrap_or(0),
        };
        let now = Local::now();
        self.template.render(&mut writer, &now.with_timezone(now.offset()), &record)?;
        writer.write_char('\n')
    }
}

/// Install the global subscriber. Lines are written to whatever stdout is at the time
/// of the event, so redirecting stdout moves the log.
pub fn init(format: &LogFormat) {
    let subscriber = tracing_subscriber::fmt()
        .event_format(TemplateFormat::new(format.template()))
        .with_writer(std::io::stdout)
        .finish();
    // a second call (only possible in tests) keeps the first subscriber
    let _ = tracing::subscriber::set_global_default(subscriber);
}
