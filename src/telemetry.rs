// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use tracing::{Event, Subscriber, field};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::{JsonFields, Writer};
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, prelude::*};

const LOG_FORMAT: &str = "LOG_FORMAT";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// `time\tlevel\ttarget:span{fields}\tmessage\tkey=value ...`
    #[default]
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

pub fn setup_logging() {
    let format = std::env::var(LOG_FORMAT)
        .ok()
        .and_then(|v| match v.parse() {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("{e}, using plain logs");
                None
            }
        })
        .unwrap_or_default();
    tracing_subscriber::registry()
        .with(fmt_layer(format).with_filter(env_filter()))
        .init();
}

/// Returns the span a component logs under. Created once at startup and handed to each component,
/// so every line it emits carries the component name.
pub fn component_span(name: &'static str) -> tracing::Span {
    tracing::info_span!("component", name)
}

fn fmt_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    match format {
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .event_format(tracing_subscriber::fmt::format().json().flatten_event(true))
                .fmt_fields(JsonFields::default()),
        ),
        LogFormat::Plain => Box::new(plain_layer::<Registry, _>(std::io::stdout)),
    }
}

/// The plain tab-separated layer, writing to `make_writer`.
pub(crate) fn plain_layer<S, W>(make_writer: W) -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .event_format(PlainFormat)
        .fmt_fields(PlainFormat)
        .with_writer(make_writer)
}

fn env_filter() -> EnvFilter {
    // Every pool checkout logs at debug; keep hyper's pool at info unless RUST_LOG names it.
    let directives = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(v) => format!("hyper_util::client::legacy::pool=info,{v}"),
        Err(_) => "info".to_string(),
    };
    EnvFilter::builder()
        .with_regex(false)
        .parse(&directives)
        .unwrap_or_else(|e| {
            eprintln!("invalid log filter {directives:?}: {e}, falling back to info");
            EnvFilter::new("info")
        })
}

struct PlainFormat;

/// Collects an event's fields: the message on its own, everything else as `key=value`.
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    rest: String,
}

impl field::Visit for FieldCollector {
    fn record_str(&mut self, field: &field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.push(field.name(), &value);
        }
    }

    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.push(field.name(), value);
        }
    }
}

impl FieldCollector {
    fn push(&mut self, name: &str, value: &dyn fmt::Debug) {
        if !self.rest.is_empty() {
            self.rest.push(' ');
        }
        let _ = write!(self.rest, "{name}={value:?}");
    }

    fn write_to(&self, mut writer: Writer<'_>) -> fmt::Result {
        match (&self.message, self.rest.is_empty()) {
            (Some(m), true) => write!(writer, "{m}"),
            (Some(m), false) => write!(writer, "{m}\t{}", self.rest),
            (None, _) => write!(writer, "{}", self.rest),
        }
    }
}

impl<'writer> FormatFields<'writer> for PlainFormat {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'writer>,
        fields: R,
    ) -> fmt::Result {
        let mut collector = FieldCollector::default();
        fields.record(&mut collector);
        collector.write_to(writer)
    }
}

impl<S, N> FormatEvent<S, N> for PlainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use tracing_log::NormalizeEvent;

        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());

        SystemTime.format_time(&mut writer)?;
        let level = meta.level().as_str().to_ascii_lowercase();
        let target = meta.target();
        write!(
            writer,
            "\t{level}\t{}",
            target.strip_prefix("hangup::").unwrap_or(target)
        )?;

        for span in ctx.event_scope().into_iter().flat_map(|s| s.from_root()) {
            write!(writer, ":{}", span.metadata().name())?;
            if let Some(fields) = span.extensions().get::<FormattedFields<N>>() {
                if !fields.is_empty() {
                    write!(writer, "{{{fields}}}")?;
                }
            }
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);
        if collector.message.is_some() || !collector.rest.is_empty() {
            writer.write_char('\t')?;
            collector.write_to(writer.by_ref())?;
        }
        writeln!(writer)
    }
}
