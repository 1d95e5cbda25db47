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

use std::env;
use std::fmt::{self, Debug};

use tracing::{Event, Subscriber, field};
use tracing_log::NormalizeEvent;
use tracing_subscriber::fmt::format::{JsonFields, Writer};
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, prelude::*};

const DEFAULT_FILTER: &str = "clusterproxy=info,warn";
const LOG_FORMAT: &str = "LOG_FORMAT";

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match env::var(LOG_FORMAT).as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }

    fn layer(self) -> BoxLayer {
        let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        match self {
            LogFormat::Json => Box::new(
                layer
                    .event_format(tracing_subscriber::fmt::format().json().flatten_event(true))
                    .fmt_fields(JsonFields::default()),
            ),
            LogFormat::Plain => Box::new(layer.event_format(PlainFormat).fmt_fields(PlainFormat)),
        }
    }
}

/// setup_logging installs the global subscriber. Output goes to stderr; stdout carries the health
/// table and the kubectl session.
pub fn setup_logging() {
    tracing_subscriber::registry()
        .with(LogFormat::from_env().layer().with_filter(env_filter()))
        .init();
}

fn env_filter() -> EnvFilter {
    let directives = env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    match EnvFilter::builder().with_regex(false).parse(&directives) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!(
                "ignoring invalid {}={directives}: {e}",
                EnvFilter::DEFAULT_ENV
            );
            EnvFilter::new(DEFAULT_FILTER)
        }
    }
}

// PlainFormat writes tab separated lines: time, level, target and spans, message, fields.
struct PlainFormat;

struct FieldWriter<'w> {
    out: Writer<'w>,
    first: bool,
    res: fmt::Result,
}

impl field::Visit for FieldWriter<'_> {
    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.record_debug(field, &value)
    }

    fn record_debug(&mut self, field: &field::Field, value: &dyn Debug) {
        if self.res.is_err() {
            return;
        }
        self.res = if field.name() == "message" {
            write!(self.out, "{value:?}\t")
        } else {
            let sep = if std::mem::take(&mut self.first) { "" } else { " " };
            write!(self.out, "{sep}{}={value:?}", field.name())
        };
    }
}

impl<'w> FormatFields<'w> for PlainFormat {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        out: Writer<'w>,
        fields: R,
    ) -> fmt::Result {
        let mut visitor = FieldWriter {
            out,
            first: true,
            res: Ok(()),
        };
        fields.record(&mut visitor);
        visitor.res
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
        mut out: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        SystemTime.format_time(&mut out)?;
        let level = meta.level().as_str().to_ascii_lowercase();
        let target = meta.target();
        write!(
            out,
            "\t{level}\t{}",
            target.strip_prefix("clusterproxy::").unwrap_or(target)
        )?;

        for span in ctx.event_scope().into_iter().flat_map(|s| s.from_root()) {
            write!(out, ":{}", span.metadata().name())?;
            let ext = span.extensions();
            match ext.get::<FormattedFields<N>>() {
                Some(fields) if !fields.is_empty() => write!(out, "{{{fields}}}")?,
                _ => {}
            }
        }
        if event.fields().next().is_some() {
            out.write_char('\t')?;
        }
        ctx.format_fields(out.by_ref(), event)?;
        writeln!(out)
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use once_cell::sync::Lazy;
    use tracing_subscriber::{EnvFilter, prelude::*};

    use super::PlainFormat;

    static TRACING: Lazy<()> = Lazy::new(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .event_format(PlainFormat)
            .fmt_fields(PlainFormat)
            .with_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("clusterproxy=debug")),
            );
        let _ = tracing_subscriber::registry().with(layer).try_init();
    });

    /// setup_test_logging routes logs through the test harness so they only show for failures.
    pub fn setup_test_logging() {
        Lazy::force(&TRACING);
    }
}
