//! Sentry wiring shared by the worker binaries.

use sentry_tracing::{EventFilter, SentryLayer};
use tracing::Level;

const SENTRY_DSN_ENV: &str = "SENTRY_DSN";

/// Initialise the Sentry client when `SENTRY_DSN` is set.
///
/// The returned guard must be held for the lifetime of the process; dropping
/// it flushes pending events.
pub fn init_from_env() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var(SENTRY_DSN_ENV).ok().filter(|v| !v.trim().is_empty())?;

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            send_default_pii: false,
            ..Default::default()
        },
    ));

    sentry::configure_scope(|scope| {
        scope.set_tag("component", "workflow-worker");
    });

    Some(guard)
}

/// Tracing layer forwarding errors as Sentry events and warnings as breadcrumbs.
pub fn sentry_layer<S>() -> SentryLayer<S>
where
    S: tracing::Subscriber,
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    sentry_tracing::layer().event_filter(|metadata| match *metadata.level() {
        Level::ERROR => EventFilter::Event,
        Level::WARN | Level::INFO => EventFilter::Breadcrumb,
        _ => EventFilter::Ignore,
    })
}
