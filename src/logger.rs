use std::panic::{self, PanicHookInfo};
use std::thread;

use tracing::{error, level_filters::LevelFilter};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::CargoEnv;

pub struct LoggerGuards {
    pub _tracing_guard: WorkerGuard,
    // only there when a dsn is configured
    pub _sentry_guard: Option<sentry::ClientInitGuard>,
}

pub struct Logger {}

impl Logger {
    pub fn init(cargo_env: CargoEnv, sentry_dsn: Option<String>) -> LoggerGuards {
        // per request steps are logged at debug, production keeps them so a bad channel can be
        // traced back through the file log
        let max_level = match cargo_env {
            CargoEnv::Development => LevelFilter::INFO,
            CargoEnv::Production => LevelFilter::DEBUG,
        };

        let (writer, tracing_guard) = Self::writer(cargo_env);

        let sentry_guard = sentry_dsn.map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    environment: Some(Self::environment_name(cargo_env).into()),
                    attach_stacktrace: true,
                    ..Default::default()
                },
            ))
        });

        let registry = tracing_subscriber::registry().with(max_level).with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true),
        );

        match sentry_guard {
            Some(_) => registry.with(sentry_tracing::layer()).init(),
            None => registry.init(),
        }

        panic::set_hook(Box::new(log_panic));

        LoggerGuards {
            _tracing_guard: tracing_guard,
            _sentry_guard: sentry_guard,
        }
    }

    pub fn environment_name(cargo_env: CargoEnv) -> &'static str {
        match cargo_env {
            CargoEnv::Development => "development",
            CargoEnv::Production => "production",
        }
    }

    // stdout while developing, a daily file under logs/ in production
    fn writer(cargo_env: CargoEnv) -> (NonBlocking, WorkerGuard) {
        match cargo_env {
            CargoEnv::Development => tracing_appender::non_blocking(std::io::stdout()),
            CargoEnv::Production => {
                tracing_appender::non_blocking(tracing_appender::rolling::daily("logs", "daily.log"))
            }
        }
    }
}

/// a panicking request task shouldn't vanish silently, send it through tracing (and sentry)
fn log_panic(info: &PanicHookInfo<'_>) {
    let current = thread::current();
    let thread_name = current.name().unwrap_or("unknown");

    let payload = info.payload();
    let message = payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>");

    let location = info
        .location()
        .map(|l| format!("{}:{}", l.file(), l.line()))
        .unwrap_or_else(|| "unknown location".to_string());

    error!(
        target: "panic",
        "thread '{}' panicked at {}: {}\n{:?}",
        thread_name,
        location,
        message,
        backtrace::Backtrace::new()
    );
}
