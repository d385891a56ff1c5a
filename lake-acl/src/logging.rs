//! Subscriber setup for the command line tool.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// HTTP client crates silenced outside debug mode.
pub const QUIET_CLIENTS: &str = "hyper=off,reqwest=off,h2=off,rustls=off";

#[derive(Clone, Debug, Default)]
pub struct LogOptions {
    pub debug: bool,
    pub silent: bool,
    pub file: Option<PathBuf>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// `RUST_LOG` when set, otherwise the level implied by `debug`.
pub fn filter(debug: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(format!("info,{}", QUIET_CLIENTS))
    }
}

fn fmt_layer<W>(debug: bool, ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);
    if debug {
        layer.boxed()
    } else {
        layer
            .without_time()
            .with_target(false)
            .with_level(false)
            .boxed()
    }
}

/// Build the dispatcher for a run. The caller decides where it is installed.
pub fn build_dispatch(options: &LogOptions) -> Result<Dispatch> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    if !options.silent {
        layers.push(fmt_layer(options.debug, true, std::io::stdout));
    }
    if let Some(path) = &options.file {
        let file = File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        layers.push(fmt_layer(options.debug, false, Mutex::new(file)));
    }
    let subscriber = Registry::default()
        .with(layers)
        .with(filter(options.debug));
    Ok(Dispatch::new(subscriber))
}
