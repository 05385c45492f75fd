//! Log and progress output shared by the upgrade binaries.

use indicatif::ProgressStyle;
use lazy_static::lazy_static;
use tracing::Level;
use tracing_indicatif::{filter::IndicatifFilter, IndicatifLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    /// Style for spans counting fetched blocks of a file.
    pub static ref BLOCKS_PROGRESS_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix}{spinner} {wide_msg} [{bar:20}] {pos}/{len} blocks ({elapsed})"
    )
    .expect("invalid progress template");
    static ref DEFAULT_STYLE: ProgressStyle =
        ProgressStyle::with_template("{span_child_prefix}{spinner} {wide_msg} ({elapsed})")
            .expect("invalid progress template");
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid RUST_LOG: {0}")]
    Filter(#[from] tracing_subscriber::filter::FromEnvError),
}

/// Installs the global subscriber.
///
/// ```no_run
/// zos_tracing::TracingBuilder::default()
///     .level(tracing::Level::DEBUG)
///     .json(true)
///     .build()
///     .unwrap();
/// ```
pub struct TracingBuilder {
    level: Level,
    json: bool,
    progress_bar: bool,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            level: Level::INFO,
            json: false,
            progress_bar: false,
        }
    }
}

impl TracingBuilder {
    /// Lowest level logged unless RUST_LOG says otherwise.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    /// Log JSON lines instead of human readable output. Meant for nodes
    /// shipping their logs somewhere else.
    pub fn json(mut self, json: bool) -> TracingBuilder {
        self.json = json;
        self
    }

    /// Draw download progress on stderr. Has no effect with [Self::json].
    pub fn enable_progressbar(mut self) -> TracingBuilder {
        self.progress_bar = true;
        self
    }

    pub fn build(self) -> Result<(), Error> {
        let indicatif = IndicatifLayer::new().with_progress_style(DEFAULT_STYLE.clone());

        // log lines go through the progress layer so bars are not torn apart
        let fmt = tracing_subscriber::fmt::Layer::new().with_writer(indicatif.get_stderr_writer());
        let fmt = if self.json {
            fmt.json().boxed()
        } else {
            fmt.compact().boxed()
        };

        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?;

        let progress = (self.progress_bar && !self.json)
            .then(|| indicatif.with_filter(IndicatifFilter::new(false)));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .with(progress)
            .try_init()?;

        Ok(())
    }
}
