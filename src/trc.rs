//! Tracing configuration and initialization.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

const LOG_ENV_VAR: &str = "RM_FS_LOG";

enum TrcMode {
    /// Compact output with spinners, for people watching a terminal.
    Pretty,
    /// Plain, verbose output with span events.
    Ugly,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Trc {
    /// Pick a filter from `RM_FS_LOG`, then `RUST_LOG`, then the `-v` count.
    pub fn new(verbosity: u8) -> Self {
        let maybe_env_filter =
            EnvFilter::try_from_env(LOG_ENV_VAR).or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            // If the user provided an env_filter, they probably know what they're doing and
            // don't want any fancy formatting, so we default to the ugly mode.
            Ok(env_filter) => Self {
                mode: TrcMode::Ugly,
                env_filter,
            },
            Err(_) if verbosity == 0 => Self {
                mode: TrcMode::Pretty,
                env_filter: EnvFilter::new("info"),
            },
            Err(_) => Self {
                mode: TrcMode::Ugly,
                env_filter: EnvFilter::new(if verbosity == 1 { "debug" } else { "trace" }),
            },
        }
    }

    pub fn init(self) -> Result<(), TryInitError> {
        match self.mode {
            TrcMode::Ugly => self.init_ugly_mode(),
            TrcMode::Pretty => self.init_pretty_mode(),
        }
    }

    fn init_ugly_mode(self) -> Result<(), TryInitError> {
        // "Ugly mode" is the plain, verbose, rust logging mode.
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .finish()
            .try_init()
    }

    fn init_pretty_mode(self) -> Result<(), TryInitError> {
        // "Pretty mode" is the more user-friendly, compact, and colorful mode.
        let indicatif_layer = IndicatifLayer::new();
        tracing_subscriber::registry()
            .with(self.env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .with(indicatif_layer)
            .try_init()
    }
}
