use crate::layer::RecordLayer;
use crate::logger::Logger;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Configuration of the tracing integration.
///
/// **Fields**
/// - `min_level`: least severe level that is forwarded to the [`Logger`].
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt::Layer` is
///   installed next to [`RecordLayer`] so events are also printed.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub min_level: Level,
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            min_level: Level::ERROR,
            enable_stdout: true,
        }
    }
}

/// Install a global `tracing` subscriber that forwards events to `logger`.
///
/// **Parameters**
/// - `logger`: a connected [`Logger`]; the layer keeps a handle to it.
/// - `config`: [`LayerConfig`] controlling level filtering and console
///   output.
///
/// **Returns**
/// - `Err(..)` if a global subscriber was already installed.
pub fn init_tracing_with_config(logger: Logger, config: LayerConfig) -> Result<(), SetGlobalDefaultError> {
    let layer = RecordLayer::new(logger, config.min_level);

    // The two subscriber shapes have different types.
    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)
    }
}

/// Initialize tracing with [`LayerConfig::default`]: errors only, echoed to
/// stdout.
pub fn init_tracing(logger: Logger) -> Result<(), SetGlobalDefaultError> {
    init_tracing_with_config(logger, LayerConfig::default())
}
