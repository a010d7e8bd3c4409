//! macropanel core: the aggregation and feature-derivation engine.
//!
//! Data flows strictly through four stages, with the symbol registry read and
//! extended at each boundary:
//! - `panel`: sparse per-source observations → dense daily panel
//! - `aggregate`: declared cross-series columns (ratios, spreads, ...)
//! - `features`: two-tier feature graph (per-series, then cross-series)
//! - `registry`: one metadata row per symbol, committed per stage
//!
//! File formats beyond the registry CSV live in `macropanel-runner`.

pub mod aggregate;
pub mod domain;
pub mod error;
pub mod features;
pub mod fingerprint;
pub mod panel;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::ConfigError;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything handed to or produced by the worker
    /// pool is Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<panel::Panel>();
        require_sync::<panel::Panel>();
        require_send::<registry::SymbolRegistry>();
        require_sync::<registry::SymbolRegistry>();
        require_send::<features::FeatureGraph>();
        require_sync::<features::FeatureGraph>();
        require_send::<features::FeatureCatalog>();
        require_sync::<features::FeatureCatalog>();
        require_send::<features::FeatureEngine>();
        require_sync::<features::FeatureEngine>();
        require_send::<features::TransformError>();
        require_sync::<features::TransformError>();
        require_send::<aggregate::AggregateCatalog>();
        require_sync::<aggregate::AggregateCatalog>();
        require_send::<domain::SourceBatch>();
        require_sync::<domain::SourceBatch>();
    }
}
