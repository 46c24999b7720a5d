// =============================================================================
// Custom Indicator Registry
// =============================================================================
//
// User-supplied indicators are pure functions `(data, options) -> series`
// registered under a name. Registration takes the write lock; lookups clone
// the `Arc` out of the read lock and run the indicator with no lock held, so a
// failing indicator cannot leave the map half-updated.
//
// Re-registering a name replaces the previous indicator (last one wins). The
// replacement is logged and reported to the caller.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::IndicatorError;

/// Free-form options handed to a custom indicator.
pub type IndicatorOptions = Map<String, Value>;

/// A named, pure indicator supplied by the host application.
pub trait CustomIndicator: Send + Sync {
    fn name(&self) -> &str;

    fn calculate(&self, data: &[f64], options: &IndicatorOptions)
        -> Result<Vec<f64>, IndicatorError>;
}

/// Adapter so plain closures can be registered.
struct FnIndicator<F> {
    name: String,
    func: F,
}

impl<F> CustomIndicator for FnIndicator<F>
where
    F: Fn(&[f64], &IndicatorOptions) -> Result<Vec<f64>, IndicatorError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn calculate(
        &self,
        data: &[f64],
        options: &IndicatorOptions,
    ) -> Result<Vec<f64>, IndicatorError> {
        (self.func)(data, options)
    }
}

/// Thread-safe name -> indicator map.
#[derive(Default)]
pub struct IndicatorRegistry {
    indicators: RwLock<HashMap<String, Arc<dyn CustomIndicator>>>,
}

impl IndicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `indicator` under its own name.
    ///
    /// Returns `true` when an existing indicator with that name was replaced.
    pub fn register(&self, indicator: Arc<dyn CustomIndicator>) -> bool {
        let name = indicator.name().to_string();
        let replaced = self
            .indicators
            .write()
            .insert(name.clone(), indicator)
            .is_some();

        if replaced {
            warn!(indicator = %name, "custom indicator re-registered, previous definition replaced");
        } else {
            debug!(indicator = %name, "custom indicator registered");
        }
        replaced
    }

    /// Register a closure under `name`.
    pub fn register_fn<F>(&self, name: impl Into<String>, func: F) -> bool
    where
        F: Fn(&[f64], &IndicatorOptions) -> Result<Vec<f64>, IndicatorError>
            + Send
            + Sync
            + 'static,
    {
        self.register(Arc::new(FnIndicator {
            name: name.into(),
            func,
        }))
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.indicators.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indicators.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indicators.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up `name` and run it over `data`.
    pub fn compute(
        &self,
        name: &str,
        data: &[f64],
        options: &IndicatorOptions,
    ) -> Result<Vec<f64>, IndicatorError> {
        let indicator = self
            .indicators
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| IndicatorError::UnknownIndicator(name.to_string()))?;

        indicator.calculate(data, options)
    }
}

impl std::fmt::Debug for IndicatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorRegistry")
            .field("names", &self.names())
            .finish()
    }
}
