// ── Device factories ──
//
// Device types are resolved from the configuration's kind by naming
// convention: `pkg::ThermometerConfiguration` → `pkg::Thermometer`, then
// `pkg::ThermometerDevice`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::device::DeviceDriver;
use crate::error::CoreError;
use crate::model::DeviceConfiguration;

const CONFIGURATION_SUFFIX: &str = "Configuration";
const DEVICE_SUFFIX: &str = "Device";

/// Builds a driver for one configuration.
pub type DeviceFactory<D> =
    Arc<dyn Fn(&<D as DeviceDriver>::Config) -> Result<D, CoreError> + Send + Sync>;

/// Device-type registry keyed by type name.
pub struct DeviceFactories<D: DeviceDriver> {
    by_type: HashMap<String, DeviceFactory<D>>,
}

impl<D: DeviceDriver> Default for DeviceFactories<D> {
    fn default() -> Self {
        Self {
            by_type: HashMap::new(),
        }
    }
}

impl<D: DeviceDriver> DeviceFactories<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under a device type name such as `"sensors::Thermometer"`.
    #[must_use]
    pub fn with(
        mut self,
        type_name: impl Into<String>,
        factory: impl Fn(&D::Config) -> Result<D, CoreError> + Send + Sync + 'static,
    ) -> Self {
        self.register(type_name, factory);
        self
    }

    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        factory: impl Fn(&D::Config) -> Result<D, CoreError> + Send + Sync + 'static,
    ) {
        self.by_type.insert(type_name.into(), Arc::new(factory));
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Resolve the factory for `kind`, returning the matched type name.
    pub fn resolve(&self, kind: &str) -> Result<(&str, &DeviceFactory<D>), CoreError> {
        let tried = candidate_types(kind);
        for candidate in &tried {
            if let Some((name, factory)) = self.by_type.get_key_value(candidate.as_str()) {
                return Ok((name.as_str(), factory));
            }
        }
        Err(CoreError::DeviceTypeNotFound {
            kind: kind.to_owned(),
            tried: tried.join(", "),
        })
    }

    /// Resolve and invoke the factory for `config`.
    pub fn create(&self, config: &D::Config) -> Result<D, CoreError> {
        let (_, factory) = self.resolve(config.kind())?;
        factory(config)
    }
}

impl<D: DeviceDriver> fmt::Debug for DeviceFactories<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.by_type.keys().collect();
        types.sort();
        f.debug_struct("DeviceFactories")
            .field("types", &types)
            .finish()
    }
}

/// Type names tried for a configuration kind, in order.
pub fn candidate_types(kind: &str) -> Vec<String> {
    let base = match kind.strip_suffix(CONFIGURATION_SUFFIX) {
        Some(base) if !base.is_empty() && !base.ends_with("::") => base,
        _ => kind,
    };
    vec![base.to_owned(), format!("{base}{DEVICE_SUFFIX}")]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::ConfigurationStatus;
    use crate::test_support::{LampConfiguration, LampDriver, Probe};

    #[test]
    fn candidates_strip_suffix_and_keep_namespace() {
        assert_eq!(
            candidate_types("sensors::ThermometerConfiguration"),
            vec!["sensors::Thermometer", "sensors::ThermometerDevice"]
        );
        assert_eq!(candidate_types("Valve"), vec!["Valve", "ValveDevice"]);
        assert_eq!(
            candidate_types("io::Configuration"),
            vec!["io::Configuration", "io::ConfigurationDevice"]
        );
    }

    #[test]
    fn resolves_device_suffixed_type() {
        let probe = Arc::new(Probe::default());
        let factories = DeviceFactories::new().with("test::LampDevice", move |_: &LampConfiguration| {
            Ok(LampDriver::new(&probe))
        });

        let (name, _) = factories.resolve("test::LampConfiguration").unwrap();
        assert_eq!(name, "test::LampDevice");

        let config = LampConfiguration::new("desk", ConfigurationStatus::Runnable);
        assert!(factories.create(&config).is_ok());
    }

    #[test]
    fn unknown_kind_reports_tried_names() {
        let factories: DeviceFactories<LampDriver> = DeviceFactories::new();
        let err = factories.resolve("test::FanConfiguration").err().unwrap();
        assert_eq!(
            err,
            CoreError::DeviceTypeNotFound {
                kind: "test::FanConfiguration".into(),
                tried: "test::Fan, test::FanDevice".into(),
            }
        );
    }
}
