// ── Device configuration contract ──
//
// Every driver's configuration type implements `DeviceConfiguration`.
// The core only needs a name, a running policy, validation, deep copy
// (`Clone`) and a round-trippable encoding; everything else is opaque.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::device::ConfigurationStatus;
use crate::error::CoreError;

/// Current version of the configuration envelope.
pub const ENVELOPE_VERSION: u32 = 1;

/// Configuration of a single device.
pub trait DeviceConfiguration:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Type name of this configuration, e.g. `"sensors::ThermometerConfiguration"`.
    ///
    /// Used to resolve the device type by naming convention.
    fn kind(&self) -> &str;

    /// Device name, unique within a host.
    fn name(&self) -> &str;

    /// Requested running policy.
    fn status(&self) -> ConfigurationStatus;

    /// Check device-specific invariants.
    fn validate(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<B> {
    version: u32,
    kind: String,
    body: B,
}

/// Serialize a configuration into a versioned JSON envelope.
pub fn encode_configuration<C: DeviceConfiguration>(config: &C) -> Result<Vec<u8>, CoreError> {
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        kind: config.kind().to_owned(),
        body: config,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Inverse of [`encode_configuration`].
///
/// Rejects envelopes from a different version and bodies whose decoded
/// kind differs from the one recorded in the envelope.
pub fn decode_configuration<C: DeviceConfiguration>(bytes: &[u8]) -> Result<C, CoreError> {
    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(bytes)?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(CoreError::UnsupportedVersion {
            found: envelope.version,
            expected: ENVELOPE_VERSION,
        });
    }

    let config: C = serde_json::from_value(envelope.body)?;
    if config.kind() != envelope.kind {
        return Err(CoreError::KindMismatch {
            expected: envelope.kind,
            found: config.kind().to_owned(),
        });
    }
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ValveConfiguration {
        name: String,
        status: ConfigurationStatus,
        port: String,
        open_percent: u8,
        tags: Vec<String>,
    }

    impl DeviceConfiguration for ValveConfiguration {
        fn kind(&self) -> &str {
            "plant::ValveConfiguration"
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn status(&self) -> ConfigurationStatus {
            self.status
        }

        fn validate(&self) -> Result<(), CoreError> {
            if self.open_percent > 100 {
                return Err(CoreError::invalid(&self.name, "open_percent must be <= 100"));
            }
            Ok(())
        }
    }

    fn valve() -> ValveConfiguration {
        ValveConfiguration {
            name: "valve-3".into(),
            status: ConfigurationStatus::AlwaysRunning,
            port: "/dev/ttyUSB0".into(),
            open_percent: 40,
            tags: vec!["north".into(), "irrigation".into()],
        }
    }

    #[test]
    fn decode_of_encoded_clone_equals_original() {
        let original = valve();
        let bytes = encode_configuration(&original.clone()).unwrap();
        let decoded: ValveConfiguration = decode_configuration(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn envelope_records_version_and_kind() {
        let bytes = encode_configuration(&valve()).unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["version"], ENVELOPE_VERSION);
        assert_eq!(raw["kind"], "plant::ValveConfiguration");
        assert_eq!(raw["body"]["port"], "/dev/ttyUSB0");
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let bytes = br#"{"version":7,"kind":"plant::ValveConfiguration","body":{}}"#;
        let err = decode_configuration::<ValveConfiguration>(bytes).unwrap_err();
        assert_eq!(
            err,
            CoreError::UnsupportedVersion {
                found: 7,
                expected: ENVELOPE_VERSION
            }
        );
    }

    #[test]
    fn decode_rejects_kind_mismatch() {
        let mut raw: serde_json::Value =
            serde_json::from_slice(&encode_configuration(&valve()).unwrap()).unwrap();
        raw["kind"] = "plant::PumpConfiguration".into();
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(matches!(
            decode_configuration::<ValveConfiguration>(&bytes),
            Err(CoreError::KindMismatch { .. })
        ));
    }

    #[test]
    fn validate_reports_device_name() {
        let mut bad = valve();
        bad.open_percent = 150;
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("valve-3"));
    }
}
