//! Encryption parameters for the CKKS-style backend.
//!
//! Parameters come from one of three places ([`ParameterSource`]): built-in
//! defaults, a JSON file, or inline JSON. They are loaded and validated when
//! the configuration is built, so a bad source fails before any connection
//! is opened.
//!
//! ```json
//! {
//!   "scheme_name": "HE_SEAL",
//!   "poly_modulus_degree": 8192,
//!   "security_level": 128,
//!   "coeff_modulus": [60, 40, 40, 60],
//!   "scale": 1099511627776,
//!   "complex_packing": true
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const SCHEME_HE_SEAL: &str = "HE_SEAL";
pub const POLY_MODULUS_DEGREES: [usize; 6] = [1024, 2048, 4096, 8192, 16384, 32768];
pub const SECURITY_LEVELS: [u32; 4] = [0, 128, 192, 256];
pub const MAX_COEFF_MODULUS_BITS: u32 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ParameterError {
    #[error("encryption parameter file not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed encryption parameters from {origin}: {source}")]
    Malformed {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid encryption parameters: {0}")]
    Invalid(String),
}

/// Where encryption parameters are loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ParameterSource {
    /// Built-in defaults ([`EncryptionParameters::default`]).
    #[default]
    Default,
    /// Path to a JSON file.
    File(PathBuf),
    /// JSON text.
    Inline(String),
}

impl ParameterSource {
    /// Interpret a flag or env value: empty means default, text starting
    /// with `{` is inline JSON, anything else is a path.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            ParameterSource::Default
        } else if trimmed.starts_with('{') {
            ParameterSource::Inline(trimmed.to_string())
        } else {
            ParameterSource::File(PathBuf::from(trimmed))
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        ParameterSource::File(path.as_ref().to_path_buf())
    }
}

impl fmt::Display for ParameterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterSource::Default => f.write_str("default"),
            ParameterSource::File(path) => write!(f, "{}", path.display()),
            ParameterSource::Inline(_) => f.write_str("inline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionParameters {
    pub scheme_name: String,
    pub poly_modulus_degree: usize,
    pub security_level: u32,
    /// Bit sizes of the coefficient modulus primes.
    pub coeff_modulus: Vec<u32>,
    /// Encoding scale; 0 lets the engine choose.
    #[serde(default)]
    pub scale: f64,
    #[serde(default)]
    pub complex_packing: bool,
}

impl Default for EncryptionParameters {
    fn default() -> Self {
        Self {
            scheme_name: SCHEME_HE_SEAL.to_string(),
            poly_modulus_degree: 1024,
            security_level: 0,
            coeff_modulus: vec![30; 5],
            scale: 0.0,
            complex_packing: false,
        }
    }
}

impl EncryptionParameters {
    /// Load and validate parameters from `source`.
    pub fn load(source: &ParameterSource) -> Result<Self, ParameterError> {
        let params = match source {
            ParameterSource::Default => Self::default(),
            ParameterSource::File(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        ParameterError::Missing(path.clone())
                    } else {
                        ParameterError::Io {
                            path: path.clone(),
                            source: e,
                        }
                    }
                })?;
                Self::from_json(&text, &path.display().to_string())?
            }
            ParameterSource::Inline(text) => Self::from_json(text, "inline JSON")?,
        };
        params.validate()?;
        tracing::debug!(
            source = %source,
            poly_modulus_degree = params.poly_modulus_degree,
            security_level = params.security_level,
            complex_packing = params.complex_packing,
            "loaded encryption parameters"
        );
        Ok(params)
    }

    fn from_json(text: &str, origin: &str) -> Result<Self, ParameterError> {
        serde_json::from_str(text).map_err(|source| ParameterError::Malformed {
            origin: origin.to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.scheme_name != SCHEME_HE_SEAL {
            return Err(ParameterError::Invalid(format!(
                "scheme_name must be {SCHEME_HE_SEAL}, got '{}'",
                self.scheme_name
            )));
        }
        if !POLY_MODULUS_DEGREES.contains(&self.poly_modulus_degree) {
            return Err(ParameterError::Invalid(format!(
                "poly_modulus_degree {} not in {POLY_MODULUS_DEGREES:?}",
                self.poly_modulus_degree
            )));
        }
        if !SECURITY_LEVELS.contains(&self.security_level) {
            return Err(ParameterError::Invalid(format!(
                "security_level {} not in {SECURITY_LEVELS:?}",
                self.security_level
            )));
        }
        if self.coeff_modulus.is_empty() {
            return Err(ParameterError::Invalid("coeff_modulus is empty".into()));
        }
        if let Some(bits) = self
            .coeff_modulus
            .iter()
            .find(|&&b| b == 0 || b > MAX_COEFF_MODULUS_BITS)
        {
            return Err(ParameterError::Invalid(format!(
                "coeff_modulus bit size {bits} outside 1..={MAX_COEFF_MODULUS_BITS}"
            )));
        }
        if !self.scale.is_finite() || self.scale < 0.0 {
            return Err(ParameterError::Invalid(format!(
                "scale must be finite and non-negative, got {}",
                self.scale
            )));
        }
        Ok(())
    }

    /// Real slots per plaintext.
    pub fn slot_capacity(&self) -> usize {
        self.poly_modulus_degree / 2
    }

    pub fn to_json(&self) -> Result<String, ParameterError> {
        serde_json::to_string(self).map_err(|source| ParameterError::Malformed {
            origin: "encoder".into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_parsing() {
        assert_eq!(ParameterSource::parse(""), ParameterSource::Default);
        assert_eq!(ParameterSource::parse("  "), ParameterSource::Default);
        assert_eq!(
            ParameterSource::parse("/etc/he/params.json"),
            ParameterSource::File(PathBuf::from("/etc/he/params.json"))
        );
        assert!(matches!(
            ParameterSource::parse(r#" {"scheme_name":"HE_SEAL"} "#),
            ParameterSource::Inline(text) if text.starts_with('{')
        ));
    }

    #[test]
    fn test_default_parameters() {
        let params = EncryptionParameters::load(&ParameterSource::Default).unwrap();
        assert_eq!(params, EncryptionParameters::default());
        assert_eq!(params.slot_capacity(), 512);
        assert!(!params.complex_packing);
    }

    #[test]
    fn test_inline_parameters() {
        let json = r#"{
            "scheme_name": "HE_SEAL",
            "poly_modulus_degree": 8192,
            "security_level": 128,
            "coeff_modulus": [60, 40, 40, 60],
            "scale": 1099511627776,
            "complex_packing": true
        }"#;
        let params = EncryptionParameters::load(&ParameterSource::Inline(json.into())).unwrap();
        assert_eq!(params.poly_modulus_degree, 8192);
        assert_eq!(params.coeff_modulus, vec![60, 40, 40, 60]);
        assert!(params.complex_packing);
        assert_eq!(params.slot_capacity(), 4096);
    }

    #[test]
    fn test_file_parameters() {
        let path = std::env::temp_dir().join(format!("he_infer_params_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"scheme_name":"HE_SEAL","poly_modulus_degree":4096,"security_level":0,"coeff_modulus":[30,30]}"#,
        )
        .unwrap();
        let params = EncryptionParameters::load(&ParameterSource::from_path(&path)).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(params.poly_modulus_degree, 4096);
        assert_eq!(params.scale, 0.0);
    }

    #[test]
    fn test_missing_file() {
        let path = std::env::temp_dir().join("he_infer_definitely_missing_params.json");
        let err = EncryptionParameters::load(&ParameterSource::File(path)).unwrap_err();
        assert!(matches!(err, ParameterError::Missing(_)));
    }

    #[test]
    fn test_malformed_and_invalid() {
        let err = EncryptionParameters::load(&ParameterSource::Inline("{not json".into())).unwrap_err();
        assert!(matches!(err, ParameterError::Malformed { .. }));

        let mut params = EncryptionParameters::default();
        params.scheme_name = "HE_PALISADE".into();
        assert!(matches!(params.validate(), Err(ParameterError::Invalid(_))));

        let mut params = EncryptionParameters::default();
        params.poly_modulus_degree = 3000;
        assert!(params.validate().is_err());

        let mut params = EncryptionParameters::default();
        params.security_level = 100;
        assert!(params.validate().is_err());

        let mut params = EncryptionParameters::default();
        params.coeff_modulus = vec![30, 61];
        assert!(params.validate().is_err());
    }
}
