//! Encryption configuration: per-tensor directives plus global backend
//! parameters, frozen into an immutable [`EncryptionConfig`].
//!
//! Directive precedence when several rules hit one tensor:
//!
//! ```text
//! ClientProvided  >  Encrypt  >  Packed  >  Plain
//! ```
//!
//! Global flags (`enable_client`, `encrypt_server_data`, `pack_data`) only
//! affect tensors registered with [`EncryptionConfigBuilder::input_tensor`].
//! Tensors nobody mentions resolve to [`TensorDirective::Plain`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::layout::{PackingFactor, ScoreLayout};
use crate::params::{EncryptionParameters, ParameterError, ParameterSource, SCHEME_HE_SEAL};

/// Keys of the parameter map that are not tensor names.
pub const RESERVED_KEYS: [&str; 7] = [
    "backend",
    "device_id",
    "encryption_parameters",
    "enable_client",
    "encrypt_server_data",
    "complex_packing",
    "pack_data",
];

/// What the remote engine does with a named tensor.
///
/// Variant order is precedence order: `max` picks the winner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TensorDirective {
    #[default]
    Plain,
    Packed,
    Encrypt,
    #[serde(rename = "client_input")]
    ClientProvided,
}

impl TensorDirective {
    pub fn as_str(self) -> &'static str {
        match self {
            TensorDirective::Plain => "plain",
            TensorDirective::Packed => "packed",
            TensorDirective::Encrypt => "encrypt",
            TensorDirective::ClientProvided => "client_input",
        }
    }
}

impl fmt::Display for TensorDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TensorDirective {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(TensorDirective::Plain),
            "packed" => Ok(TensorDirective::Packed),
            "encrypt" => Ok(TensorDirective::Encrypt),
            "client_input" => Ok(TensorDirective::ClientProvided),
            other => Err(format!("unknown tensor directive '{other}'")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("enable_client and encrypt_server_data are mutually exclusive")]
    ConflictingDirectives,
    #[error(transparent)]
    Parameters(#[from] ParameterError),
    #[error("invalid boolean for {name}: '{value}' (expected one of 1/on/y/yes/true or 0/off/n/no/false)")]
    InvalidFlag { name: String, value: String },
    #[error("tensor name '{0}' collides with a reserved configuration key")]
    ReservedName(String),
    #[error("tensor name must not be empty")]
    EmptyTensorName,
    #[error("parameter map is missing '{0}'")]
    MissingKey(String),
    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidEntry {
        key: String,
        value: String,
        reason: String,
    },
}

/// Parse a boolean flag value, case-insensitively.
pub fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "y" | "yes" | "true" => Ok(true),
        "0" | "off" | "n" | "no" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

fn render_flag(value: bool) -> String {
    let rendered = if value { "True" } else { "False" };
    rendered.to_string()
}

/// Frozen encryption configuration. Build with [`EncryptionConfigBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionConfig {
    backend: String,
    device_id: String,
    source: ParameterSource,
    parameters: EncryptionParameters,
    parameters_json: String,
    enable_client: bool,
    encrypt_server_data: bool,
    pack_data: bool,
    complex_packing: bool,
    result_layout: ScoreLayout,
    directives: BTreeMap<String, TensorDirective>,
}

impl EncryptionConfig {
    pub fn builder() -> EncryptionConfigBuilder {
        EncryptionConfigBuilder::new()
    }

    /// Directive for `name`; unknown tensors are plain.
    pub fn directive(&self, name: &str) -> TensorDirective {
        self.directives.get(name).copied().unwrap_or_default()
    }

    pub fn directives(&self) -> &BTreeMap<String, TensorDirective> {
        &self.directives
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn parameter_source(&self) -> &ParameterSource {
        &self.source
    }

    pub fn parameters(&self) -> &EncryptionParameters {
        &self.parameters
    }

    pub fn enable_client(&self) -> bool {
        self.enable_client
    }

    pub fn encrypt_server_data(&self) -> bool {
        self.encrypt_server_data
    }

    pub fn pack_data(&self) -> bool {
        self.pack_data
    }

    pub fn complex_packing(&self) -> bool {
        self.complex_packing
    }

    pub fn result_layout(&self) -> ScoreLayout {
        self.result_layout
    }

    pub fn packing_factor(&self) -> PackingFactor {
        if self.complex_packing {
            PackingFactor::Two
        } else {
            PackingFactor::One
        }
    }

    /// Slots available per ciphertext under the loaded parameters.
    pub fn slot_capacity(&self) -> usize {
        self.parameters.slot_capacity()
    }

    /// Flat string map sent to the engine: one entry per tensor directive
    /// plus the reserved keys. `encryption_parameters` carries the resolved
    /// parameters as JSON.
    pub fn to_parameter_map(&self) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = self
            .directives
            .iter()
            .map(|(name, directive)| (name.clone(), directive.as_str().to_string()))
            .collect();
        map.insert("backend".into(), self.backend.clone());
        map.insert("device_id".into(), self.device_id.clone());
        map.insert("encryption_parameters".into(), self.parameters_json.clone());
        map.insert("enable_client".into(), render_flag(self.enable_client));
        map.insert(
            "encrypt_server_data".into(),
            render_flag(self.encrypt_server_data),
        );
        map.insert("complex_packing".into(), render_flag(self.complex_packing));
        map.insert("pack_data".into(), render_flag(self.pack_data));
        map
    }

    /// Rebuild a config from a parameter map, as the engine side does.
    pub fn from_parameter_map(map: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            map.get(key)
                .map(String::as_str)
                .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
        };
        let mut builder = EncryptionConfigBuilder::new()
            .backend(get("backend")?)
            .device_id(get("device_id")?)
            .encryption_parameters(ParameterSource::parse(get("encryption_parameters")?))
            .enable_client(parse_flag("enable_client", get("enable_client")?)?)
            .encrypt_server_data(parse_flag(
                "encrypt_server_data",
                get("encrypt_server_data")?,
            )?)
            .complex_packing(parse_flag("complex_packing", get("complex_packing")?)?)
            .pack_data(parse_flag("pack_data", get("pack_data")?)?);
        for (name, value) in map {
            if RESERVED_KEYS.contains(&name.as_str()) {
                continue;
            }
            let directive: TensorDirective =
                value.parse().map_err(|reason| ConfigError::InvalidEntry {
                    key: name.clone(),
                    value: value.clone(),
                    reason,
                })?;
            builder = builder.rule(name, directive);
        }
        builder.build()
    }
}

/// Builder for [`EncryptionConfig`]. All setters consume and return `self`.
#[derive(Debug, Clone)]
pub struct EncryptionConfigBuilder {
    backend: String,
    device_id: String,
    source: ParameterSource,
    enable_client: bool,
    encrypt_server_data: bool,
    pack_data: bool,
    complex_packing: bool,
    result_layout: ScoreLayout,
    inputs: BTreeSet<String>,
    rules: Vec<(String, TensorDirective)>,
}

impl Default for EncryptionConfigBuilder {
    fn default() -> Self {
        Self {
            backend: SCHEME_HE_SEAL.to_string(),
            device_id: String::new(),
            source: ParameterSource::Default,
            enable_client: false,
            encrypt_server_data: false,
            pack_data: false,
            complex_packing: false,
            result_layout: ScoreLayout::default(),
            inputs: BTreeSet::new(),
            rules: Vec::new(),
        }
    }
}

impl EncryptionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a builder from the process environment.
    ///
    /// | variable           | setting                       |
    /// |--------------------|-------------------------------|
    /// | `HE_BACKEND`       | backend name                  |
    /// | `HE_SEAL_CONFIG`   | encryption parameter source   |
    /// | `HE_ENABLE_CLIENT` | `enable_client` flag          |
    /// | `HE_ENCRYPT_DATA`  | `encrypt_server_data` flag    |
    /// | `HE_BATCH_DATA`    | `pack_data` flag              |
    /// | `HE_COMPLEX_PACK`  | `complex_packing` flag        |
    ///
    /// The environment is read once, here; the built config never looks at
    /// it again.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Self::from_env`] with an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| -> Result<bool, ConfigError> {
            match lookup(key) {
                Some(value) => parse_flag(key, &value),
                None => Ok(false),
            }
        };
        let mut builder = Self::new()
            .enable_client(flag("HE_ENABLE_CLIENT")?)
            .encrypt_server_data(flag("HE_ENCRYPT_DATA")?)
            .pack_data(flag("HE_BATCH_DATA")?)
            .complex_packing(flag("HE_COMPLEX_PACK")?);
        if let Some(backend) = lookup("HE_BACKEND").filter(|b| !b.trim().is_empty()) {
            builder = builder.backend(backend.trim());
        }
        if let Some(source) = lookup("HE_SEAL_CONFIG") {
            builder = builder.encryption_parameters(ParameterSource::parse(&source));
        }
        Ok(builder)
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn encryption_parameters(mut self, source: ParameterSource) -> Self {
        self.source = source;
        self
    }

    pub fn enable_client(mut self, on: bool) -> Self {
        self.enable_client = on;
        self
    }

    pub fn encrypt_server_data(mut self, on: bool) -> Self {
        self.encrypt_server_data = on;
        self
    }

    pub fn pack_data(mut self, on: bool) -> Self {
        self.pack_data = on;
        self
    }

    pub fn complex_packing(mut self, on: bool) -> Self {
        self.complex_packing = on;
        self
    }

    pub fn result_layout(mut self, layout: ScoreLayout) -> Self {
        self.result_layout = layout;
        self
    }

    /// Mark `name` as an input affected by the global flags.
    pub fn input_tensor(mut self, name: impl Into<String>) -> Self {
        self.inputs.insert(name.into());
        self
    }

    pub fn plain(self, name: impl Into<String>) -> Self {
        self.rule(name, TensorDirective::Plain)
    }

    pub fn packed(self, name: impl Into<String>) -> Self {
        self.rule(name, TensorDirective::Packed)
    }

    pub fn encrypt(self, name: impl Into<String>) -> Self {
        self.rule(name, TensorDirective::Encrypt)
    }

    pub fn client_input(self, name: impl Into<String>) -> Self {
        self.rule(name, TensorDirective::ClientProvided)
    }

    /// Add an explicit rule. Rules for one name accumulate.
    pub fn rule(mut self, name: impl Into<String>, directive: TensorDirective) -> Self {
        self.rules.push((name.into(), directive));
        self
    }

    /// Validate, load parameters and freeze the directive map.
    pub fn build(self) -> Result<EncryptionConfig, ConfigError> {
        if self.enable_client && self.encrypt_server_data {
            return Err(ConfigError::ConflictingDirectives);
        }
        let names = self
            .inputs
            .iter()
            .map(String::as_str)
            .chain(self.rules.iter().map(|(name, _)| name.as_str()));
        for name in names {
            if name.is_empty() {
                return Err(ConfigError::EmptyTensorName);
            }
            if RESERVED_KEYS.contains(&name) {
                return Err(ConfigError::ReservedName(name.to_string()));
            }
        }

        let parameters = EncryptionParameters::load(&self.source)?;
        let parameters_json = parameters.to_json()?;
        let complex_packing = self.complex_packing || parameters.complex_packing;

        let mut directives: BTreeMap<String, TensorDirective> = BTreeMap::new();
        for name in &self.inputs {
            let global = if self.enable_client {
                TensorDirective::ClientProvided
            } else if self.encrypt_server_data {
                TensorDirective::Encrypt
            } else if self.pack_data {
                TensorDirective::Packed
            } else {
                TensorDirective::Plain
            };
            directives.insert(name.clone(), global);
        }
        for (name, directive) in self.rules {
            let entry = directives.entry(name).or_default();
            *entry = (*entry).max(directive);
        }

        info!(
            backend = %self.backend,
            parameters = %self.source,
            enable_client = self.enable_client,
            encrypt_server_data = self.encrypt_server_data,
            pack_data = self.pack_data,
            complex_packing,
            tensors = directives.len(),
            "encryption config built"
        );

        Ok(EncryptionConfig {
            backend: self.backend,
            device_id: self.device_id,
            source: self.source,
            parameters,
            parameters_json,
            enable_client: self.enable_client,
            encrypt_server_data: self.encrypt_server_data,
            pack_data: self.pack_data,
            complex_packing,
            result_layout: self.result_layout,
            directives,
        })
    }

    /// [`Self::build`], wrapped for sharing across clients.
    pub fn build_shared(self) -> Result<Arc<EncryptionConfig>, ConfigError> {
        self.build().map(Arc::new)
    }
}
