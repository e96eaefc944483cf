//! Layered reconstruction parameters.
//!
//! Parameters are resolved from three kinds of layers, lowest precedence
//! first: built-in defaults, named presets (per instrument or objective,
//! applied in the order given), and per-run overrides. The merged result is
//! validated against a typed schema and frozen into a [`ParameterSet`] that
//! records which layer supplied each value.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown parameter `{param}` in {layer}")]
    UnknownParameter { param: String, layer: Provenance },
    #[error("missing required parameter `{param}`")]
    MissingRequired { param: &'static str },
    #[error("invalid value for `{param}` in {layer}: {reason}")]
    InvalidValue {
        param: String,
        layer: Provenance,
        reason: String,
    },
    #[error("failed to read preset file {}", .path.display())]
    PresetIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse preset file {}", .path.display())]
    PresetParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::UnknownParameter { .. } => "unknown-parameter",
            ConfigError::MissingRequired { .. } => "missing-required",
            ConfigError::InvalidValue { .. } => "invalid-value",
            ConfigError::PresetIo { .. } => "preset-io",
            ConfigError::PresetParse { .. } => "preset-parse",
        }
    }
}

/// Parameter names shared between the schema and the components that read
/// resolved values.
pub mod keys {
    pub const WAVELENGTH: &str = "wavelength";
    pub const ZSTEP: &str = "zstep";
    pub const NDIRS: &str = "ndirs";
    pub const NPHASES: &str = "nphases";
    pub const NA: &str = "na";
    pub const NIMM: &str = "nimm";
    pub const WIENER: &str = "wiener";
    pub const BACKGROUND: &str = "background";
    pub const ZOOMFACT: &str = "zoomfact";
    pub const OTF_RA: &str = "otf-ra";
    pub const APODIZATION: &str = "apodization";
    pub const K0_ANGLES: &str = "k0-angles";
}

/// A single typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
}
impl ParamValue {
    fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Float(_) => "float",
            ParamValue::Int(_) => "integer",
            ParamValue::Bool(_) => "boolean",
            ParamValue::Str(_) => "string",
        }
    }
    fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}
impl fmt::Display for ParamValue {
    /// Renders the value the way the engine's flat configuration expects,
    /// booleans as `1`/`0`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", if *v { 1 } else { 0 }),
            ParamValue::Str(v) => write!(f, "{}", v),
        }
    }
}
impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}
impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}
impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}
impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}
impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Float,
    Int,
    Bool,
    Str,
    Choice,
}
impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Float => write!(f, "float"),
            ParamKind::Int => write!(f, "integer"),
            ParamKind::Bool => write!(f, "boolean"),
            ParamKind::Str => write!(f, "string"),
            ParamKind::Choice => write!(f, "choice"),
        }
    }
}

/// Const-constructible default for a schema entry.
#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(&'static str),
}
impl DefaultValue {
    fn to_value(self) -> ParamValue {
        match self {
            DefaultValue::Float(v) => ParamValue::Float(v),
            DefaultValue::Int(v) => ParamValue::Int(v),
            DefaultValue::Bool(v) => ParamValue::Bool(v),
            DefaultValue::Str(v) => ParamValue::Str(v.to_string()),
        }
    }
}

/// Declaration of one reconstruction parameter.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    /// Inclusive bounds for numeric parameters
    pub range: Option<(f64, f64)>,
    pub choices: &'static [&'static str],
    /// Whether the parameter changes the shape of a generated OTF
    pub shapes_otf: bool,
    pub default: Option<DefaultValue>,
}

/// The full parameter schema. `wavelength` is the only parameter without a
/// built-in default; it has to come from a preset or an override.
pub const SCHEMA: &[ParamSpec] = &[
    ParamSpec {
        name: keys::WAVELENGTH,
        kind: ParamKind::Int,
        required: true,
        range: Some((300.0, 800.0)),
        choices: &[],
        shapes_otf: true,
        default: None,
    },
    ParamSpec {
        name: keys::ZSTEP,
        kind: ParamKind::Float,
        required: true,
        range: Some((0.01, 10.0)),
        choices: &[],
        shapes_otf: false,
        default: Some(DefaultValue::Float(0.125)),
    },
    ParamSpec {
        name: keys::NDIRS,
        kind: ParamKind::Int,
        required: true,
        range: Some((1.0, 9.0)),
        choices: &[],
        shapes_otf: false,
        default: Some(DefaultValue::Int(3)),
    },
    ParamSpec {
        name: keys::NPHASES,
        kind: ParamKind::Int,
        required: true,
        range: Some((3.0, 15.0)),
        choices: &[],
        shapes_otf: false,
        default: Some(DefaultValue::Int(5)),
    },
    ParamSpec {
        name: keys::NA,
        kind: ParamKind::Float,
        required: true,
        range: Some((0.1, 1.7)),
        choices: &[],
        shapes_otf: true,
        default: Some(DefaultValue::Float(1.4)),
    },
    ParamSpec {
        name: keys::NIMM,
        kind: ParamKind::Float,
        required: true,
        range: Some((1.0, 2.0)),
        choices: &[],
        shapes_otf: true,
        default: Some(DefaultValue::Float(1.515)),
    },
    ParamSpec {
        name: keys::WIENER,
        kind: ParamKind::Float,
        required: true,
        range: Some((1e-6, 1.0)),
        choices: &[],
        shapes_otf: false,
        default: Some(DefaultValue::Float(0.001)),
    },
    ParamSpec {
        name: keys::BACKGROUND,
        kind: ParamKind::Float,
        required: true,
        range: Some((0.0, 65535.0)),
        choices: &[],
        shapes_otf: false,
        default: Some(DefaultValue::Float(80.0)),
    },
    ParamSpec {
        name: keys::ZOOMFACT,
        kind: ParamKind::Float,
        required: true,
        range: Some((1.0, 8.0)),
        choices: &[],
        shapes_otf: false,
        default: Some(DefaultValue::Float(2.0)),
    },
    ParamSpec {
        name: keys::OTF_RA,
        kind: ParamKind::Bool,
        required: true,
        range: None,
        choices: &[],
        shapes_otf: true,
        default: Some(DefaultValue::Bool(true)),
    },
    ParamSpec {
        name: keys::APODIZATION,
        kind: ParamKind::Choice,
        required: true,
        range: None,
        choices: &["none", "cosine", "gauss"],
        shapes_otf: false,
        default: Some(DefaultValue::Str("cosine")),
    },
    ParamSpec {
        name: keys::K0_ANGLES,
        kind: ParamKind::Str,
        required: false,
        range: None,
        choices: &[],
        shapes_otf: false,
        default: None,
    },
];

fn spec_for(name: &str) -> Option<&'static ParamSpec> {
    SCHEMA.iter().find(|spec| spec.name == name)
}

/// Which layer a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Provenance {
    Default,
    Preset(String),
    Override,
}
impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Default => write!(f, "default"),
            Provenance::Preset(name) => write!(f, "preset:{}", name),
            Provenance::Override => write!(f, "override"),
        }
    }
}

/// A partial parameter mapping from one configuration source.
#[derive(Debug, Clone)]
pub struct Layer {
    provenance: Provenance,
    values: BTreeMap<String, ParamValue>,
}
impl Layer {
    pub fn preset(name: impl Into<String>) -> Self {
        Self {
            provenance: Provenance::Preset(name.into()),
            values: BTreeMap::new(),
        }
    }
    pub fn overrides() -> Self {
        Self {
            provenance: Provenance::Override,
            values: BTreeMap::new(),
        }
    }
    pub fn set(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Load a preset layer from a flat TOML table; the file stem becomes the
    /// preset name reported in provenance and error messages.
    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let text = fs::read_to_string(path).map_err(|source| ConfigError::PresetIo {
            path: path.to_path_buf(),
            source,
        })?;
        let table: toml::Table = text.parse().map_err(|source| ConfigError::PresetParse {
            path: path.to_path_buf(),
            source,
        })?;
        let provenance = Provenance::Preset(name);
        let mut values = BTreeMap::new();
        for (key, value) in table {
            let value = match value {
                toml::Value::Float(v) => ParamValue::Float(v),
                toml::Value::Integer(v) => ParamValue::Int(v),
                toml::Value::Boolean(v) => ParamValue::Bool(v),
                toml::Value::String(v) => ParamValue::Str(v),
                other => {
                    return Err(ConfigError::InvalidValue {
                        param: key,
                        layer: provenance,
                        reason: format!("unsupported TOML value type `{}`", other.type_str()),
                    })
                }
            };
            values.insert(key, value);
        }
        Ok(Self { provenance, values })
    }

    /// Parse a `key=value` assignment, as supplied on a command line.
    /// Values are read as boolean, integer, or float when they parse as
    /// such, and kept as text otherwise.
    pub fn parse_assignment(raw: &str) -> Result<(String, ParamValue), ConfigError> {
        let (key, value) = raw.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            param: raw.to_string(),
            layer: Provenance::Override,
            reason: "expected `key=value`".to_string(),
        })?;
        let key = key.trim().to_string();
        let value = value.trim();
        let value = if let Ok(v) = value.parse::<bool>() {
            ParamValue::Bool(v)
        } else if let Ok(v) = value.parse::<i64>() {
            ParamValue::Int(v)
        } else if let Ok(v) = value.parse::<f64>() {
            ParamValue::Float(v)
        } else {
            ParamValue::Str(value.to_string())
        };
        Ok((key, value))
    }
}

/// Ordered configuration layers, resolved into one [`ParameterSet`] per job.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    presets: Vec<Layer>,
    overrides: Option<Layer>,
}
impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn preset(mut self, layer: Layer) -> Self {
        self.presets.push(layer);
        self
    }
    pub fn preset_file(self, path: &Path) -> Result<Self, ConfigError> {
        let layer = Layer::from_toml_path(path)?;
        Ok(self.preset(layer))
    }
    pub fn overrides(mut self, layer: Layer) -> Self {
        self.overrides = Some(layer);
        self
    }

    /// Merge defaults, presets, and overrides into a validated snapshot.
    ///
    /// Unknown keys are rejected while each layer is applied, naming the
    /// layer they came from. Type, range, and choice validation runs on the
    /// merged result, so a layer's out-of-range value is only an error when
    /// it survives as the winning value.
    pub fn resolve(&self) -> Result<ParameterSet, ConfigError> {
        let mut values: BTreeMap<String, ParamValue> = BTreeMap::new();
        let mut provenance: BTreeMap<String, Provenance> = BTreeMap::new();
        for spec in SCHEMA {
            if let Some(default) = spec.default {
                values.insert(spec.name.to_string(), default.to_value());
                provenance.insert(spec.name.to_string(), Provenance::Default);
            }
        }

        for layer in self.presets.iter().chain(self.overrides.iter()) {
            for (key, value) in &layer.values {
                let spec = spec_for(key).ok_or_else(|| ConfigError::UnknownParameter {
                    param: key.clone(),
                    layer: layer.provenance.clone(),
                })?;
                let value = coerce(spec, value, &layer.provenance)?;
                values.insert(key.clone(), value);
                provenance.insert(key.clone(), layer.provenance.clone());
            }
        }

        for spec in SCHEMA {
            match values.get(spec.name) {
                Some(value) => validate(spec, value, &provenance[spec.name])?,
                None if spec.required => {
                    return Err(ConfigError::MissingRequired { param: spec.name })
                }
                None => {}
            }
        }

        Ok(ParameterSet { values, provenance })
    }
}

fn coerce(
    spec: &ParamSpec,
    value: &ParamValue,
    layer: &Provenance,
) -> Result<ParamValue, ConfigError> {
    match (spec.kind, value) {
        (ParamKind::Float, ParamValue::Float(_))
        | (ParamKind::Int, ParamValue::Int(_))
        | (ParamKind::Bool, ParamValue::Bool(_))
        | (ParamKind::Str, ParamValue::Str(_))
        | (ParamKind::Choice, ParamValue::Str(_)) => Ok(value.clone()),
        // TOML and command lines write `1` where a float is meant
        (ParamKind::Float, ParamValue::Int(v)) => Ok(ParamValue::Float(*v as f64)),
        _ => Err(ConfigError::InvalidValue {
            param: spec.name.to_string(),
            layer: layer.clone(),
            reason: format!("expected a {} value, got {}", spec.kind, value.type_name()),
        }),
    }
}

fn validate(spec: &ParamSpec, value: &ParamValue, layer: &Provenance) -> Result<(), ConfigError> {
    if let Some((lo, hi)) = spec.range {
        let v = value.as_f64().ok_or_else(|| ConfigError::InvalidValue {
            param: spec.name.to_string(),
            layer: layer.clone(),
            reason: format!("expected a {} value, got {}", spec.kind, value.type_name()),
        })?;
        if v < lo || v > hi {
            return Err(ConfigError::InvalidValue {
                param: spec.name.to_string(),
                layer: layer.clone(),
                reason: format!("{} is outside [{}, {}]", value, lo, hi),
            });
        }
    }
    if spec.kind == ParamKind::Choice {
        let ParamValue::Str(text) = value else {
            return Err(ConfigError::InvalidValue {
                param: spec.name.to_string(),
                layer: layer.clone(),
                reason: format!("expected one of {:?}", spec.choices),
            });
        };
        if !spec.choices.contains(&text.as_str()) {
            return Err(ConfigError::InvalidValue {
                param: spec.name.to_string(),
                layer: layer.clone(),
                reason: format!("`{}` is not one of {:?}", text, spec.choices),
            });
        }
    }
    Ok(())
}

/// An immutable, validated parameter snapshot with per-key provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSet {
    values: BTreeMap<String, ParamValue>,
    provenance: BTreeMap<String, Provenance>,
}
impl ParameterSet {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }
    pub fn float(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(ParamValue::as_f64)
    }
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }
    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ParamValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }
    /// Emission wavelength in nm; present in every resolved set.
    pub fn wavelength(&self) -> u32 {
        self.int(keys::WAVELENGTH)
            .expect("wavelength is validated as required at resolution") as u32
    }
    pub fn provenance(&self, name: &str) -> Option<&Provenance> {
        self.provenance.get(name)
    }
    pub fn provenance_map(&self) -> &BTreeMap<String, Provenance> {
        &self.provenance
    }
    /// Provenance rendered as plain labels for reporting.
    pub fn provenance_labels(&self) -> BTreeMap<String, String> {
        self.provenance
            .iter()
            .map(|(key, layer)| (key.clone(), layer.to_string()))
            .collect()
    }
    /// The parameters that change the shape of a generated OTF, in schema
    /// order with rendered values. Part of the OTF cache key.
    pub fn otf_fields(&self) -> Vec<(&'static str, String)> {
        SCHEMA
            .iter()
            .filter(|spec| spec.shapes_otf)
            .filter_map(|spec| {
                self.values
                    .get(spec.name)
                    .map(|value| (spec.name, value.to_string()))
            })
            .collect()
    }
    /// The flat `key=value` representation the engine consumes, ordered by
    /// key so identical parameter sets serialize identically.
    pub fn engine_config(&self) -> String {
        let mut text = String::new();
        for (key, value) in &self.values {
            text.push_str(key);
            text.push('=');
            text.push_str(&value.to_string());
            text.push('\n');
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal() -> ConfigStore {
        ConfigStore::new().preset(Layer::preset("imaging").set(keys::WAVELENGTH, 488i64))
    }

    #[test]
    fn defaults_fill_unset_parameters() {
        let params = minimal().resolve().unwrap();
        assert_eq!(params.int(keys::NDIRS), Some(3));
        assert_eq!(params.int(keys::NPHASES), Some(5));
        assert_eq!(params.float(keys::ZSTEP), Some(0.125));
        assert_eq!(params.flag(keys::OTF_RA), Some(true));
        assert_eq!(params.text(keys::APODIZATION), Some("cosine"));
        assert_eq!(params.provenance(keys::NDIRS), Some(&Provenance::Default));
    }

    #[test]
    fn wavelength_has_no_default() {
        let err = ConfigStore::new().resolve().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingRequired { param: "wavelength" }
        ));
    }

    #[test]
    fn later_layers_win() {
        let params = ConfigStore::new()
            .preset(
                Layer::preset("scope-a")
                    .set(keys::WAVELENGTH, 488i64)
                    .set(keys::NA, 1.2),
            )
            .preset(Layer::preset("scope-b").set(keys::NA, 1.35))
            .overrides(Layer::overrides().set(keys::ZSTEP, 0.2))
            .resolve()
            .unwrap();
        assert_eq!(params.float(keys::NA), Some(1.35));
        assert_eq!(params.float(keys::ZSTEP), Some(0.2));
        assert_eq!(
            params.provenance(keys::NA),
            Some(&Provenance::Preset("scope-b".to_string()))
        );
        assert_eq!(params.provenance(keys::ZSTEP), Some(&Provenance::Override));
    }

    #[test]
    fn resolution_is_deterministic() {
        let store = ConfigStore::new()
            .preset(
                Layer::preset("imaging")
                    .set(keys::WAVELENGTH, 488i64)
                    .set(keys::WIENER, 0.002),
            )
            .overrides(Layer::overrides().set(keys::BACKGROUND, 95.0));
        let first = store.resolve().unwrap();
        let second = store.resolve().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.engine_config(), second.engine_config());
    }

    #[test]
    fn unknown_parameter_names_its_layer() {
        let err = minimal()
            .preset(Layer::preset("typo").set("wavelen", 488i64))
            .resolve()
            .unwrap_err();
        match err {
            ConfigError::UnknownParameter { param, layer } => {
                assert_eq!(param, "wavelen");
                assert_eq!(layer, Provenance::Preset("typo".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn out_of_range_value_names_its_layer() {
        let err = minimal()
            .preset(Layer::preset("bad-optics").set(keys::NA, 5.0))
            .resolve()
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { param, layer, .. } => {
                assert_eq!(param, "na");
                assert_eq!(layer, Provenance::Preset("bad-optics".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn override_can_repair_a_preset_value() {
        // validation applies to winning values only
        let params = minimal()
            .preset(Layer::preset("bad-optics").set(keys::NA, 5.0))
            .overrides(Layer::overrides().set(keys::NA, 1.4))
            .resolve()
            .unwrap();
        assert_eq!(params.float(keys::NA), Some(1.4));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let err = minimal()
            .overrides(Layer::overrides().set(keys::ZSTEP, "thin"))
            .resolve()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn integers_widen_to_float_parameters() {
        let params = minimal()
            .overrides(Layer::overrides().set(keys::BACKGROUND, 100i64))
            .resolve()
            .unwrap();
        assert_eq!(params.float(keys::BACKGROUND), Some(100.0));
    }

    #[test]
    fn choice_values_are_checked() {
        let err = minimal()
            .overrides(Layer::overrides().set(keys::APODIZATION, "linear"))
            .resolve()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let params = minimal()
            .overrides(Layer::overrides().set(keys::APODIZATION, "gauss"))
            .resolve()
            .unwrap();
        assert_eq!(params.text(keys::APODIZATION), Some("gauss"));
    }

    #[test]
    fn optional_parameters_may_stay_unset() {
        let params = minimal().resolve().unwrap();
        assert_eq!(params.text(keys::K0_ANGLES), None);
        assert!(!params.engine_config().contains("k0-angles"));
    }

    #[test]
    fn preset_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("60x-oil.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "wavelength = 561").unwrap();
        writeln!(file, "na = 1.42").unwrap();
        writeln!(file, "otf-ra = false").unwrap();
        drop(file);

        let params = ConfigStore::new()
            .preset_file(&path)
            .unwrap()
            .resolve()
            .unwrap();
        assert_eq!(params.wavelength(), 561);
        assert_eq!(params.float(keys::NA), Some(1.42));
        assert_eq!(params.flag(keys::OTF_RA), Some(false));
        assert_eq!(
            params.provenance(keys::NA),
            Some(&Provenance::Preset("60x-oil".to_string()))
        );
    }

    #[test]
    fn preset_file_with_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.toml");
        fs::write(&path, "wavelength = 488\nlaser_power = 20\n").unwrap();

        let err = ConfigStore::new()
            .preset_file(&path)
            .unwrap()
            .resolve()
            .unwrap_err();
        match err {
            ConfigError::UnknownParameter { param, layer } => {
                assert_eq!(param, "laser_power");
                assert_eq!(layer, Provenance::Preset("stale".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn assignments_parse_by_shape() {
        let (key, value) = Layer::parse_assignment("wiener=0.005").unwrap();
        assert_eq!(key, "wiener");
        assert_eq!(value, ParamValue::Float(0.005));

        let (_, value) = Layer::parse_assignment("wavelength=488").unwrap();
        assert_eq!(value, ParamValue::Int(488));

        let (_, value) = Layer::parse_assignment("otf-ra=false").unwrap();
        assert_eq!(value, ParamValue::Bool(false));

        let (_, value) = Layer::parse_assignment("k0-angles=0.8,2.9,-1.2").unwrap();
        assert_eq!(value, ParamValue::Str("0.8,2.9,-1.2".to_string()));

        assert!(Layer::parse_assignment("wiener").is_err());
    }

    #[test]
    fn engine_config_is_flat_and_ordered() {
        let params = minimal()
            .overrides(Layer::overrides().set(keys::ZSTEP, 0.2))
            .resolve()
            .unwrap();
        let text = params.engine_config();
        let lines: Vec<_> = text.lines().collect();
        let mut sorted = lines.clone();
        sorted.sort_unstable();
        assert_eq!(lines, sorted);
        assert!(text.contains("wavelength=488\n"));
        assert!(text.contains("zstep=0.2\n"));
        assert!(text.contains("otf-ra=1\n"));
    }

    #[test]
    fn otf_fields_track_optics_parameters() {
        let base = minimal().resolve().unwrap();
        let tweaked = minimal()
            .overrides(Layer::overrides().set(keys::NA, 1.2))
            .resolve()
            .unwrap();
        assert_ne!(base.otf_fields(), tweaked.otf_fields());

        let unrelated = minimal()
            .overrides(Layer::overrides().set(keys::WIENER, 0.01))
            .resolve()
            .unwrap();
        assert_eq!(base.otf_fields(), unrelated.otf_fields());
    }
}
