//! Register map: named data points of the controller
//!
//! Definitions are authored as a flat YAML table (see `lambdatronic.yaml`)
//! and converted once, at load time, into typed [`DataPoint`]s whose
//! [`PointKind`] carries only the fields that kind needs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Built-in catalog for the Froeling Lambdatronic controller
const LAMBDATRONIC_MAP: &str = include_str!("lambdatronic.yaml");

const DISCRETE_INPUT_BASE: u32 = 10001;
const INPUT_REGISTER_BASE: u32 = 30001;
const HOLDING_REGISTER_BASE: u32 = 40001;
const HOLDING_BAND_END: u32 = 50000;

/// Raw value some fault tables use for "nothing to report"
pub const NONE_SENTINEL: u16 = 0xFFFF;

#[derive(Debug, thiserror::Error)]
pub enum RegisterMapError {
    #[error("data point `{id}`: {reason}")]
    InvalidDefinition { id: String, reason: String },
    #[error("duplicate data point id `{0}`")]
    DuplicateId(String),
    #[error("data point `{id}` references unknown enum table `{table}`")]
    UnknownTable { id: String, table: String },
    #[error("data point `{id}` derives from unknown or non-numeric point `{source_id}`")]
    UnknownSource { id: String, source_id: String },
    #[error("failed to parse register map: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to read register map: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(id: &str, reason: impl Into<String>) -> RegisterMapError {
    RegisterMapError::InvalidDefinition {
        id: id.to_string(),
        reason: reason.into(),
    }
}

/// Modbus address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSpace {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl AddressSpace {
    /// True for the 16-bit register spaces
    pub fn is_register(self) -> bool {
        matches!(self, Self::InputRegister | Self::HoldingRegister)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coil => "coil",
            Self::DiscreteInput => "discrete_input",
            Self::InputRegister => "input",
            Self::HoldingRegister => "holding",
        }
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published (documentation) address and its on-the-wire offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub space: AddressSpace,
    /// Number as printed in the controller's register table
    pub number: u32,
    wire: u16,
}

impl Address {
    /// Convert a published number into a wire address.
    ///
    /// Input registers are rebased from 30001 and holding registers from
    /// 40001. Discrete inputs published in the 10001+ band are rebased,
    /// lower numbers and coils are sent as-is.
    pub fn new(space: AddressSpace, number: u32) -> Result<Self, String> {
        let wire = match space {
            AddressSpace::Coil => number,
            AddressSpace::DiscreteInput if number >= DISCRETE_INPUT_BASE => {
                number - DISCRETE_INPUT_BASE
            }
            AddressSpace::DiscreteInput => number,
            AddressSpace::InputRegister => number
                .checked_sub(INPUT_REGISTER_BASE)
                .ok_or_else(|| format!("input register {} is below {}", number, INPUT_REGISTER_BASE))?,
            AddressSpace::HoldingRegister => number.checked_sub(HOLDING_REGISTER_BASE).ok_or_else(
                || format!("holding register {} is below {}", number, HOLDING_REGISTER_BASE),
            )?,
        };
        let wire = u16::try_from(wire)
            .map_err(|_| format!("{} address {} is out of the 16-bit range", space, number))?;

        Ok(Self {
            space,
            number,
            wire,
        })
    }

    /// Zero-based address sent in the Modbus PDU
    pub fn wire(&self) -> u16 {
        self.wire
    }
}

/// Scaling rules of a numeric register
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumberFormat {
    /// Divisor applied to the raw integer
    pub scaling: f64,
    /// Decimal places kept after scaling
    pub decimals: u8,
    /// Reinterpret words above 32767 as negative
    pub signed: bool,
}

impl Default for NumberFormat {
    fn default() -> Self {
        Self {
            scaling: 1.0,
            decimals: 0,
            signed: true,
        }
    }
}

/// Accepted range of a writable number
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub min: f64,
    pub max: f64,
}

/// Raw value to label lookup
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnumTable {
    pub values: BTreeMap<u16, String>,
    /// Label for [`NONE_SENTINEL`], when the table gives it a meaning
    #[serde(default)]
    pub none_label: Option<String>,
}

/// Where an enum's labels come from
#[derive(Debug, Clone, PartialEq)]
pub enum EnumLabels {
    /// Read-only lookup table
    Table(Arc<EnumTable>),
    /// Ordered options; the raw value is the option index. Writable.
    Options(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PointKind {
    /// A coil or discrete input bit
    Boolean { address: Address },
    /// A scaled 16-bit register, writable when `limits` is set
    Number {
        address: Address,
        format: NumberFormat,
        limits: Option<Limits>,
    },
    /// A register mapped to a label
    Enum { address: Address, labels: EnumLabels },
    /// "On" while the referenced number is above zero; reads nothing itself
    BitDerived { source: String },
}

/// Immutable definition of one named data point
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub id: String,
    pub category: String,
    pub unit: Option<String>,
    pub kind: PointKind,
}

impl DataPoint {
    /// The single address read for this point; `None` for derived points
    pub fn address(&self) -> Option<Address> {
        match &self.kind {
            PointKind::Boolean { address }
            | PointKind::Number { address, .. }
            | PointKind::Enum { address, .. } => Some(*address),
            PointKind::BitDerived { .. } => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self.kind,
            PointKind::Number {
                limits: Some(_),
                ..
            } | PointKind::Enum {
                labels: EnumLabels::Options(_),
                ..
            }
        )
    }

    /// Id of the point this one derives its value from
    pub fn source(&self) -> Option<&str> {
        match &self.kind {
            PointKind::BitDerived { source } => Some(source),
            _ => None,
        }
    }

    fn from_spec(
        spec: DataPointSpec,
        tables: &HashMap<String, Arc<EnumTable>>,
    ) -> Result<Self, RegisterMapError> {
        let id = spec.id.as_str();
        let address_count = [spec.coil, spec.discrete_input, spec.register]
            .iter()
            .filter(|a| a.is_some())
            .count();

        if spec.kind == KindSpec::BitDerivedBoolean {
            if address_count != 0 {
                return Err(invalid(id, "a derived boolean must not have an address"));
            }
            if spec.writable {
                return Err(invalid(id, "a derived boolean cannot be writable"));
            }
            let source = spec
                .source
                .clone()
                .ok_or_else(|| invalid(id, "a derived boolean needs a `source`"))?;
            return Ok(Self::build(spec, PointKind::BitDerived { source }));
        }

        if address_count != 1 {
            return Err(invalid(
                id,
                "exactly one of `coil`, `discrete_input` or `register` is required",
            ));
        }
        if spec.source.is_some() {
            return Err(invalid(id, "`source` is only valid for derived booleans"));
        }

        let kind = match spec.kind {
            KindSpec::Boolean => {
                if spec.writable {
                    return Err(invalid(id, "bit points are read-only"));
                }
                let address = match (spec.coil, spec.discrete_input) {
                    (Some(coil), _) => Address::new(AddressSpace::Coil, coil),
                    (_, Some(input)) => Address::new(AddressSpace::DiscreteInput, input),
                    _ => return Err(invalid(id, "a boolean needs a `coil` or `discrete_input`")),
                }
                .map_err(|reason| invalid(id, reason))?;
                PointKind::Boolean { address }
            }
            KindSpec::Number => {
                let address = spec.register_address()?;
                let defaults = NumberFormat::default();
                let format = NumberFormat {
                    scaling: spec.scaling.unwrap_or(defaults.scaling),
                    decimals: spec.decimals.unwrap_or(defaults.decimals),
                    signed: spec.signed.unwrap_or(defaults.signed),
                };
                if format.scaling == 0.0 {
                    warn!("Data point {} has scaling 0 and will always read as absent", id);
                }
                let limits = if spec.writable {
                    match (spec.min, spec.max) {
                        (Some(min), Some(max)) if min <= max => Some(Limits { min, max }),
                        (Some(_), Some(_)) => return Err(invalid(id, "`min` exceeds `max`")),
                        _ => return Err(invalid(id, "a writable number needs `min` and `max`")),
                    }
                } else {
                    None
                };
                PointKind::Number {
                    address,
                    format,
                    limits,
                }
            }
            KindSpec::Enum => {
                let address = spec.register_address()?;
                if spec.signed == Some(true) {
                    return Err(invalid(id, "enum registers are never signed"));
                }
                let labels = match (&spec.options, &spec.table) {
                    (Some(options), _) if !options.is_empty() && spec.writable => {
                        EnumLabels::Options(options.clone())
                    }
                    // read-only options are just a table indexed from zero
                    (Some(options), _) if !options.is_empty() => {
                        EnumLabels::Table(Arc::new(EnumTable {
                            values: (0u16..).zip(options.iter().cloned()).collect(),
                            none_label: None,
                        }))
                    }
                    _ if spec.writable => {
                        return Err(invalid(id, "a writable enum needs `options`"))
                    }
                    (_, Some(table)) => EnumLabels::Table(
                        tables
                            .get(table)
                            .cloned()
                            .ok_or_else(|| RegisterMapError::UnknownTable {
                                id: id.to_string(),
                                table: table.clone(),
                            })?,
                    ),
                    _ => return Err(invalid(id, "an enum needs a `table` or `options`")),
                };
                PointKind::Enum { address, labels }
            }
            KindSpec::BitDerivedBoolean => unreachable!("handled above"),
        };

        Ok(Self::build(spec, kind))
    }

    fn build(spec: DataPointSpec, kind: PointKind) -> Self {
        Self {
            id: spec.id,
            category: spec.category.unwrap_or_else(|| "general".to_string()),
            unit: spec.unit,
            kind,
        }
    }
}

/// Kind tag of a definition in the YAML map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindSpec {
    Boolean,
    Number,
    Enum,
    BitDerivedBoolean,
}

/// Explicit register space tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Input,
    Holding,
}

/// One entry of the YAML map, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPointSpec {
    pub id: String,
    #[serde(default)]
    pub category: Option<String>,
    pub kind: KindSpec,
    #[serde(default)]
    pub coil: Option<u32>,
    #[serde(default)]
    pub discrete_input: Option<u32>,
    #[serde(default)]
    pub register: Option<u32>,
    #[serde(default)]
    pub register_type: Option<RegisterType>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub scaling: Option<f64>,
    #[serde(default)]
    pub decimals: Option<u8>,
    #[serde(default)]
    pub signed: Option<bool>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub source: Option<String>,
}

impl DataPointSpec {
    /// Resolve the register space: an explicit tag wins, writable points
    /// are holding, then the 40001 band, otherwise input.
    fn register_space(&self, number: u32) -> Result<AddressSpace, RegisterMapError> {
        match self.register_type {
            Some(RegisterType::Holding) => Ok(AddressSpace::HoldingRegister),
            Some(RegisterType::Input) if self.writable => Err(invalid(
                &self.id,
                "input registers cannot be written; tag it `holding`",
            )),
            Some(RegisterType::Input) => Ok(AddressSpace::InputRegister),
            None if self.writable
                || (HOLDING_REGISTER_BASE..HOLDING_BAND_END).contains(&number) =>
            {
                Ok(AddressSpace::HoldingRegister)
            }
            None => Ok(AddressSpace::InputRegister),
        }
    }

    fn register_address(&self) -> Result<Address, RegisterMapError> {
        let number = self
            .register
            .ok_or_else(|| invalid(&self.id, "a `register` is required"))?;
        let space = self.register_space(number)?;
        Address::new(space, number).map_err(|reason| invalid(&self.id, reason))
    }
}

/// On-disk layout of a register map file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterMapSpec {
    #[serde(default)]
    pub tables: HashMap<String, EnumTable>,
    pub points: Vec<DataPointSpec>,
}

/// Validated, immutable set of data points
#[derive(Debug, Clone)]
pub struct RegisterMap {
    points: Vec<Arc<DataPoint>>,
    index: HashMap<String, usize>,
}

impl RegisterMap {
    /// The embedded Lambdatronic catalog
    pub fn builtin() -> Result<Self, RegisterMapError> {
        Self::from_yaml(LAMBDATRONIC_MAP)
    }

    /// Load a map file, or the built-in catalog when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, RegisterMapError> {
        match path {
            Some(path) => {
                debug!("Loading register map from {}", path.display());
                Self::from_yaml(&std::fs::read_to_string(path)?)
            }
            None => Self::builtin(),
        }
    }

    pub fn from_yaml(source: &str) -> Result<Self, RegisterMapError> {
        let spec: RegisterMapSpec = serde_yaml::from_str(source)?;
        Self::from_spec(spec)
    }

    pub fn from_spec(spec: RegisterMapSpec) -> Result<Self, RegisterMapError> {
        let tables: HashMap<String, Arc<EnumTable>> = spec
            .tables
            .into_iter()
            .map(|(name, table)| (name, Arc::new(table)))
            .collect();

        let mut points = Vec::with_capacity(spec.points.len());
        let mut index = HashMap::with_capacity(spec.points.len());
        for point_spec in spec.points {
            let point = DataPoint::from_spec(point_spec, &tables)?;
            if index.insert(point.id.clone(), points.len()).is_some() {
                return Err(RegisterMapError::DuplicateId(point.id));
            }
            points.push(Arc::new(point));
        }

        let map = Self { points, index };
        map.check_sources()?;
        Ok(map)
    }

    fn check_sources(&self) -> Result<(), RegisterMapError> {
        for point in &self.points {
            if let Some(source) = point.source() {
                let numeric = matches!(
                    self.get(source).map(|p| &p.kind),
                    Some(PointKind::Number { .. })
                );
                if !numeric {
                    return Err(RegisterMapError::UnknownSource {
                        id: point.id.clone(),
                        source_id: source.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<DataPoint>> {
        self.index.get(id).map(|&i| &self.points[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DataPoint>> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Data points that derive their value from `source`
    pub fn dependents<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Arc<DataPoint>> {
        self.points
            .iter()
            .filter(move |p| p.source() == Some(source))
    }

    /// Resolve the enabled set: `ids` plus every point in `categories`.
    ///
    /// Both empty selects the whole map. Unknown ids are skipped. Sources
    /// of derived points are pulled in so they are read in the same cycle.
    /// The result keeps map order.
    pub fn select(&self, ids: &[String], categories: &[String]) -> Vec<Arc<DataPoint>> {
        if ids.is_empty() && categories.is_empty() {
            return self.points.clone();
        }

        let mut wanted: BTreeSet<usize> = BTreeSet::new();
        for id in ids {
            match self.index.get(id) {
                Some(&i) => {
                    wanted.insert(i);
                }
                None => warn!("Ignoring unknown data point {}", id),
            }
        }
        for (i, point) in self.points.iter().enumerate() {
            if categories.iter().any(|c| *c == point.category) {
                wanted.insert(i);
            }
        }

        let sources: Vec<usize> = wanted
            .iter()
            .filter_map(|&i| self.points[i].source())
            .filter_map(|source| self.index.get(source).copied())
            .collect();
        for i in sources {
            if wanted.insert(i) {
                debug!(
                    "Reading {} as the source of a derived data point",
                    self.points[i].id
                );
            }
        }

        wanted.into_iter().map(|i| self.points[i].clone()).collect()
    }
}
