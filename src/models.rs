//! Canonical row model, unit lifecycle, and run reporting.

use chrono::NaiveDate;
use serde::Serialize;

// ---

/// Which publication an ingestion unit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Demand,
    Supply,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Demand => "demand",
            DataType::Supply => "supply",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "demand" => Some(DataType::Demand),
            "supply" => Some(DataType::Supply),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---

/// The canonical demand/generation fields, in storage column order.
///
/// Every field is a nullable megawatt figure. Null means "not reported by
/// this operator", which is distinct from a true zero output; downstream
/// aggregation relies on that distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenField {
    AreaDemand,
    Nuclear,
    Lng,
    Coal,
    Oil,
    OtherFire,
    Hydro,
    Geothermal,
    Biomass,
    SolarActual,
    SolarControl,
    WindActual,
    WindControl,
    PumpedStorage,
    Battery,
    Interconnection,
    Other,
    Total,
}

impl GenField {
    pub const COUNT: usize = 18;

    pub const ALL: [GenField; GenField::COUNT] = [
        GenField::AreaDemand,
        GenField::Nuclear,
        GenField::Lng,
        GenField::Coal,
        GenField::Oil,
        GenField::OtherFire,
        GenField::Hydro,
        GenField::Geothermal,
        GenField::Biomass,
        GenField::SolarActual,
        GenField::SolarControl,
        GenField::WindActual,
        GenField::WindControl,
        GenField::PumpedStorage,
        GenField::Battery,
        GenField::Interconnection,
        GenField::Other,
        GenField::Total,
    ];

    /// Storage column name. `LNG` keeps its historical upper-case spelling,
    /// so all column identifiers are quoted in SQL.
    pub fn column_name(self) -> &'static str {
        match self {
            GenField::AreaDemand => "area_demand",
            GenField::Nuclear => "nuclear",
            GenField::Lng => "LNG",
            GenField::Coal => "coal",
            GenField::Oil => "oil",
            GenField::OtherFire => "other_fire",
            GenField::Hydro => "hydro",
            GenField::Geothermal => "geothermal",
            GenField::Biomass => "biomass",
            GenField::SolarActual => "solar_actual",
            GenField::SolarControl => "solar_control",
            GenField::WindActual => "wind_actual",
            GenField::WindControl => "wind_control",
            GenField::PumpedStorage => "pumped_storage",
            GenField::Battery => "battery",
            GenField::Interconnection => "interconnection",
            GenField::Other => "other",
            GenField::Total => "total",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

// ---

/// Deterministic composite key: `{YYYYMMDD}_{slot}_{areaCode}`.
///
/// Two records for the same (date, slot, area) always collide to the same
/// key; this is the idempotency anchor for persistence.
pub fn master_key(date: &str, slot: u16, area_code: u8) -> String {
    format!("{date}_{slot}_{area_code}")
}

/// The normalized unit of storage: one (date, slot, area) observation with
/// all canonical fields in megawatts.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub master_key: String,
    /// Operator-local reporting date as an 8-digit `YYYYMMDD` string.
    pub date: String,
    /// 1-based slot index within the operator's declared granularity.
    pub slot: u16,
    pub area_code: u8,
    /// Values indexed by [`GenField::index`], megawatts, null = not reported.
    pub values: [Option<f64>; GenField::COUNT],
}

impl CanonicalRecord {
    pub fn new(
        date: String,
        slot: u16,
        area_code: u8,
        values: [Option<f64>; GenField::COUNT],
    ) -> Self {
        let master_key = master_key(&date, slot, area_code);
        CanonicalRecord {
            master_key,
            date,
            slot,
            area_code,
            values,
        }
    }

    pub fn value(&self, field: GenField) -> Option<f64> {
        self.values[field.index()]
    }
}

// ---

/// One retriable/reportable unit of work: a single operator, date, and
/// data type.
#[derive(Debug, Clone)]
pub struct IngestionUnit {
    pub operator_id: String,
    pub date: NaiveDate,
    pub data_type: DataType,
}

/// Pipeline stage, recorded on failure so a run report pinpoints where a
/// unit died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Parse,
    Normalize,
    Persist,
}

/// Terminal (or in-progress) state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Pending,
    Fetched,
    Parsed,
    Normalized,
    Persisted,
    Failed,
    Cancelled,
}

/// Per-unit outcome, aggregated into the run report.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub operator_id: String,
    pub date: NaiveDate,
    pub data_type: DataType,
    pub state: UnitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub rows: usize,
    pub skipped_rows: usize,
    pub inserted: u64,
    pub updated: u64,
}

impl UnitReport {
    pub fn pending(unit: &IngestionUnit) -> Self {
        UnitReport {
            operator_id: unit.operator_id.clone(),
            date: unit.date,
            data_type: unit.data_type,
            state: UnitState::Pending,
            failed_stage: None,
            error: None,
            rows: 0,
            skipped_rows: 0,
            inserted: 0,
            updated: 0,
        }
    }

    pub fn fail(mut self, stage: Stage, error: impl std::fmt::Display) -> Self {
        self.state = UnitState::Failed;
        self.failed_stage = Some(stage);
        self.error = Some(error.to_string());
        self
    }

    pub fn cancelled(mut self) -> Self {
        self.state = UnitState::Cancelled;
        self
    }
}

/// Aggregated outcome of one orchestrator run. Every requested unit is
/// present exactly once, whatever its terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub units: Vec<UnitReport>,
}

impl RunReport {
    pub fn all_persisted(&self) -> bool {
        self.units.iter().all(|u| u.state == UnitState::Persisted)
    }

    pub fn count_in(&self, state: UnitState) -> usize {
        self.units.iter().filter(|u| u.state == state).count()
    }
}
