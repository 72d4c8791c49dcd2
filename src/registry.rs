//! Static operator profiles and URL template resolution.
//!
//! One [`OperatorProfile`] per TSO, built once at process start and shared
//! read-only. Adding an operator means registering one more profile entry
//! here; no control flow anywhere else changes.
//!
//! Template placeholders: `{YYYY}` (4-digit year), `{MM}` (2-digit month),
//! `{DD}` (2-digit day), `{FY}` (Japanese fiscal year: the calendar year,
//! minus one for January through March).

use chrono::{Datelike, NaiveDate};

use crate::error::IngestError;
use crate::models::{DataType, GenField};

// ---

/// How raw values are scaled into megawatts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputUnit {
    Kilowatts,
    /// 万kW, the customary Japanese utility unit (1 万kW = 10 MW).
    TenThousandKilowatts,
    Megawatts,
}

impl InputUnit {
    pub fn to_megawatts(self, value: f64) -> f64 {
        match self {
            InputUnit::Kilowatts => value / 1000.0,
            InputUnit::TenThousandKilowatts => value * 10.0,
            InputUnit::Megawatts => value,
        }
    }
}

/// How the header is located in a raw file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRule {
    /// Skip exactly `n` leading lines; the next row is the header (or the
    /// first data row for column-per-slot layouts).
    SkipLines(usize),
    /// Scan for the row whose first cell equals this label (compared
    /// trimmed, case-insensitive); that row is the header.
    ScanFor(&'static str),
}

/// Whether slots run down the rows or across the columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLayout {
    /// One row per slot, with DATE and TIME columns.
    RowsAreSlots,
    /// One row per day: a date cell followed by one demand column per slot.
    ColumnsAreSlots,
}

/// Immutable per-operator configuration. One per TSO, never mutated.
#[derive(Debug, Clone)]
pub struct OperatorProfile {
    pub id: &'static str,
    pub name: &'static str,
    /// Numeric service-area code, 1..=9.
    pub area_code: u8,
    /// Slots per day: 48 (30-minute) or 96 (15-minute).
    pub slot_count: u16,
    demand_template: Option<&'static str>,
    supply_template: Option<&'static str>,
    pub input_unit: InputUnit,
    pub header_rule: HeaderRule,
    pub layout: SlotLayout,
    /// (source column label, canonical field) pairs; labels are stored
    /// lower-cased and matched against trimmed, lower-cased header cells.
    /// May carry alternate labels for the same field; first match wins.
    pub mapping: &'static [(&'static str, GenField)],
    /// Exact column count the raw format is expected to have; divergence
    /// means the mapping table is stale.
    pub expected_columns: usize,
}

impl OperatorProfile {
    fn template(&self, data_type: DataType) -> Option<&'static str> {
        match data_type {
            DataType::Demand => self.demand_template,
            DataType::Supply => self.supply_template,
        }
    }
}

// ---

/// Shared source-column table for the standard `eria_jukyu` publication
/// layout: DATE, TIME, then 18 value columns.
const ERIA_JUKYU_MAPPING: &[(&str, GenField)] = &[
    ("エリア需要", GenField::AreaDemand),
    ("実績(万kw)", GenField::AreaDemand),
    ("原子力", GenField::Nuclear),
    ("火力(lng)", GenField::Lng),
    ("火力（ｌｎｇ）", GenField::Lng),
    ("火力(石炭)", GenField::Coal),
    ("火力(石油)", GenField::Oil),
    ("火力(その他)", GenField::OtherFire),
    ("水力", GenField::Hydro),
    ("地熱", GenField::Geothermal),
    ("バイオマス", GenField::Biomass),
    ("太陽光発電実績", GenField::SolarActual),
    ("太陽光実績", GenField::SolarActual),
    ("太陽光出力制御量", GenField::SolarControl),
    ("太陽光制御量", GenField::SolarControl),
    ("風力発電実績", GenField::WindActual),
    ("風力実績", GenField::WindActual),
    ("風力出力制御量", GenField::WindControl),
    ("風力制御量", GenField::WindControl),
    ("揚水", GenField::PumpedStorage),
    ("蓄電池", GenField::Battery),
    ("連系線", GenField::Interconnection),
    ("その他", GenField::Other),
    ("合計", GenField::Total),
];

/// DATE, TIME + 18 value columns.
const ERIA_JUKYU_COLUMNS: usize = 20;

/// The registry of all nine operator profiles, resolved by operator id.
#[derive(Debug, Clone)]
pub struct OperatorRegistry {
    profiles: Vec<OperatorProfile>,
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl OperatorRegistry {
    /// The embedded production registry.
    pub fn builtin() -> Self {
        let eria = |id, name, area_code, tpl: &'static str| OperatorProfile {
            id,
            name,
            area_code,
            slot_count: 48,
            demand_template: Some(tpl),
            supply_template: Some(tpl),
            input_unit: InputUnit::Megawatts,
            header_rule: HeaderRule::SkipLines(1),
            layout: SlotLayout::RowsAreSlots,
            mapping: ERIA_JUKYU_MAPPING,
            expected_columns: ERIA_JUKYU_COLUMNS,
        };

        let profiles = vec![
            eria(
                "hokkaido",
                "Hokkaido Electric Power Network",
                1,
                "https://www.hepco.co.jp/network/con_service/public_document/supply_demand_results/csv/eria_jukyu_{YYYY}{MM}_01.csv",
            ),
            OperatorProfile {
                // Tohoku prepends a free-form notice of varying length, so
                // the header is located by scanning for its DATE cell.
                header_rule: HeaderRule::ScanFor("date"),
                ..eria(
                    "tohoku",
                    "Tohoku Electric Power Network",
                    2,
                    "https://setsuden.nw.tohoku-epco.co.jp/common/demand/eria_jukyu_{YYYY}{MM}_02.csv",
                )
            },
            eria(
                "tepco",
                "TEPCO Power Grid",
                3,
                "https://www.tepco.co.jp/forecast/html/images/eria_jukyu_{YYYY}{MM}_03.csv",
            ),
            OperatorProfile {
                // Chubu ships a whole year of 15-minute files in one ZIP.
                slot_count: 96,
                ..eria(
                    "chubu",
                    "Chubu Electric Power Grid",
                    4,
                    "https://powergrid.chuden.co.jp/denki_yoho_content_data/eria_jukyu_{YYYY}.zip",
                )
            },
            OperatorProfile {
                input_unit: InputUnit::Kilowatts,
                ..eria(
                    "hokuriku",
                    "Hokuriku Electric Power Transmission & Distribution",
                    5,
                    "https://www.rikuden.co.jp/nw_jyukyuu/csv/area_{YYYY}{MM}.csv",
                )
            },
            OperatorProfile {
                id: "kansai",
                name: "Kansai Transmission and Distribution",
                area_code: 6,
                slot_count: 48,
                demand_template: Some(
                    "https://www.kansai-td.co.jp/yamasou/juyo-jisseki/jisseki/ji_{YYYY}{MM}.csv",
                ),
                // Kansai only publishes the day-per-row demand matrix; there
                // is no supply breakdown on this surface.
                supply_template: None,
                input_unit: InputUnit::TenThousandKilowatts,
                header_rule: HeaderRule::SkipLines(2),
                layout: SlotLayout::ColumnsAreSlots,
                mapping: &[],
                expected_columns: 1 + 48,
            },
            eria(
                "chugoku",
                "Chugoku Electric Power Transmission & Distribution",
                7,
                "https://www.energia.co.jp/nw/service/supply/juyo/sys/juyo-jisseki-{YYYY}{MM}.csv",
            ),
            eria(
                "shikoku",
                "Shikoku Electric Power Transmission & Distribution",
                8,
                "https://www.yonden.co.jp/nw/assets/renewable_energy/data/download_juyo/{YYYY}{MM}_jukyu.csv",
            ),
            eria(
                "kyushu",
                "Kyushu Electric Power Transmission & Distribution",
                9,
                "https://www.kyuden.co.jp/td_service_wheeling_rule-document_disclosure-area-performance_{YYYY}{MM}.csv",
            ),
        ];

        OperatorRegistry { profiles }
    }

    pub fn profile(&self, operator_id: &str) -> Result<&OperatorProfile, IngestError> {
        self.profiles
            .iter()
            .find(|p| p.id == operator_id)
            .ok_or_else(|| IngestError::UnknownOperator(operator_id.to_string()))
    }

    pub fn operator_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.profiles.iter().map(|p| p.id)
    }

    /// Resolve an operator's URL template for a concrete date.
    ///
    /// Pure string substitution, no I/O; URL generation is testable without
    /// touching the network.
    pub fn resolve(
        &self,
        operator_id: &str,
        data_type: DataType,
        date: NaiveDate,
    ) -> Result<String, IngestError> {
        let profile = self.profile(operator_id)?;
        let template =
            profile
                .template(data_type)
                .ok_or_else(|| IngestError::UnsupportedDataType {
                    operator: operator_id.to_string(),
                    data_type,
                })?;
        Ok(expand_template(template, date))
    }
}

/// Substitute `{YYYY}`, `{MM}`, `{DD}`, `{FY}` with zero-padded literals.
pub fn expand_template(template: &str, date: NaiveDate) -> String {
    let fiscal_year = if date.month() < 4 {
        date.year() - 1
    } else {
        date.year()
    };
    template
        .replace("{YYYY}", &format!("{:04}", date.year()))
        .replace("{MM}", &format!("{:02}", date.month()))
        .replace("{DD}", &format!("{:02}", date.day()))
        .replace("{FY}", &format!("{fiscal_year:04}"))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn resolve_substitutes_zero_padded_placeholders() {
        // ---
        let reg = OperatorRegistry::builtin();
        let url = reg
            .resolve("tepco", DataType::Demand, d(2024, 3, 1))
            .unwrap();
        assert_eq!(
            url,
            "https://www.tepco.co.jp/forecast/html/images/eria_jukyu_202403_03.csv"
        );
    }

    #[test]
    fn resolve_leaves_no_placeholders_for_any_operator() {
        // ---
        let reg = OperatorRegistry::builtin();
        for id in reg.operator_ids().collect::<Vec<_>>() {
            for data_type in [DataType::Demand, DataType::Supply] {
                match reg.resolve(id, data_type, d(2024, 11, 9)) {
                    Ok(url) => {
                        assert!(!url.contains('{'), "unresolved placeholder in {url}");
                        assert!(!url.contains('}'), "unresolved placeholder in {url}");
                    }
                    // kansai has no supply surface; that is the only hole
                    Err(IngestError::UnsupportedDataType { .. }) => {
                        assert_eq!(id, "kansai");
                        assert_eq!(data_type, DataType::Supply);
                    }
                    Err(e) => panic!("unexpected error for {id}: {e}"),
                }
            }
        }
    }

    #[test]
    fn fiscal_year_rolls_back_before_april() {
        // ---
        assert_eq!(expand_template("{FY}", d(2024, 3, 31)), "2023");
        assert_eq!(expand_template("{FY}", d(2024, 4, 1)), "2024");
        assert_eq!(
            expand_template("https://example.jp/{FY}/d_{YYYY}{MM}{DD}.csv", d(2025, 1, 2)),
            "https://example.jp/2024/d_20250102.csv"
        );
    }

    #[test]
    fn unknown_operator_is_rejected() {
        // ---
        let reg = OperatorRegistry::builtin();
        assert!(matches!(
            reg.resolve("okinawa", DataType::Demand, d(2024, 1, 1)),
            Err(IngestError::UnknownOperator(_))
        ));
    }

    #[test]
    fn unsupported_data_type_is_rejected() {
        // ---
        let reg = OperatorRegistry::builtin();
        assert!(matches!(
            reg.resolve("kansai", DataType::Supply, d(2024, 1, 1)),
            Err(IngestError::UnsupportedDataType { .. })
        ));
    }

    #[test]
    fn area_codes_cover_one_through_nine() {
        // ---
        let reg = OperatorRegistry::builtin();
        let mut codes: Vec<u8> = reg.profiles.iter().map(|p| p.area_code).collect();
        codes.sort_unstable();
        assert_eq!(codes, (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn slot_counts_are_valid_granularities() {
        // ---
        let reg = OperatorRegistry::builtin();
        for p in &reg.profiles {
            assert!(p.slot_count == 48 || p.slot_count == 96, "{}", p.id);
        }
        assert_eq!(reg.profile("chubu").unwrap().slot_count, 96);
        assert_eq!(reg.profile("tepco").unwrap().slot_count, 48);
    }
}
