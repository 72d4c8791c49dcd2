//! Per-operator format parsing into raw, pre-normalization records.
//!
//! Each operator profile supplies a header rule, a slot layout, and a
//! column-mapping table; this module turns decoded CSV text into
//! [`ParsedRecord`]s against that profile. One malformed row never blocks
//! the rest of a file; it is counted and skipped. A column-count
//! divergence, by contrast, means the mapping table itself is stale and
//! fails the whole file with `SchemaMismatch`.

use std::collections::HashSet;

use chrono::NaiveDate;
use csv::ReaderBuilder;
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::models::GenField;
use crate::registry::{HeaderRule, OperatorProfile, SlotLayout};

// ---

/// One raw observation: reporting date, 1-based slot, and unscaled values.
/// Unit conversion and slot validation happen in the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub date: String,
    pub slot: u16,
    pub values: [Option<f64>; GenField::COUNT],
}

/// Parse outcome for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    pub records: Vec<ParsedRecord>,
    /// Rows dropped for an unparseable date/slot combination.
    pub skipped_rows: usize,
}

/// Header cell labels accepted for the date and time columns.
const DATE_LABELS: &[&str] = &["date", "日付"];
const TIME_LABELS: &[&str] = &["time", "時刻", "時間"];

// ---

pub fn parse(profile: &OperatorProfile, csv_text: &str) -> Result<ParsedFile, IngestError> {
    let rows = read_rows(csv_text);
    match profile.layout {
        SlotLayout::RowsAreSlots => parse_rows_are_slots(profile, rows),
        SlotLayout::ColumnsAreSlots => parse_columns_are_slots(profile, rows),
    }
}

/// Raw rows, trimmed, with fully empty lines dropped. Flexible reader:
/// header prefaces are often ragged.
fn read_rows(csv_text: &str) -> Vec<Vec<String>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "unreadable CSV record dropped");
                continue;
            }
        };
        let row: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
        if row.iter().all(|c| c.is_empty()) {
            continue;
        }
        rows.push(row);
    }
    rows
}

// ---

fn parse_rows_are_slots(
    profile: &OperatorProfile,
    rows: Vec<Vec<String>>,
) -> Result<ParsedFile, IngestError> {
    let header_at = locate_header(profile, &rows)?;
    let header = &rows[header_at];
    let plan = ColumnPlan::build(profile, header)?;

    let mut records = Vec::new();
    let mut skipped_rows = 0usize;
    let mut seen: HashSet<(String, u16)> = HashSet::new();

    for row in &rows[header_at + 1..] {
        if row.len() != profile.expected_columns {
            return Err(IngestError::SchemaMismatch {
                operator: profile.id.to_string(),
                expected: profile.expected_columns,
                found: row.len(),
            });
        }

        let date = match parse_date(&row[plan.date_col]) {
            Some(d) => d,
            None => {
                skipped_rows += 1;
                continue;
            }
        };
        let slot = match parse_slot(&row[plan.time_col], profile.slot_count) {
            Some(s) => s,
            None => {
                skipped_rows += 1;
                continue;
            }
        };

        // Same (date, slot) twice in one file: first occurrence wins.
        if !seen.insert((date.clone(), slot)) {
            warn!(operator = profile.id, %date, slot, "duplicate slot in file, keeping first");
            continue;
        }

        let mut values = [None; GenField::COUNT];
        for (field, col) in &plan.value_cols {
            values[field.index()] = parse_number(&row[*col]);
        }
        records.push(ParsedRecord { date, slot, values });
    }

    debug!(
        operator = profile.id,
        rows = records.len(),
        skipped = skipped_rows,
        "parsed slot-per-row file"
    );
    Ok(ParsedFile {
        records,
        skipped_rows,
    })
}

fn parse_columns_are_slots(
    profile: &OperatorProfile,
    rows: Vec<Vec<String>>,
) -> Result<ParsedFile, IngestError> {
    let skip = match profile.header_rule {
        HeaderRule::SkipLines(n) => n,
        // Day-per-row files carry no labeled header to scan for.
        HeaderRule::ScanFor(_) => 0,
    };

    let mut records = Vec::new();
    let mut skipped_rows = 0usize;
    let mut seen: HashSet<String> = HashSet::new();

    for row in rows.iter().skip(skip) {
        if row.len() != profile.expected_columns {
            return Err(IngestError::SchemaMismatch {
                operator: profile.id.to_string(),
                expected: profile.expected_columns,
                found: row.len(),
            });
        }
        let date = match parse_date(&row[0]) {
            Some(d) => d,
            None => {
                skipped_rows += 1;
                continue;
            }
        };
        if !seen.insert(date.clone()) {
            warn!(operator = profile.id, %date, "duplicate day in file, keeping first");
            continue;
        }
        for (i, cell) in row[1..].iter().enumerate() {
            let mut values = [None; GenField::COUNT];
            values[GenField::AreaDemand.index()] = parse_number(cell);
            records.push(ParsedRecord {
                date: date.clone(),
                slot: (i + 1) as u16,
                values,
            });
        }
    }

    debug!(
        operator = profile.id,
        rows = records.len(),
        skipped = skipped_rows,
        "parsed day-per-row file"
    );
    Ok(ParsedFile {
        records,
        skipped_rows,
    })
}

/// Index of the header row per the profile's header rule.
fn locate_header(
    profile: &OperatorProfile,
    rows: &[Vec<String>],
) -> Result<usize, IngestError> {
    match profile.header_rule {
        HeaderRule::SkipLines(n) => {
            if n >= rows.len() {
                return Err(IngestError::SchemaMismatch {
                    operator: profile.id.to_string(),
                    expected: profile.expected_columns,
                    found: 0,
                });
            }
            Ok(n)
        }
        HeaderRule::ScanFor(label) => rows
            .iter()
            .position(|row| {
                row.first()
                    .is_some_and(|c| c.trim().eq_ignore_ascii_case(label))
            })
            .ok_or_else(|| IngestError::SchemaMismatch {
                operator: profile.id.to_string(),
                expected: profile.expected_columns,
                found: 0,
            }),
    }
}

/// Resolved column positions for one file.
struct ColumnPlan {
    date_col: usize,
    time_col: usize,
    value_cols: Vec<(GenField, usize)>,
}

impl ColumnPlan {
    /// Match the profile's source labels against the header. Unmapped
    /// source columns are ignored; canonical fields with no source column
    /// stay null. Missing date/time columns or a diverging width mean the
    /// mapping is stale.
    fn build(profile: &OperatorProfile, header: &[String]) -> Result<Self, IngestError> {
        if header.len() != profile.expected_columns {
            return Err(IngestError::SchemaMismatch {
                operator: profile.id.to_string(),
                expected: profile.expected_columns,
                found: header.len(),
            });
        }

        let cells: Vec<String> = header.iter().map(|c| c.trim().to_lowercase()).collect();
        let find = |labels: &[&str]| {
            cells
                .iter()
                .position(|c| labels.iter().any(|l| c == l))
        };

        let (date_col, time_col) = match (find(DATE_LABELS), find(TIME_LABELS)) {
            (Some(d), Some(t)) => (d, t),
            _ => {
                return Err(IngestError::SchemaMismatch {
                    operator: profile.id.to_string(),
                    expected: profile.expected_columns,
                    found: header.len(),
                })
            }
        };

        let mut value_cols = Vec::new();
        let mut placed = [false; GenField::COUNT];
        for (label, field) in profile.mapping {
            if placed[field.index()] {
                continue;
            }
            if let Some(col) = cells.iter().position(|c| c == label) {
                value_cols.push((*field, col));
                placed[field.index()] = true;
            }
        }
        for field in GenField::ALL {
            if !placed[field.index()] {
                debug!(
                    operator = profile.id,
                    field = field.column_name(),
                    "no source column; field stays null"
                );
            }
        }

        Ok(ColumnPlan {
            date_col,
            time_col,
            value_cols,
        })
    }
}

// ---

/// `YYYY/MM/DD` (primary) or `YYYY-MM-DD` into the canonical 8-digit form.
fn parse_date(cell: &str) -> Option<String> {
    let cell = cell.trim();
    NaiveDate::parse_from_str(cell, "%Y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(cell, "%Y-%m-%d"))
        .ok()
        .map(|d| d.format("%Y%m%d").to_string())
}

/// `HH:MM` into a 1-based slot index at the operator's granularity.
/// `24:00` wraps to the last slot of the day.
fn parse_slot(cell: &str, slot_count: u16) -> Option<u16> {
    let (h, m) = cell.trim().split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    if minute >= 60 {
        return None;
    }
    let total = hour * 60 + minute;
    if total == 1440 {
        return Some(slot_count);
    }
    let minutes_per_slot = 1440 / slot_count as u32;
    Some((total / minutes_per_slot + 1) as u16)
}

/// Numeric cell cleanup: full-width digits folded to ASCII, commas
/// stripped; empty and dash cells are null, not zero.
fn parse_number(cell: &str) -> Option<f64> {
    let folded: String = cell
        .trim()
        .chars()
        .filter_map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - 0xFEE0),
            ',' | '，' => None,
            '－' => Some('-'),
            _ => Some(c),
        })
        .collect();
    if folded.is_empty() || folded == "-" {
        return None;
    }
    folded.parse().ok()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::DataType;
    use crate::registry::OperatorRegistry;

    fn profile(id: &str) -> OperatorProfile {
        OperatorRegistry::builtin().profile(id).unwrap().clone()
    }

    /// The standard publication layout: a title line, then the 20-column
    /// header, then one row per slot.
    fn eria_jukyu_file(date: &str, slots: u16) -> String {
        let mut out = String::from("エリア需給実績\n");
        out.push_str(
            "DATE,TIME,エリア需要,原子力,火力(LNG),火力(石炭),火力(石油),火力(その他),\
             水力,地熱,バイオマス,太陽光発電実績,太陽光出力制御量,風力発電実績,\
             風力出力制御量,揚水,蓄電池,連系線,その他,合計\n",
        );
        let minutes_per_slot = 1440 / slots as u32;
        for slot in 0..slots as u32 {
            let total = slot * minutes_per_slot;
            out.push_str(&format!(
                "{date},{}:{:02},3120,0,1200,800,10,5,300,0,55,640,0,90,0,-210,0,130,0,3120\n",
                total / 60,
                total % 60,
            ));
        }
        out
    }

    #[test]
    fn tepco_demand_file_parses_all_48_slots() {
        // ---
        let p = profile("tepco");
        let parsed = parse(&p, &eria_jukyu_file("2024/03/01", 48)).unwrap();
        assert_eq!(parsed.records.len(), 48);
        assert_eq!(parsed.skipped_rows, 0);

        let first = &parsed.records[0];
        assert_eq!(first.date, "20240301");
        assert_eq!(first.slot, 1);
        assert_eq!(first.values[GenField::AreaDemand.index()], Some(3120.0));
        assert_eq!(first.values[GenField::Lng.index()], Some(1200.0));
        assert_eq!(first.values[GenField::PumpedStorage.index()], Some(-210.0));
        // geothermal is reported as 0, which must stay 0, not null
        assert_eq!(first.values[GenField::Geothermal.index()], Some(0.0));

        assert_eq!(parsed.records[47].slot, 48);
    }

    #[test]
    fn chubu_quarter_hour_file_parses_96_slots() {
        // ---
        let p = profile("chubu");
        let parsed = parse(&p, &eria_jukyu_file("2024/04/01", 96)).unwrap();
        assert_eq!(parsed.records.len(), 96);
        assert_eq!(parsed.records[95].slot, 96);
    }

    #[test]
    fn one_malformed_row_is_skipped_not_fatal() {
        // ---
        let p = profile("tepco");
        let mut text = eria_jukyu_file("2024/03/01", 48);
        // corrupt one data row's date, keeping the column count intact
        text = text.replacen("2024/03/01,3:00", "not-a-date,3:00", 1);
        let parsed = parse(&p, &text).unwrap();
        assert_eq!(parsed.records.len(), 47);
        assert_eq!(parsed.skipped_rows, 1);
    }

    #[test]
    fn unparseable_time_is_skipped() {
        // ---
        let p = profile("tepco");
        let text = eria_jukyu_file("2024/03/01", 48).replacen("01,3:30,", "01,330,", 1);
        let parsed = parse(&p, &text).unwrap();
        assert_eq!(parsed.records.len(), 47);
        assert_eq!(parsed.skipped_rows, 1);
    }

    #[test]
    fn diverging_column_count_is_schema_mismatch() {
        // ---
        let p = profile("tepco");
        // drop the 合計 column from the header and every row
        let text = eria_jukyu_file("2024/03/01", 48)
            .lines()
            .map(|l| l.rsplit_once(',').map(|(a, _)| a.to_string()).unwrap_or(l.to_string()))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(matches!(
            parse(&p, &text),
            Err(IngestError::SchemaMismatch { expected: 20, found: 19, .. })
        ));
    }

    #[test]
    fn header_scan_tolerates_variable_preamble() {
        // ---
        let p = profile("tohoku");
        let text = format!(
            "東北エリアの需給実績\nお知らせ: 改訂版\n\n{}",
            eria_jukyu_file("2024/03/01", 48)
                .lines()
                .skip(1)
                .collect::<Vec<_>>()
                .join("\n")
        );
        let parsed = parse(&p, &text).unwrap();
        assert_eq!(parsed.records.len(), 48);
    }

    #[test]
    fn duplicate_slot_keeps_first_occurrence() {
        // ---
        let p = profile("tepco");
        let mut text = eria_jukyu_file("2024/03/01", 48);
        let dup =
            "2024/03/01,0:00,9999,0,1200,800,10,5,300,0,55,640,0,90,0,-210,0,130,0,9999\n";
        text.push_str(dup);
        let parsed = parse(&p, &text).unwrap();
        assert_eq!(parsed.records.len(), 48);
        assert_eq!(
            parsed.records[0].values[GenField::AreaDemand.index()],
            Some(3120.0)
        );
    }

    #[test]
    fn kansai_day_per_row_layout() {
        // ---
        let p = profile("kansai");
        let mut text = String::from("関西エリア 需要実績\n単位: 万kW\n");
        for day in 1..=2 {
            let cells: Vec<String> = (0..48).map(|s| format!("{}", 200 + s)).collect();
            text.push_str(&format!("2024/03/{day:02},{}\n", cells.join(",")));
        }
        let parsed = parse(&p, &text).unwrap();
        assert_eq!(parsed.records.len(), 96);
        assert_eq!(parsed.records[0].date, "20240301");
        assert_eq!(parsed.records[0].slot, 1);
        assert_eq!(
            parsed.records[0].values[GenField::AreaDemand.index()],
            Some(200.0)
        );
        assert_eq!(parsed.records[47].slot, 48);
        assert_eq!(parsed.records[48].date, "20240302");
        // unreported generation fields stay null in this layout
        assert_eq!(parsed.records[0].values[GenField::Nuclear.index()], None);
    }

    #[test]
    fn numeric_cleanup_handles_japanese_conventions() {
        // ---
        assert_eq!(parse_number("１２３４"), Some(1234.0));
        assert_eq!(parse_number("1,234"), Some(1234.0));
        assert_eq!(parse_number("１，２３４"), Some(1234.0));
        assert_eq!(parse_number("－42"), Some(-42.0));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("-"), None);
        assert_eq!(parse_number("－"), None);
        assert_eq!(parse_number("n/a"), None);
    }

    #[test]
    fn slot_conversion_covers_both_granularities() {
        // ---
        assert_eq!(parse_slot("0:00", 48), Some(1));
        assert_eq!(parse_slot("0:30", 48), Some(2));
        assert_eq!(parse_slot("23:30", 48), Some(48));
        assert_eq!(parse_slot("24:00", 48), Some(48));
        assert_eq!(parse_slot("0:15", 96), Some(2));
        assert_eq!(parse_slot("23:45", 96), Some(96));
        assert_eq!(parse_slot("noon", 48), None);
        // parseable but out of range: the normalizer rejects it later
        assert_eq!(parse_slot("25:00", 48), Some(51));
    }
}
