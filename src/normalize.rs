//! Normalization: unit conversion, slot validation, key attachment.
//!
//! The parser hands over raw values in whatever unit the operator
//! publishes; this stage rebases everything to megawatts, validates the
//! slot against the operator's declared granularity, and stamps the master
//! key. Unreported fields stay null, never zero-filled, so downstream
//! aggregation can tell "no solar panel" from "no sunlight".

use crate::error::IngestError;
use crate::models::CanonicalRecord;
use crate::parser::ParsedRecord;
use crate::registry::OperatorProfile;

// ---

/// Out-of-range slots are rejected, not clamped: they indicate corrupted
/// input or a stale granularity in the profile.
pub fn normalize(
    profile: &OperatorProfile,
    record: ParsedRecord,
) -> Result<CanonicalRecord, IngestError> {
    if record.slot < 1 || record.slot > profile.slot_count {
        return Err(IngestError::SlotOutOfRange {
            slot: record.slot,
            max: profile.slot_count,
        });
    }

    let values = record
        .values
        .map(|v| v.map(|x| profile.input_unit.to_megawatts(x)));

    Ok(CanonicalRecord::new(
        record.date,
        record.slot,
        profile.area_code,
        values,
    ))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::GenField;
    use crate::registry::OperatorRegistry;

    fn profile(id: &str) -> OperatorProfile {
        OperatorRegistry::builtin().profile(id).unwrap().clone()
    }

    fn raw(slot: u16, demand: Option<f64>) -> ParsedRecord {
        let mut values = [None; GenField::COUNT];
        values[GenField::AreaDemand.index()] = demand;
        ParsedRecord {
            date: "20240301".into(),
            slot,
            values,
        }
    }

    #[test]
    fn megawatt_input_passes_through() {
        // ---
        let rec = normalize(&profile("tepco"), raw(1, Some(3120.0))).unwrap();
        assert_eq!(rec.value(GenField::AreaDemand), Some(3120.0));
        assert_eq!(rec.master_key, "20240301_1_3");
    }

    #[test]
    fn kilowatt_input_is_scaled_down() {
        // ---
        let rec = normalize(&profile("hokuriku"), raw(12, Some(512_000.0))).unwrap();
        assert_eq!(rec.value(GenField::AreaDemand), Some(512.0));
        assert_eq!(rec.area_code, 5);
    }

    #[test]
    fn man_kw_input_is_scaled_up() {
        // ---
        let rec = normalize(&profile("kansai"), raw(3, Some(250.0))).unwrap();
        assert_eq!(rec.value(GenField::AreaDemand), Some(2500.0));
    }

    #[test]
    fn null_stays_null_not_zero() {
        // ---
        let rec = normalize(&profile("tepco"), raw(1, None)).unwrap();
        assert_eq!(rec.value(GenField::AreaDemand), None);
        assert_eq!(rec.value(GenField::Battery), None);
    }

    #[test]
    fn slot_out_of_range_is_rejected() {
        // ---
        assert!(matches!(
            normalize(&profile("tepco"), raw(49, Some(1.0))),
            Err(IngestError::SlotOutOfRange { slot: 49, max: 48 })
        ));
        assert!(matches!(
            normalize(&profile("tepco"), raw(0, Some(1.0))),
            Err(IngestError::SlotOutOfRange { slot: 0, max: 48 })
        ));
        // 49 is fine for a 96-slot operator
        assert!(normalize(&profile("chubu"), raw(49, Some(1.0))).is_ok());
    }
}
