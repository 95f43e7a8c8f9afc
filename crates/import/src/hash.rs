use meisai_core::StatementFields;
use sha2::{Digest, Sha256};

/// Content fingerprint of a statement row.
///
/// SHA-256 over the business fields in a fixed order: date, time, entry
/// point, exit point, toll amount, vehicle number, card number. Each field
/// is written as its UTF-8 length (u64, big-endian) followed by its bytes,
/// so no two distinct field tuples feed the digest the same input.
/// Carried-along columns (remarks, vehicle class, ...) are not hashed.
pub fn fingerprint(fields: &StatementFields) -> String {
    let date = fields.date.format("%Y-%m-%d").to_string();
    let time = fields.time.format("%H:%M:%S").to_string();
    let amount = fields.toll_amount.to_string();

    let parts: [&str; 7] = [
        &date,
        &time,
        fields.entry_point.trim(),
        fields.exit_point.trim(),
        &amount,
        fields.vehicle_number.trim(),
        fields.card_number.trim(),
    ];

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// A fingerprint is 64 lowercase hex characters.
pub fn is_fingerprint(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    pub(crate) fn fields() -> StatementFields {
        StatementFields {
            date: NaiveDate::from_ymd_opt(2025, 7, 30).unwrap(),
            time: NaiveTime::from_hms_opt(8, 15, 0).unwrap(),
            date_to: None,
            time_to: None,
            entry_point: "東京".to_string(),
            exit_point: "横浜町田".to_string(),
            toll_station_name: String::new(),
            toll_amount: 1200,
            usage_category: String::new(),
            vehicle_class: "普通".to_string(),
            vehicle_number: "品川 300 あ 12-34".to_string(),
            card_number: "1234-5678-9012-3456".to_string(),
            remarks: String::new(),
        }
    }

    #[test]
    fn deterministic_and_hex() {
        let a = fingerprint(&fields());
        assert_eq!(a, fingerprint(&fields()));
        assert!(is_fingerprint(&a));
    }

    #[test]
    fn every_business_field_changes_the_hash() {
        let base = fingerprint(&fields());
        let variants = [
            StatementFields { date: NaiveDate::from_ymd_opt(2025, 7, 31).unwrap(), ..fields() },
            StatementFields { time: NaiveTime::from_hms_opt(8, 16, 0).unwrap(), ..fields() },
            StatementFields { entry_point: "川崎".into(), ..fields() },
            StatementFields { exit_point: "厚木".into(), ..fields() },
            StatementFields { toll_amount: 1201, ..fields() },
            StatementFields { vehicle_number: "品川 300 あ 12-35".into(), ..fields() },
            StatementFields { card_number: "1234-5678-9012-3457".into(), ..fields() },
        ];
        for v in &variants {
            assert_ne!(fingerprint(v), base, "{v:?}");
        }
    }

    #[test]
    fn carried_columns_do_not_change_the_hash() {
        let f = StatementFields {
            remarks: "深夜割引".into(),
            vehicle_class: "中型".into(),
            toll_station_name: "東京料金所".into(),
            ..fields()
        };
        assert_eq!(fingerprint(&f), fingerprint(&fields()));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = StatementFields { entry_point: "AB".into(), exit_point: "C".into(), ..fields() };
        let b = StatementFields { entry_point: "A".into(), exit_point: "BC".into(), ..fields() };
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn is_fingerprint_rejects_bad_input() {
        assert!(!is_fingerprint("abc"));
        assert!(!is_fingerprint(&"G".repeat(64)));
        assert!(!is_fingerprint(&"A".repeat(64)));
    }
}
