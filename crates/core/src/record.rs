use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RowErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fields of one toll-usage event as read from a statement row.
///
/// `date`, `time`, `entry_point`, `exit_point`, `toll_amount`,
/// `vehicle_number` and `card_number` are the business fields that identify
/// the event; the remaining columns are carried along but never fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementFields {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub date_to: Option<NaiveDate>,
    pub time_to: Option<NaiveTime>,
    pub entry_point: String,
    pub exit_point: String,
    pub toll_station_name: String,
    /// Whole yen.
    pub toll_amount: i64,
    pub usage_category: String,
    pub vehicle_class: String,
    pub vehicle_number: String,
    pub card_number: String,
    pub remarks: String,
}

impl StatementFields {
    pub fn validate(&self) -> Result<(), RowErrorKind> {
        let required = [
            ("entry_point", &self.entry_point),
            ("exit_point", &self.exit_point),
            ("vehicle_number", &self.vehicle_number),
            ("card_number", &self.card_number),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(RowErrorKind::MissingField(name));
            }
        }
        if self.toll_amount < 0 {
            return Err(RowErrorKind::NegativeAmount(self.toll_amount));
        }
        Ok(())
    }
}

/// A statement record, either freshly parsed (`id == None`) or persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementRecord {
    pub id: Option<RecordId>,
    #[serde(flatten)]
    pub fields: StatementFields,
    /// Hex SHA-256 over the business fields; see `meisai_import::hash`.
    pub content_hash: String,
    pub external_reference_number: Option<String>,
}

impl StatementRecord {
    pub fn new(fields: StatementFields, content_hash: String) -> Self {
        StatementRecord {
            id: None,
            fields,
            content_hash,
            external_reference_number: None,
        }
    }

    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = Some(id);
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

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
    fn valid_fields_pass() {
        assert_eq!(fields().validate(), Ok(()));
    }

    #[test]
    fn blank_card_number_is_missing() {
        let f = StatementFields {
            card_number: "  ".to_string(),
            ..fields()
        };
        assert_eq!(f.validate(), Err(RowErrorKind::MissingField("card_number")));
    }

    #[test]
    fn negative_amount_rejected() {
        let f = StatementFields {
            toll_amount: -10,
            ..fields()
        };
        assert_eq!(f.validate(), Err(RowErrorKind::NegativeAmount(-10)));
    }

    #[test]
    fn zero_amount_is_valid() {
        let f = StatementFields {
            toll_amount: 0,
            ..fields()
        };
        assert!(f.validate().is_ok());
    }

    #[test]
    fn record_serializes_flat() {
        let rec = StatementRecord::new(fields(), "ab".repeat(32)).with_id(RecordId(9));
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["id"], 9);
        assert_eq!(json["toll_amount"], 1200);
        assert_eq!(json["entry_point"], "東京");
    }
}
