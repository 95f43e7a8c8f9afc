use chrono::{NaiveDate, NaiveTime};
use meisai_core::{RowError, RowErrorKind, StatementFields, StreamError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Column order of a toll statement export.
pub const COLUMNS: [&str; 13] = [
    "利用年月日（自）",
    "時分（自）",
    "利用年月日（至）",
    "時分（至）",
    "利用ＩＣ（自）",
    "利用ＩＣ（至）",
    "料金所名",
    "通行料金",
    "通行区分",
    "車種",
    "車両番号",
    "ＥＴＣカード番号",
    "備考",
];

pub const COLUMN_COUNT: usize = COLUMNS.len();

/// The header line joined with commas, for building statement files.
pub fn header_line() -> String {
    COLUMNS.join(",")
}

fn split_record(line: &[u8]) -> Result<csv::StringRecord, RowErrorKind> {
    if std::str::from_utf8(line).is_err() {
        return Err(RowErrorKind::Encoding);
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line);
    match reader.records().next() {
        Some(Ok(record)) => Ok(record),
        Some(Err(e)) => Err(RowErrorKind::Malformed(e.to_string())),
        None => Err(RowErrorKind::Malformed("empty row".to_string())),
    }
}

/// Accepts the first line of a statement only if it looks like the header:
/// enough columns, and a first cell that is not itself a date.
pub fn check_header(line: &[u8]) -> Result<(), StreamError> {
    let record = split_record(line).map_err(|e| StreamError::MalformedHeader(e.to_string()))?;
    if record.len() < COLUMN_COUNT {
        return Err(StreamError::MalformedHeader(format!(
            "expected {COLUMN_COUNT} columns, found {}",
            record.len()
        )));
    }
    let first = record.get(0).unwrap_or_default();
    if parse_date(first).is_ok() {
        return Err(StreamError::MalformedHeader(
            "first row is data, not a header".to_string(),
        ));
    }
    Ok(())
}

/// Parses one data row. `line` is the 1-based physical row number used in
/// the returned error.
pub fn parse_row(row: &[u8], line: u64) -> Result<StatementFields, RowError> {
    parse_fields(row).map_err(|kind| RowError::new(line, kind))
}

fn parse_fields(row: &[u8]) -> Result<StatementFields, RowErrorKind> {
    let record = split_record(row)?;
    let extra_filled = record.iter().skip(COLUMN_COUNT).any(|c| !c.trim().is_empty());
    if record.len() < COLUMN_COUNT || extra_filled {
        return Err(RowErrorKind::ColumnCount {
            expected: COLUMN_COUNT,
            found: record.len(),
        });
    }
    let col = |i: usize| record.get(i).unwrap_or_default().trim();

    let fields = StatementFields {
        date: required(col(0), "date").and_then(parse_date)?,
        time: required(col(1), "time").and_then(parse_time)?,
        date_to: optional(col(2)).map(parse_date).transpose()?,
        time_to: optional(col(3)).map(parse_time).transpose()?,
        entry_point: col(4).to_string(),
        exit_point: col(5).to_string(),
        toll_station_name: col(6).to_string(),
        toll_amount: required(col(7), "toll_amount").and_then(parse_amount)?,
        usage_category: col(8).to_string(),
        vehicle_class: col(9).to_string(),
        vehicle_number: col(10).to_string(),
        card_number: col(11).to_string(),
        remarks: col(12).to_string(),
    };
    fields.validate()?;
    Ok(fields)
}

fn required<'a>(s: &'a str, name: &'static str) -> Result<&'a str, RowErrorKind> {
    if s.is_empty() {
        Err(RowErrorKind::MissingField(name))
    } else {
        Ok(s)
    }
}

fn optional(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, RowErrorKind> {
    let s = s.trim();
    // `%Y` would happily read "25" as the year 25.
    let year_len = s.find(['/', '-']).unwrap_or(s.len());
    let formats: &[&str] = if year_len == 2 {
        &["%y/%m/%d", "%y-%m-%d"]
    } else {
        &["%Y/%m/%d", "%Y-%m-%d"]
    };
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .ok_or_else(|| RowErrorKind::InvalidDate(s.to_string()))
}

pub(crate) fn parse_time(s: &str) -> Result<NaiveTime, RowErrorKind> {
    let s = s.trim();
    ["%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| RowErrorKind::InvalidTime(s.to_string()))
}

/// Whole yen. Thousands separators, a yen sign and a trailing "円" are
/// tolerated; fractional amounts are not.
pub(crate) fn parse_amount(s: &str) -> Result<i64, RowErrorKind> {
    let cleaned = s
        .trim()
        .trim_end_matches('円')
        .replace([',', '，', '¥', '￥', ' '], "");
    let dec = Decimal::from_str(&cleaned).map_err(|_| RowErrorKind::InvalidAmount(s.to_string()))?;
    if !dec.fract().is_zero() {
        return Err(RowErrorKind::InvalidAmount(s.to_string()));
    }
    dec.to_i64()
        .ok_or_else(|| RowErrorKind::InvalidAmount(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROW: &str = "2025/07/30,08:15,2025/07/30,08:52,東京,横浜町田,,\"1,200\",,普通,品川 300 あ 12-34,1234-5678-9012-3456,";

    // ── parse_amount ──────────────────────────────────────────────────────────

    #[test]
    fn parse_amount_plain() {
        assert_eq!(parse_amount("1200").unwrap(), 1200);
    }

    #[test]
    fn parse_amount_with_separators_and_suffix() {
        assert_eq!(parse_amount("1,200円").unwrap(), 1200);
        assert_eq!(parse_amount("￥3,450").unwrap(), 3450);
    }

    #[test]
    fn parse_amount_zero() {
        assert_eq!(parse_amount("0").unwrap(), 0);
    }

    #[test]
    fn parse_amount_keeps_sign_for_validation() {
        assert_eq!(parse_amount("-50").unwrap(), -50);
    }

    #[test]
    fn parse_amount_rejects_fractions_and_garbage() {
        assert!(matches!(parse_amount("12.5"), Err(RowErrorKind::InvalidAmount(_))));
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount("").is_err());
    }

    // ── parse_date / parse_time ───────────────────────────────────────────────

    #[test]
    fn parse_date_formats() {
        let want = NaiveDate::from_ymd_opt(2025, 7, 30).unwrap();
        assert_eq!(parse_date("2025/07/30").unwrap(), want);
        assert_eq!(parse_date("25/07/30").unwrap(), want);
        assert_eq!(parse_date("2025-07-30").unwrap(), want);
    }

    #[test]
    fn parse_date_invalid() {
        assert!(matches!(parse_date("2025/13/01"), Err(RowErrorKind::InvalidDate(_))));
        assert!(parse_date("利用年月日（自）").is_err());
    }

    #[test]
    fn parse_time_formats() {
        assert_eq!(parse_time("08:15").unwrap(), NaiveTime::from_hms_opt(8, 15, 0).unwrap());
        assert_eq!(parse_time("23:59:30").unwrap(), NaiveTime::from_hms_opt(23, 59, 30).unwrap());
        assert!(parse_time("25:00").is_err());
    }

    // ── header ────────────────────────────────────────────────────────────────

    #[test]
    fn header_accepted() {
        assert!(check_header(header_line().as_bytes()).is_ok());
    }

    #[test]
    fn data_row_is_not_a_header() {
        assert!(matches!(
            check_header(ROW.as_bytes()),
            Err(StreamError::MalformedHeader(_))
        ));
    }

    #[test]
    fn short_header_rejected() {
        assert!(check_header(b"a,b,c").is_err());
    }

    // ── rows ──────────────────────────────────────────────────────────────────

    #[test]
    fn parse_full_row() {
        let f = parse_row(ROW.as_bytes(), 2).unwrap();
        assert_eq!(f.date, NaiveDate::from_ymd_opt(2025, 7, 30).unwrap());
        assert_eq!(f.time, NaiveTime::from_hms_opt(8, 15, 0).unwrap());
        assert_eq!(f.time_to, NaiveTime::from_hms_opt(8, 52, 0));
        assert_eq!(f.entry_point, "東京");
        assert_eq!(f.exit_point, "横浜町田");
        assert_eq!(f.toll_amount, 1200);
        assert_eq!(f.vehicle_class, "普通");
        assert_eq!(f.card_number, "1234-5678-9012-3456");
        assert_eq!(f.toll_station_name, "");
    }

    #[test]
    fn short_row_reports_column_count() {
        let err = parse_row(b"2025/07/30,08:15,x", 5).unwrap_err();
        assert_eq!(err.line, 5);
        assert_eq!(err.kind, RowErrorKind::ColumnCount { expected: 13, found: 3 });
    }

    #[test]
    fn trailing_empty_columns_tolerated() {
        let row = format!("{ROW},,");
        assert!(parse_row(row.as_bytes(), 2).is_ok());
    }

    #[test]
    fn missing_card_number() {
        let row = ROW.replace("1234-5678-9012-3456", "");
        let err = parse_row(row.as_bytes(), 3).unwrap_err();
        assert_eq!(err.kind, RowErrorKind::MissingField("card_number"));
    }

    #[test]
    fn negative_amount_rejected() {
        let row = ROW.replace("\"1,200\"", "-10");
        let err = parse_row(row.as_bytes(), 3).unwrap_err();
        assert_eq!(err.kind, RowErrorKind::NegativeAmount(-10));
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() {
        let err = parse_row(&[0x82, 0xa0, b',', b'x'], 9).unwrap_err();
        assert_eq!(err.kind, RowErrorKind::Encoding);
    }

    #[test]
    fn blank_date_is_missing() {
        let row = ROW.replacen("2025/07/30", "", 1);
        let err = parse_row(row.as_bytes(), 4).unwrap_err();
        assert_eq!(err.kind, RowErrorKind::MissingField("date"));
    }
}
