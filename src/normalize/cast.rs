use anyhow::{Context, Result};
use arrow::{
    array::{Array, ArrayRef, AsArray, Date32Array, Int32Array, Int64Array, StringArray},
    compute::{can_cast_types, cast, cast_with_options, CastOptions},
    datatypes::DataType,
    util::display::array_value_to_string,
};
use chrono::NaiveDate;
use std::sync::Arc;

use crate::quality::CastFailure;
use crate::schema::{map_to_arrow_type, LogicalType};

/// Validation result for one column of one partition: the conformed
/// values plus the failed casts that were turned into nulls.
#[derive(Debug, Clone)]
pub struct ColumnOutcome {
    pub array: ArrayRef,
    pub failed: u64,
    /// At most `max_samples` failures, in row order.
    pub samples: Vec<CastFailure>,
}

/// Integer value of a numeric text: exact integers parse as-is, decimals
/// are truncated toward zero. Non-finite values are `None`.
pub fn parse_int_text(s: &str) -> Option<i64> {
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    let v = s.parse::<f64>().ok()?.trunc();
    // i64::MAX as f64 rounds up to 2^63, which is already out of range
    (v.is_finite() && v >= i64::MIN as f64 && v < i64::MAX as f64).then(|| v as i64)
}

/// Days since the Unix epoch for `yyyy-MM-dd`, optionally followed by a
/// time part after `T` or a space.
pub fn parse_date_days(s: &str) -> Option<i32> {
    let date_part = s.split(['T', ' ']).next()?;
    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    i32::try_from((date - epoch).num_days()).ok()
}

fn is_text(dt: &DataType) -> bool {
    matches!(dt, DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View)
}

/// Trimmed copy of a text column; blank values become null.
fn clean_text(array: &ArrayRef) -> Result<StringArray> {
    let utf8 = cast(array, &DataType::Utf8).context("casting text column to Utf8")?;
    Ok(utf8
        .as_string::<i32>()
        .iter()
        .map(|v| v.map(str::trim).filter(|s| !s.is_empty()))
        .collect())
}

/// Cast `array` to the declared type of column `name`.
///
/// A value that is present but cannot be represented in the target type
/// becomes null and is reported as a failure; only a column type that can
/// never be cast is an error. `row_offset` is the position of this
/// partition's first row within its source.
pub fn conform_column(
    name: &str,
    array: &ArrayRef,
    target: LogicalType,
    row_offset: usize,
    max_samples: usize,
) -> Result<ColumnOutcome> {
    let target_type = map_to_arrow_type(target);
    if array.data_type() == &target_type {
        return Ok(ColumnOutcome {
            array: array.clone(),
            failed: 0,
            samples: Vec::new(),
        });
    }

    if !can_cast_types(array.data_type(), &target_type) {
        anyhow::bail!(
            "column `{}` of type {} cannot be cast to {}",
            name,
            array.data_type(),
            target_type
        );
    }

    let source_is_text = is_text(array.data_type());
    let prepared: ArrayRef = if source_is_text && target != LogicalType::Text {
        Arc::new(clean_text(array)?)
    } else {
        array.clone()
    };

    let out: ArrayRef = if source_is_text && target == LogicalType::Date {
        let text = prepared.as_string::<i32>();
        Arc::new(
            text.iter()
                .map(|v| v.and_then(parse_date_days))
                .collect::<Date32Array>(),
        )
    } else if source_is_text && target == LogicalType::Int32 {
        let text = prepared.as_string::<i32>();
        Arc::new(
            text.iter()
                .map(|v| v.and_then(parse_int_text).and_then(|i| i32::try_from(i).ok()))
                .collect::<Int32Array>(),
        )
    } else if source_is_text && target == LogicalType::Int64 {
        let text = prepared.as_string::<i32>();
        Arc::new(text.iter().map(|v| v.and_then(parse_int_text)).collect::<Int64Array>())
    } else {
        cast_with_options(&prepared, &target_type, &CastOptions::default())
            .with_context(|| format!("casting column `{}` to {}", name, target_type))?
    };

    let mut failed = 0u64;
    let mut samples = Vec::new();
    for row in 0..prepared.len() {
        if prepared.is_null(row) || out.is_valid(row) {
            continue;
        }
        failed += 1;
        if samples.len() < max_samples {
            let raw_value = array_value_to_string(&prepared, row)
                .unwrap_or_else(|_| "<unprintable>".to_string());
            samples.push(CastFailure {
                column: name.to_string(),
                row: row_offset + row,
                reason: failure_reason(&prepared, row, target),
                raw_value,
            });
        }
    }

    Ok(ColumnOutcome {
        array: out,
        failed,
        samples,
    })
}

/// Why a single value failed, as reported by a strict cast of that value.
fn failure_reason(prepared: &ArrayRef, row: usize, target: LogicalType) -> String {
    if target == LogicalType::Date && is_text(prepared.data_type()) {
        return "not a date in yyyy-MM-dd form".to_string();
    }
    let strict = CastOptions {
        safe: false,
        ..Default::default()
    };
    match cast_with_options(&prepared.slice(row, 1), &map_to_arrow_type(target), &strict) {
        Err(e) => e.to_string(),
        Ok(_) => format!("value not representable as {:?}", target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, TimestampMillisecondArray};
    use arrow::datatypes::{Date32Type, Int32Type, Int64Type};

    #[test]
    fn int_text_truncates_decimals() {
        assert_eq!(parse_int_text("42"), Some(42));
        assert_eq!(parse_int_text("3.0"), Some(3));
        assert_eq!(parse_int_text("-2.7"), Some(-2));
        assert_eq!(parse_int_text("9223372036854775807"), Some(i64::MAX));
        assert_eq!(parse_int_text("1e30"), None);
        assert_eq!(parse_int_text("NaN"), None);
        assert_eq!(parse_int_text("\"7\""), None);
    }

    #[test]
    fn decimal_text_quantities_truncate_and_quotes_fail() -> Result<()> {
        let raw: ArrayRef = Arc::new(StringArray::from(vec!["3.0", "\"7\"", " 4.9 "]));
        let out = conform_column("quantity", &raw, LogicalType::Int32, 0, 5)?;
        let ints = out.array.as_primitive::<Int32Type>();
        assert_eq!(ints.value(0), 3);
        assert!(ints.is_null(1));
        assert_eq!(ints.value(2), 4);
        assert_eq!(out.failed, 1);
        assert_eq!(out.samples[0].raw_value, "\"7\"");

        let wide = conform_column("transaction_id", &raw, LogicalType::Int64, 0, 5)?;
        assert_eq!(wide.array.as_primitive::<Int64Type>().value(0), 3);
        assert_eq!(wide.failed, 1);
        Ok(())
    }

    #[test]
    fn parse_date_accepts_date_and_datetime_text() {
        assert_eq!(parse_date_days("1970-01-02"), Some(1));
        assert_eq!(parse_date_days("2023-01-01"), Some(19358));
        assert_eq!(parse_date_days("2023-01-01 10:30:00"), Some(19358));
        assert_eq!(parse_date_days("2023-01-01T10:30:00Z"), Some(19358));
        assert_eq!(parse_date_days("01/01/2023"), None);
        assert_eq!(parse_date_days("2023-02-30"), None);
    }

    #[test]
    fn text_to_int_nulls_failures_and_reports_them() -> Result<()> {
        let raw: ArrayRef = Arc::new(StringArray::from(vec![
            Some(" 3 "),
            Some("abc"),
            None,
            Some("   "),
            Some("99999999999"),
        ]));
        let out = conform_column("quantity", &raw, LogicalType::Int32, 100, 10)?;
        let ints = out.array.as_primitive::<Int32Type>();
        assert_eq!(ints.value(0), 3);
        assert!(ints.is_null(1));
        assert!(ints.is_null(2));
        assert!(ints.is_null(3));
        assert!(ints.is_null(4));

        // null and blank inputs are missing, not failures
        assert_eq!(out.failed, 2);
        assert_eq!(out.samples[0].row, 101);
        assert_eq!(out.samples[0].raw_value, "abc");
        assert_eq!(out.samples[1].row, 104);
        assert!(!out.samples[0].reason.is_empty());
        Ok(())
    }

    #[test]
    fn samples_are_capped_but_counts_are_not() -> Result<()> {
        let raw: ArrayRef = Arc::new(StringArray::from(vec!["a", "b", "c"]));
        let out = conform_column("price", &raw, LogicalType::Float64, 0, 1)?;
        assert_eq!(out.failed, 3);
        assert_eq!(out.samples.len(), 1);
        Ok(())
    }

    #[test]
    fn matching_type_passes_through() -> Result<()> {
        let raw: ArrayRef = Arc::new(Float64Array::from(vec![9.99, 1.5]));
        let out = conform_column("price", &raw, LogicalType::Float64, 0, 5)?;
        assert!(Arc::ptr_eq(&out.array, &raw));
        assert_eq!(out.failed, 0);
        Ok(())
    }

    #[test]
    fn wide_ints_narrow_and_overflow_to_null() -> Result<()> {
        let raw: ArrayRef = Arc::new(Int64Array::from(vec![Some(5), Some(i64::MAX), None]));
        let out = conform_column("product_id", &raw, LogicalType::Int32, 0, 5)?;
        let ints = out.array.as_primitive::<Int32Type>();
        assert_eq!(ints.value(0), 5);
        assert!(ints.is_null(1));
        assert_eq!(out.failed, 1);
        Ok(())
    }

    #[test]
    fn timestamps_and_text_become_dates() -> Result<()> {
        let ts: ArrayRef = Arc::new(TimestampMillisecondArray::from(vec![86_400_000 * 2]));
        let out = conform_column("transaction_date", &ts, LogicalType::Date, 0, 5)?;
        assert_eq!(out.array.as_primitive::<Date32Type>().value(0), 2);

        let text: ArrayRef = Arc::new(StringArray::from(vec!["2023-01-01", "yesterday"]));
        let out = conform_column("transaction_date", &text, LogicalType::Date, 0, 5)?;
        let dates = out.array.as_primitive::<Date32Type>();
        assert_eq!(dates.value(0), 19358);
        assert!(dates.is_null(1));
        assert_eq!(out.failed, 1);
        assert_eq!(out.samples[0].reason, "not a date in yyyy-MM-dd form");
        Ok(())
    }

    #[test]
    fn numbers_become_text() -> Result<()> {
        let raw: ArrayRef = Arc::new(Int32Array::from(vec![12]));
        let out = conform_column("store_name", &raw, LogicalType::Text, 0, 5)?;
        assert_eq!(out.array.as_string::<i32>().value(0), "12");
        Ok(())
    }

    #[test]
    fn uncastable_column_type_is_an_error() {
        let raw: ArrayRef = Arc::new(arrow::array::BinaryArray::from(vec![b"x".as_ref()]));
        assert!(conform_column("price", &raw, LogicalType::Date, 0, 5).is_err());
    }
}
