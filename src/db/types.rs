//! PostgreSQL row decoding.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Category decoders handle the actual value extraction
//!
//! Values that cannot be decoded become JSON `null` and are logged.

use serde_json::Value as JsonValue;
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::{Column, Decode, Row, Type, TypeInfo};

/// Logical category for column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Unknown,
}

/// Classify a PostgreSQL type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.contains("numeric") || lower.contains("decimal") {
        return TypeCategory::Decimal;
    }

    match lower.as_str() {
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" => TypeCategory::Integer,
        "smallserial" | "serial" | "bigserial" => TypeCategory::Integer,
        "bool" | "boolean" => TypeCategory::Boolean,
        "float4" | "float8" | "real" | "double precision" => TypeCategory::Float,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "bytea" => TypeCategory::Binary,
        "timestamp" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        // Default to text for everything else (varchar, text, name, oid, etc.)
        _ => TypeCategory::Unknown,
    }
}

/// Wrapper type for raw NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Encode binary data as a base64 JSON string.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> serde_json::Map<String, JsonValue>;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name());
                (col.name().to_string(), decode_column(self, idx, category))
            })
            .collect()
    }
}

fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Decimal => decode_decimal(row, idx),
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Boolean => decode_boolean(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Binary => decode_binary_col(row, idx),
        TypeCategory::Json => decode_json(row, idx),
        TypeCategory::Uuid | TypeCategory::Unknown => decode_text(row, idx),
        TypeCategory::Timestamp => decode_display::<chrono::NaiveDateTime>(row, idx),
        TypeCategory::TimestampTz => {
            decode_display::<chrono::DateTime<chrono::Utc>>(row, idx)
        }
        TypeCategory::Date => decode_display::<chrono::NaiveDate>(row, idx),
        TypeCategory::Time => decode_display::<chrono::NaiveTime>(row, idx),
    }
}

fn decode_decimal(row: &PgRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<RawDecimal>, _>(idx) {
        Ok(Some(v)) => JsonValue::String(v.0),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            tracing::error!("Failed to decode NUMERIC: {:?}", e);
            JsonValue::Null
        }
    }
}

fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
    if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
        return JsonValue::Null;
    }
    if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    JsonValue::Null
}

fn decode_boolean(row: &PgRow, idx: usize) -> JsonValue {
    row.try_get::<Option<bool>, _>(idx)
        .ok()
        .flatten()
        .map(JsonValue::Bool)
        .unwrap_or(JsonValue::Null)
}

fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()));
    }
    if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
        return serde_json::Number::from_f64(v as f64)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()));
    }
    JsonValue::Null
}

fn decode_binary_col(row: &PgRow, idx: usize) -> JsonValue {
    row.try_get::<Option<Vec<u8>>, _>(idx)
        .ok()
        .flatten()
        .map(|v| encode_binary_value(&v))
        .unwrap_or(JsonValue::Null)
}

fn decode_json(row: &PgRow, idx: usize) -> JsonValue {
    row.try_get::<Option<serde_json::Value>, _>(idx)
        .ok()
        .flatten()
        .unwrap_or(JsonValue::Null)
}

fn decode_display<T>(row: &PgRow, idx: usize) -> JsonValue
where
    T: for<'r> Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres> + ToString,
{
    row.try_get::<Option<T>, _>(idx)
        .ok()
        .flatten()
        .map(|v| JsonValue::String(v.to_string()))
        .unwrap_or(JsonValue::Null)
}

fn decode_text(row: &PgRow, idx: usize) -> JsonValue {
    row.try_get::<Option<String>, _>(idx)
        .ok()
        .flatten()
        .map(JsonValue::String)
        .unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(categorize_type("INT4"), TypeCategory::Integer);
        assert_eq!(categorize_type("BIGINT"), TypeCategory::Integer);
        assert_eq!(categorize_type("SERIAL"), TypeCategory::Integer);
        assert_eq!(categorize_type("INTERVAL"), TypeCategory::Unknown);
        assert_eq!(categorize_type("POINT"), TypeCategory::Unknown);
    }

    #[test]
    fn test_categorize_type_decimal_and_json() {
        assert_eq!(categorize_type("NUMERIC"), TypeCategory::Decimal);
        assert_eq!(categorize_type("jsonb"), TypeCategory::Json);
        assert_eq!(categorize_type("BYTEA"), TypeCategory::Binary);
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(categorize_type("TIMESTAMPTZ"), TypeCategory::TimestampTz);
        assert_eq!(categorize_type("TIMESTAMP"), TypeCategory::Timestamp);
        assert_eq!(categorize_type("DATE"), TypeCategory::Date);
        assert_eq!(categorize_type("TEXT"), TypeCategory::Unknown);
    }

    #[test]
    fn test_encode_binary_value() {
        assert_eq!(
            encode_binary_value(b"hello world"),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
        assert_eq!(encode_binary_value(&[]), JsonValue::String(String::new()));
    }
}
