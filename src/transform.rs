// ABOUTME: Record transformation from source rows to destination rows
// ABOUTME: Decodes MySQL values into RawCallRecord and normalizes them for fato_chamadas

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use mysql_async::{Row, Value};

use crate::model::{NormalizedCallRecord, RawCallRecord};

/// Columns read from the source table, in SELECT order.
pub const SOURCE_COLUMNS: [&str; 6] = [
    "datahora",
    "duracao",
    "fila",
    "holdtime",
    "teleatendente",
    "estado",
];

/// Outcome codes for `estado`. Anything not listed maps to [`UNKNOWN_ESTADO`].
const ESTADO_CODES: [(&str, i32); 2] = [("atendida", 1), ("abandonado", 0)];

pub const UNKNOWN_ESTADO: i32 = -1;

/// Map a raw `estado` to its numeric code.
pub fn estado_code(estado: Option<&str>) -> i32 {
    estado
        .and_then(|value| {
            ESTADO_CODES
                .iter()
                .find(|(name, _)| *name == value)
                .map(|(_, code)| *code)
        })
        .unwrap_or(UNKNOWN_ESTADO)
}

/// Normalize a raw source record into a destination row.
///
/// Pure and total: nulls in `duracao`/`holdtime` become 0, `estado` goes
/// through the closed code table, and `cob` is stamped with `region_code`.
pub fn normalize(raw: &RawCallRecord, region_code: &str) -> NormalizedCallRecord {
    NormalizedCallRecord {
        data: raw.datahora.date(),
        hora: raw.datahora.time(),
        duracao: raw.duracao.unwrap_or(0),
        fila: raw.fila.clone(),
        holdtime: raw.holdtime.unwrap_or(0),
        teleatendente: raw.teleatendente.clone(),
        estado: estado_code(raw.estado.as_deref()),
        cob: region_code.to_string(),
    }
}

/// Normalize a whole page.
pub fn normalize_batch(rows: &[RawCallRecord], region_code: &str) -> Vec<NormalizedCallRecord> {
    rows.iter().map(|raw| normalize(raw, region_code)).collect()
}

impl RawCallRecord {
    /// Decode a MySQL result row.
    ///
    /// Fails when one of [`SOURCE_COLUMNS`] is absent or holds a value that
    /// cannot be interpreted, instead of defaulting it.
    pub fn from_row(row: &Row) -> Result<Self> {
        let columns = row.columns_ref();
        Self::decode(|name| {
            columns
                .iter()
                .position(|c| c.name_str() == name)
                .and_then(|idx| row.as_ref(idx))
        })
    }

    /// Decode from a column lookup. Split out from [`RawCallRecord::from_row`]
    /// so that decoding does not depend on a live result set.
    pub fn decode<'a, F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        let column = |name: &str| {
            lookup(name).ok_or_else(|| anyhow!("Source row is missing required column '{}'", name))
        };

        let datahora = value_to_datetime(column("datahora")?).context("Invalid 'datahora'")?;
        Ok(Self {
            datahora,
            duracao: value_to_seconds(column("duracao")?).context("Invalid 'duracao'")?,
            fila: value_to_text(column("fila")?).context("Invalid 'fila'")?,
            holdtime: value_to_seconds(column("holdtime")?).context("Invalid 'holdtime'")?,
            teleatendente: value_to_text(column("teleatendente")?)
                .context("Invalid 'teleatendente'")?,
            estado: value_to_text(column("estado")?).context("Invalid 'estado'")?,
        })
    }
}

/// Interpret a DATETIME/TIMESTAMP value (binary or text protocol).
pub fn value_to_datetime(value: &Value) -> Result<NaiveDateTime> {
    match value {
        Value::Date(year, month, day, hour, minute, second, micros) => {
            NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))
                .and_then(|date| {
                    date.and_hms_micro_opt(
                        u32::from(*hour),
                        u32::from(*minute),
                        u32::from(*second),
                        *micros,
                    )
                })
                .ok_or_else(|| {
                    anyhow!(
                        "Out-of-range datetime {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                        year,
                        month,
                        day,
                        hour,
                        minute,
                        second
                    )
                })
        }
        Value::Bytes(bytes) => {
            let text = std::str::from_utf8(bytes).context("Datetime is not valid UTF-8")?;
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
                .with_context(|| format!("Cannot parse datetime '{}'", text))
        }
        Value::NULL => bail!("Datetime is NULL"),
        other => bail!("Unexpected datetime value {:?}", other),
    }
}

/// Interpret a seconds column, truncating any fractional part.
pub fn value_to_seconds(value: &Value) -> Result<Option<i32>> {
    let seconds: i64 = match value {
        Value::NULL => return Ok(None),
        Value::Int(v) => *v,
        Value::UInt(v) => i64::try_from(*v).context("Seconds value overflows")?,
        Value::Float(v) => truncate_float(f64::from(*v))?,
        Value::Double(v) => truncate_float(*v)?,
        Value::Bytes(bytes) => {
            let text = std::str::from_utf8(bytes).context("Seconds value is not valid UTF-8")?;
            let text = text.trim();
            match text.parse::<i64>() {
                Ok(v) => v,
                Err(_) => truncate_float(
                    text.parse::<f64>()
                        .with_context(|| format!("Cannot parse seconds '{}'", text))?,
                )?,
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, _micros) => {
            let total = i64::from(*days) * 86_400
                + i64::from(*hours) * 3_600
                + i64::from(*minutes) * 60
                + i64::from(*seconds);
            if *negative {
                -total
            } else {
                total
            }
        }
        other => bail!("Unexpected seconds value {:?}", other),
    };

    i32::try_from(seconds)
        .map(Some)
        .with_context(|| format!("Seconds value {} does not fit INTEGER", seconds))
}

fn truncate_float(value: f64) -> Result<i64> {
    if !value.is_finite() {
        bail!("Seconds value {} is not finite", value);
    }
    Ok(value.trunc() as i64)
}

/// Interpret a text column. Integer codes are rendered as text.
pub fn value_to_text(value: &Value) -> Result<Option<String>> {
    match value {
        Value::NULL => Ok(None),
        Value::Bytes(bytes) => String::from_utf8(bytes.clone())
            .map(Some)
            .context("Text value is not valid UTF-8"),
        Value::Int(v) => Ok(Some(v.to_string())),
        Value::UInt(v) => Ok(Some(v.to_string())),
        other => bail!("Unexpected text value {:?}", other),
    }
}

/// Encode a timestamp as a MySQL query parameter.
pub fn datetime_to_value(ts: &NaiveDateTime) -> Value {
    use chrono::{Datelike, Timelike};

    Value::Date(
        ts.year() as u16,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
        ts.nanosecond() / 1_000,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use std::collections::HashMap;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn raw(estado: Option<&str>) -> RawCallRecord {
        RawCallRecord {
            datahora: ts("2024-01-01 10:00:00"),
            duracao: Some(30),
            fila: Some("10".to_string()),
            holdtime: Some(2),
            teleatendente: Some("X".to_string()),
            estado: estado.map(str::to_string),
        }
    }

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    #[test]
    fn test_estado_mapping() {
        assert_eq!(estado_code(Some("atendida")), 1);
        assert_eq!(estado_code(Some("abandonado")), 0);
        assert_eq!(estado_code(None), -1);
        assert_eq!(estado_code(Some("")), -1);
        assert_eq!(estado_code(Some("transferida")), -1);
        // Case matters: the table is closed and exact.
        assert_eq!(estado_code(Some("ATENDIDA")), -1);
    }

    #[test]
    fn test_normalize_splits_datahora_and_stamps_cob() {
        let record = normalize(&raw(Some("atendida")), "52");

        assert_eq!(record.data, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(record.hora, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        assert_eq!(record.duracao, 30);
        assert_eq!(record.holdtime, 2);
        assert_eq!(record.fila.as_deref(), Some("10"));
        assert_eq!(record.teleatendente.as_deref(), Some("X"));
        assert_eq!(record.estado, 1);
        assert_eq!(record.cob, "52");
    }

    #[test]
    fn test_normalize_null_durations_become_zero() {
        let mut source = raw(None);
        source.duracao = None;
        source.holdtime = None;

        let record = normalize(&source, "52");
        assert_eq!(record.duracao, 0);
        assert_eq!(record.holdtime, 0);
        assert_eq!(record.estado, -1);

        source.duracao = Some(7);
        source.holdtime = Some(7);
        let record = normalize(&source, "52");
        assert_eq!(record.duracao, 7);
        assert_eq!(record.holdtime, 7);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let source = raw(Some("abandonado"));
        assert_eq!(normalize(&source, "52"), normalize(&source, "52"));
    }

    #[test]
    fn test_value_to_datetime() {
        assert_eq!(
            value_to_datetime(&Value::Date(2024, 1, 1, 10, 0, 0, 0)).unwrap(),
            ts("2024-01-01 10:00:00")
        );
        assert_eq!(
            value_to_datetime(&bytes("2024-01-01 10:00:00")).unwrap(),
            ts("2024-01-01 10:00:00")
        );
        let fractional = value_to_datetime(&bytes("2024-01-01 10:00:00.250000")).unwrap();
        assert_eq!(fractional.date(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());

        assert!(value_to_datetime(&Value::NULL).is_err());
        assert!(value_to_datetime(&Value::Date(0, 0, 0, 0, 0, 0, 0)).is_err());
        assert!(value_to_datetime(&bytes("yesterday")).is_err());
    }

    #[test]
    fn test_value_to_seconds_truncates() {
        assert_eq!(value_to_seconds(&Value::NULL).unwrap(), None);
        assert_eq!(value_to_seconds(&Value::Int(7)).unwrap(), Some(7));
        assert_eq!(value_to_seconds(&Value::UInt(7)).unwrap(), Some(7));
        assert_eq!(value_to_seconds(&Value::Double(7.9)).unwrap(), Some(7));
        assert_eq!(value_to_seconds(&bytes("12")).unwrap(), Some(12));
        assert_eq!(value_to_seconds(&bytes("12.75")).unwrap(), Some(12));
        assert_eq!(
            value_to_seconds(&Value::Time(false, 0, 1, 2, 3, 500_000)).unwrap(),
            Some(3_723)
        );

        assert!(value_to_seconds(&bytes("abc")).is_err());
        assert!(value_to_seconds(&Value::Int(i64::MAX)).is_err());
        assert!(value_to_seconds(&Value::Double(f64::NAN)).is_err());
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&Value::NULL).unwrap(), None);
        assert_eq!(value_to_text(&bytes("10")).unwrap(), Some("10".to_string()));
        assert_eq!(value_to_text(&Value::Int(10)).unwrap(), Some("10".to_string()));
        assert!(value_to_text(&Value::Double(1.0)).is_err());
    }

    #[test]
    fn test_decode_row() {
        let mut values = HashMap::new();
        values.insert("datahora", bytes("2024-01-01 10:00:00"));
        values.insert("duracao", Value::NULL);
        values.insert("fila", bytes("10"));
        values.insert("holdtime", Value::Int(5));
        values.insert("teleatendente", bytes("X"));
        values.insert("estado", bytes("atendida"));

        let record = RawCallRecord::decode(|name| values.get(name)).unwrap();
        assert_eq!(record.datahora, ts("2024-01-01 10:00:00"));
        assert_eq!(record.duracao, None);
        assert_eq!(record.holdtime, Some(5));
        assert_eq!(record.estado.as_deref(), Some("atendida"));
    }

    #[test]
    fn test_decode_missing_column_fails() {
        let mut values = HashMap::new();
        values.insert("datahora", bytes("2024-01-01 10:00:00"));
        values.insert("duracao", Value::NULL);

        let err = RawCallRecord::decode(|name| values.get(name)).unwrap_err();
        assert!(err.to_string().contains("missing required column 'fila'"));
    }

    #[test]
    fn test_datetime_to_value() {
        let value = datetime_to_value(&ts("2024-02-29 23:59:58"));
        assert_eq!(value, Value::Date(2024, 2, 29, 23, 59, 58, 0));
        assert_eq!(value_to_datetime(&value).unwrap(), ts("2024-02-29 23:59:58"));
    }
}
