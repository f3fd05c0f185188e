// Per-type decoding of raw record slices into text values.
use bstr::ByteSlice;
use time::macros::format_description;
use time::{Date, Duration, Month, PrimitiveDateTime, Time};

/// Julian day number of day 0 of the calendar epoch (the day before 0001-01-01).
pub const JULIAN_DAY_OFFSET: i64 = 1_721_425;

/// Currency values are stored as a 64-bit integer scaled by 10^4.
const CURRENCY_SCALE: i64 = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldType {
    Character,
    Numeric,
    Float,
    Currency,
    Date,
    Timestamp,
    Double,
    Integer,
    Logical,
    Memo,
    Unknown,
}

impl FieldType {
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            b'C' => FieldType::Character,
            b'N' => FieldType::Numeric,
            b'F' => FieldType::Float,
            b'Y' => FieldType::Currency,
            b'D' => FieldType::Date,
            b'T' => FieldType::Timestamp,
            b'B' => FieldType::Double,
            b'I' => FieldType::Integer,
            b'L' => FieldType::Logical,
            b'M' => FieldType::Memo,
            _ => FieldType::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldType::Character => "character",
            FieldType::Numeric => "numeric",
            FieldType::Float => "float",
            FieldType::Currency => "currency",
            FieldType::Date => "date",
            FieldType::Timestamp => "timestamp",
            FieldType::Double => "double",
            FieldType::Integer => "integer",
            FieldType::Logical => "logical",
            FieldType::Memo => "memo",
            FieldType::Unknown => "unknown",
        }
    }

    /// Decode one field's raw bytes. Memo pointers are resolved elsewhere;
    /// unknown tags decode to empty text so row shape survives unrecognized
    /// columns.
    pub fn decode(self, raw: &[u8]) -> String {
        match self {
            FieldType::Character | FieldType::Numeric | FieldType::Float => trimmed_text(raw),
            FieldType::Currency => decode_currency(raw),
            FieldType::Date => decode_date(raw),
            FieldType::Timestamp => decode_timestamp(raw),
            FieldType::Double => decode_double(raw),
            FieldType::Integer => decode_integer(raw),
            FieldType::Logical => decode_logical(raw),
            FieldType::Memo | FieldType::Unknown => String::new(),
        }
    }
}

fn trimmed_text(raw: &[u8]) -> String {
    raw.trim().to_str_lossy().into_owned()
}

fn decode_currency(raw: &[u8]) -> String {
    let Some(value) = le_i64(raw) else {
        return String::new();
    };
    let magnitude = value.unsigned_abs();
    let units = magnitude / CURRENCY_SCALE.unsigned_abs();
    let frac = magnitude % CURRENCY_SCALE.unsigned_abs();
    let mut text = if frac == 0 {
        units.to_string()
    } else {
        let mut digits = format!("{units}.{frac:04}");
        while digits.ends_with('0') {
            digits.pop();
        }
        digits
    };
    if value < 0 {
        text.insert(0, '-');
    }
    text
}

fn decode_date(raw: &[u8]) -> String {
    let (Some(year), Some(month), Some(day)) = (raw.get(0..4), raw.get(4..6), raw.get(6..8))
    else {
        return String::new();
    };
    format!(
        "{}-{}-{}",
        year.to_str_lossy(),
        month.to_str_lossy(),
        day.to_str_lossy()
    )
}

fn decode_timestamp(raw: &[u8]) -> String {
    let (Some(day), Some(millis)) = (le_i32(raw.get(0..4)), le_i32(raw.get(4..8))) else {
        return String::new();
    };
    if day == 0 {
        return String::new();
    }
    render_timestamp(day, millis).unwrap_or_default()
}

fn render_timestamp(julian_day: i32, millis: i32) -> Option<String> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let epoch = Date::from_calendar_date(1, Month::January, 1).ok()?;
    let date = epoch.checked_add(Duration::days(i64::from(julian_day) - JULIAN_DAY_OFFSET))?;
    let stamp = PrimitiveDateTime::new(date, Time::MIDNIGHT)
        .checked_add(Duration::milliseconds(i64::from(millis)))?;
    stamp.format(format).ok()
}

fn decode_double(raw: &[u8]) -> String {
    match raw.get(0..8).and_then(|bytes| bytes.try_into().ok()) {
        Some(bytes) => f64::from_le_bytes(bytes).to_string(),
        None => String::new(),
    }
}

fn decode_integer(raw: &[u8]) -> String {
    match le_i32(raw.get(0..4)) {
        Some(value) => value.to_string(),
        None => String::new(),
    }
}

fn decode_logical(raw: &[u8]) -> String {
    let flag = raw.first().copied().unwrap_or(b' ');
    if flag == b'Y' || flag == b'T' {
        "t".to_string()
    } else {
        "f".to_string()
    }
}

fn le_i64(raw: &[u8]) -> Option<i64> {
    Some(i64::from_le_bytes(raw.get(0..8)?.try_into().ok()?))
}

fn le_i32(raw: Option<&[u8]>) -> Option<i32> {
    Some(i32::from_le_bytes(raw?.try_into().ok()?))
}
