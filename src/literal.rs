use base64::{engine::general_purpose, Engine as _};
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use uuid::Uuid;

use crate::protocol::ODataProtocol;

/// A primitive value that can be rendered into OData literal syntax, for entity keys and function
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ODataLiteral {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    /// Decimal digits, kept as text to avoid losing precision.
    Decimal(String),
    String(String),
    Guid(Uuid),
    Binary(Vec<u8>),
    Date(Date),
    TimeOfDay(Time),
    /// Local date-time. V4 renders it as UTC.
    DateTime(PrimitiveDateTime),
    DateTimeOffset(OffsetDateTime),
    Duration(time::Duration),
    /// Pre-rendered expression, emitted unchanged.
    Raw(String),
}

impl ODataLiteral {
    /// Render the value as an unescaped OData literal for the given protocol version.
    pub fn render(&self, protocol: ODataProtocol) -> String {
        let v2 = protocol == ODataProtocol::V2;
        match self {
            Self::Null => "null".to_owned(),
            Self::Boolean(value) => value.to_string(),
            Self::Int32(value) => value.to_string(),
            Self::Int64(value) if v2 => format!("{value}L"),
            Self::Int64(value) => value.to_string(),
            Self::Float(value) => render_floating(f64::from(*value), format!("{value:?}"), v2, 'f'),
            Self::Double(value) => render_floating(*value, format!("{value:?}"), v2, 'd'),
            Self::Decimal(digits) if v2 => format!("{digits}M"),
            Self::Decimal(digits) => digits.clone(),
            Self::String(value) => quote(value),
            Self::Guid(value) if v2 => format!("guid'{}'", value.hyphenated()),
            Self::Guid(value) => value.hyphenated().to_string(),
            Self::Binary(bytes) => format!("binary'{}'", general_purpose::STANDARD.encode(bytes)),
            Self::Date(date) if v2 => format!("datetime'{}T00:00:00'", format_date(*date)),
            Self::Date(date) => format_date(*date),
            Self::TimeOfDay(value) if v2 => {
                format!("time'{}'", iso_duration(*value - Time::MIDNIGHT))
            }
            Self::TimeOfDay(value) => format_time(*value),
            Self::DateTime(value) if v2 => format!("datetime'{}'", format_date_time(*value)),
            Self::DateTime(value) => format!("{}Z", format_date_time(*value)),
            Self::DateTimeOffset(value) if v2 => {
                format!("datetimeoffset'{}'", format_offset_date_time(*value))
            }
            Self::DateTimeOffset(value) => format_offset_date_time(*value),
            Self::Duration(value) => format!("duration'{}'", iso_duration(*value)),
            Self::Raw(expression) => expression.clone(),
        }
    }
}

fn render_floating(value: f64, debug: String, v2: bool, suffix: char) -> String {
    if value.is_nan() {
        return "NaN".to_owned();
    }
    if value.is_infinite() {
        return if value > 0.0 { "INF" } else { "-INF" }.to_owned();
    }
    if v2 {
        format!("{debug}{suffix}")
    } else {
        debug
    }
}

/// Wrap a string in single quotes, doubling embedded quotes.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

fn format_time(value: Time) -> String {
    format!(
        "{:02}:{:02}:{:02}{}",
        value.hour(),
        value.minute(),
        value.second(),
        fraction(value.nanosecond())
    )
}

fn format_date_time(value: PrimitiveDateTime) -> String {
    format!("{}T{}", format_date(value.date()), format_time(value.time()))
}

fn format_offset_date_time(value: OffsetDateTime) -> String {
    let local = PrimitiveDateTime::new(value.date(), value.time());
    format!("{}{}", format_date_time(local), format_offset(value.offset()))
}

fn format_offset(offset: UtcOffset) -> String {
    if offset.is_utc() {
        return "Z".to_owned();
    }
    let (hours, minutes, _) = offset.as_hms();
    let sign = if offset.is_negative() { '-' } else { '+' };
    format!("{sign}{:02}:{:02}", hours.unsigned_abs(), minutes.unsigned_abs())
}

fn fraction(nanos: u32) -> String {
    if nanos == 0 {
        return String::new();
    }
    let digits = format!("{nanos:09}");
    format!(".{}", digits.trim_end_matches('0'))
}

/// ISO-8601 duration with hours as the largest unit, e.g. `PT8H`, `PT1H30M`, `PT0.5S`.
pub fn iso_duration(duration: time::Duration) -> String {
    if duration.is_zero() {
        return "PT0S".to_owned();
    }
    let sign = if duration.is_negative() { "-" } else { "" };
    let duration = duration.abs();
    let total_seconds = duration.whole_seconds();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let nanos = duration.subsec_nanoseconds().unsigned_abs();

    let mut rendered = format!("{sign}PT");
    if hours != 0 {
        rendered.push_str(&format!("{hours}H"));
    }
    if minutes != 0 {
        rendered.push_str(&format!("{minutes}M"));
    }
    if seconds != 0 || nanos != 0 {
        rendered.push_str(&format!("{seconds}{}S", fraction(nanos)));
    }
    rendered
}

macro_rules! literal_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for ODataLiteral {
                fn from(value: $source) -> Self {
                    Self::$variant(value.into())
                }
            }
        )*
    };
}

literal_from!(
    bool => Boolean,
    i8 => Int32,
    i16 => Int32,
    i32 => Int32,
    u8 => Int32,
    u16 => Int32,
    u32 => Int64,
    i64 => Int64,
    f32 => Float,
    f64 => Double,
    String => String,
    &str => String,
    Uuid => Guid,
    Vec<u8> => Binary,
    &[u8] => Binary,
    Date => Date,
    Time => TimeOfDay,
    PrimitiveDateTime => DateTime,
    OffsetDateTime => DateTimeOffset,
    time::Duration => Duration,
);

impl From<std::time::Duration> for ODataLiteral {
    fn from(value: std::time::Duration) -> Self {
        match time::Duration::try_from(value) {
            Ok(duration) => Self::Duration(duration),
            Err(_) => Self::Duration(time::Duration::MAX),
        }
    }
}

impl<T: Into<ODataLiteral>> From<Option<T>> for ODataLiteral {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
