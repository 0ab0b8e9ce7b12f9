//! Column types and row value decoding
//!
//! Values are laid out back to back in a rows event; each column's width
//! depends on its binlog type code and the per-column metadata from the
//! TABLE_MAP event. Signedness and text/binary come from the cached schema.

use super::reader::ByteReader;
use crate::error::DecodeError;
use crate::schema::ColumnSchema;
use std::fmt;

/// Binlog column type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Decimal,
            1 => Self::Tiny,
            2 => Self::Short,
            3 => Self::Long,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::Null,
            7 => Self::Timestamp,
            8 => Self::LongLong,
            9 => Self::Int24,
            10 => Self::Date,
            11 => Self::Time,
            12 => Self::DateTime,
            13 => Self::Year,
            14 => Self::NewDate,
            15 => Self::Varchar,
            16 => Self::Bit,
            17 => Self::Timestamp2,
            18 => Self::DateTime2,
            19 => Self::Time2,
            245 => Self::Json,
            246 => Self::NewDecimal,
            247 => Self::Enum,
            248 => Self::Set,
            249 => Self::TinyBlob,
            250 => Self::MediumBlob,
            251 => Self::LongBlob,
            252 => Self::Blob,
            253 => Self::VarString,
            254 => Self::String,
            255 => Self::Geometry,
            _ => return None,
        })
    }

    /// Read this type's TABLE_MAP metadata.
    pub(crate) fn read_metadata(self, r: &mut ByteReader<'_>) -> Result<u16, DecodeError> {
        Ok(match self {
            Self::Float
            | Self::Double
            | Self::Blob
            | Self::TinyBlob
            | Self::MediumBlob
            | Self::LongBlob
            | Self::Json
            | Self::Geometry
            | Self::Time2
            | Self::DateTime2
            | Self::Timestamp2 => u16::from(r.u8()?),
            Self::Bit | Self::Varchar | Self::VarString => r.u16_le()?,
            // (real_type, length) and (precision, scale) pairs
            Self::NewDecimal | Self::String | Self::Enum | Self::Set => {
                let hi = u16::from(r.u8()?);
                let lo = u16::from(r.u8()?);
                (hi << 8) | lo
            }
            _ => 0,
        })
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    SignedInt(i64),
    UnsignedInt(u64),
    Float(f32),
    Double(f64),
    /// Exact decimal rendered as text
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        negative: bool,
        hours: u16,
        minutes: u8,
        seconds: u8,
        micros: u32,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micros: u32,
    },
    /// Seconds since the Unix epoch, UTC
    Timestamp {
        seconds: u32,
        micros: u32,
    },
    Year(u16),
    /// 1-based index into the ENUM member list
    Enum(u16),
    /// Bitmask over the SET member list
    Set(u64),
    /// Big-endian bit string
    Bit(Vec<u8>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Temporal values print in MariaDB's literal format.
impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::SignedInt(v) => write!(f, "{v}"),
            Self::UnsignedInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Decimal(v) | Self::String(v) => f.write_str(v),
            Self::Bytes(b) | Self::Bit(b) => {
                f.write_str("0x")?;
                b.iter().try_for_each(|byte| write!(f, "{byte:02X}"))
            }
            Self::Date { year, month, day } => write!(f, "{year:04}-{month:02}-{day:02}"),
            Self::Time {
                negative,
                hours,
                minutes,
                seconds,
                micros,
            } => {
                let sign = if *negative { "-" } else { "" };
                write!(f, "{sign}{hours:02}:{minutes:02}:{seconds:02}")?;
                write_micros(f, *micros)
            }
            Self::DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
                micros,
            } => {
                write!(
                    f,
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
                )?;
                write_micros(f, *micros)
            }
            Self::Timestamp { seconds, micros } => {
                let (year, month, day) = civil_from_days(i64::from(*seconds) / 86_400);
                let tod = seconds % 86_400;
                write!(
                    f,
                    "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}",
                    tod / 3600,
                    (tod % 3600) / 60,
                    tod % 60
                )?;
                write_micros(f, *micros)
            }
            Self::Year(y) => write!(f, "{y:04}"),
            Self::Enum(v) => write!(f, "{v}"),
            Self::Set(v) => write!(f, "{v}"),
        }
    }
}

fn write_micros(f: &mut fmt::Formatter<'_>, micros: u32) -> fmt::Result {
    if micros > 0 {
        write!(f, ".{micros:06}")?;
    }
    Ok(())
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
pub(crate) fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = i64::from(yoe) + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn int_value(raw: u64, width_bits: u32, unsigned: bool) -> ColumnValue {
    if unsigned {
        ColumnValue::UnsignedInt(raw)
    } else {
        let shift = 64 - width_bits;
        ColumnValue::SignedInt(((raw << shift) as i64) >> shift)
    }
}

fn text_or_bytes(bytes: &[u8], column: &ColumnSchema) -> ColumnValue {
    if column.is_binary() {
        ColumnValue::Bytes(bytes.to_vec())
    } else {
        ColumnValue::String(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Fractional seconds of TIME2/DATETIME2/TIMESTAMP2, in microseconds.
fn read_fraction(r: &mut ByteReader<'_>, fsp: u16) -> Result<u32, DecodeError> {
    Ok(match fsp {
        0 => 0,
        1 | 2 => r.uint_be(1)? as u32 * 10_000,
        3 | 4 => r.uint_be(2)? as u32 * 100,
        5 | 6 => r.uint_be(3)? as u32,
        other => {
            return Err(DecodeError::malformed(format!(
                "fractional precision {other} out of range"
            )))
        }
    })
}

/// Decode one non-NULL column value.
pub(crate) fn decode_value(
    r: &mut ByteReader<'_>,
    col_type: ColumnType,
    metadata: u16,
    column: &ColumnSchema,
) -> Result<ColumnValue, DecodeError> {
    let unsigned = column.unsigned;
    Ok(match col_type {
        ColumnType::Tiny => int_value(r.uint_le(1)?, 8, unsigned),
        ColumnType::Short => int_value(r.uint_le(2)?, 16, unsigned),
        ColumnType::Int24 => int_value(r.uint_le(3)?, 24, unsigned),
        ColumnType::Long => int_value(r.uint_le(4)?, 32, unsigned),
        ColumnType::LongLong => int_value(r.uint_le(8)?, 64, unsigned),
        ColumnType::Float => ColumnValue::Float(r.f32_le()?),
        ColumnType::Double => ColumnValue::Double(r.f64_le()?),
        ColumnType::Null => ColumnValue::Null,
        ColumnType::Year => {
            let y = r.u8()?;
            ColumnValue::Year(if y == 0 { 0 } else { u16::from(y) + 1900 })
        }
        ColumnType::Date | ColumnType::NewDate => {
            let packed = r.uint_le(3)?;
            ColumnValue::Date {
                year: ((packed >> 9) & 0x7FFF) as u16,
                month: ((packed >> 5) & 0x0F) as u8,
                day: (packed & 0x1F) as u8,
            }
        }
        ColumnType::Time => {
            let raw = r.uint_le(3)?;
            let signed = ((raw << 40) as i64) >> 40;
            let v = signed.unsigned_abs();
            ColumnValue::Time {
                negative: signed < 0,
                hours: (v / 10_000) as u16,
                minutes: ((v / 100) % 100) as u8,
                seconds: (v % 100) as u8,
                micros: 0,
            }
        }
        ColumnType::DateTime => {
            let v = r.u64_le()?;
            ColumnValue::DateTime {
                year: (v / 10_000_000_000) as u16,
                month: ((v / 100_000_000) % 100) as u8,
                day: ((v / 1_000_000) % 100) as u8,
                hour: ((v / 10_000) % 100) as u8,
                minute: ((v / 100) % 100) as u8,
                second: (v % 100) as u8,
                micros: 0,
            }
        }
        ColumnType::Timestamp => ColumnValue::Timestamp {
            seconds: r.u32_le()?,
            micros: 0,
        },
        ColumnType::Timestamp2 => {
            let seconds = r.uint_be(4)? as u32;
            let micros = read_fraction(r, metadata)?;
            ColumnValue::Timestamp { seconds, micros }
        }
        ColumnType::DateTime2 => {
            let packed = r.uint_be(5)?;
            let micros = read_fraction(r, metadata)?;
            let year_month = (packed >> 22) & 0x1_FFFF;
            ColumnValue::DateTime {
                year: (year_month / 13) as u16,
                month: (year_month % 13) as u8,
                day: ((packed >> 17) & 0x1F) as u8,
                hour: ((packed >> 12) & 0x1F) as u8,
                minute: ((packed >> 6) & 0x3F) as u8,
                second: (packed & 0x3F) as u8,
                micros,
            }
        }
        ColumnType::Time2 => decode_time2(r, metadata)?,
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if metadata < 256 {
                r.uint_le(1)?
            } else {
                r.uint_le(2)?
            };
            text_or_bytes(r.take(len as usize)?, column)
        }
        ColumnType::String | ColumnType::Enum | ColumnType::Set => {
            decode_string_family(r, col_type, metadata, column)?
        }
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Geometry => {
            let width = match metadata {
                1..=4 => metadata as usize,
                other => {
                    return Err(DecodeError::malformed(format!(
                        "blob length width {other} on column {}",
                        column.name
                    )))
                }
            };
            let len = r.uint_le(width)? as usize;
            let bytes = r.take(len)?;
            if col_type == ColumnType::Geometry {
                ColumnValue::Bytes(bytes.to_vec())
            } else {
                text_or_bytes(bytes, column)
            }
        }
        ColumnType::NewDecimal => {
            let precision = (metadata >> 8) as usize;
            let scale = (metadata & 0xFF) as usize;
            ColumnValue::Decimal(decode_decimal(r, precision, scale)?)
        }
        ColumnType::Bit => {
            let nbits = ((metadata >> 8) * 8 + (metadata & 0xFF)) as usize;
            ColumnValue::Bit(r.take(nbits.div_ceil(8))?.to_vec())
        }
        ColumnType::Decimal | ColumnType::Json => {
            return Err(DecodeError::unsupported(format!(
                "column type {:?} on column {}",
                col_type, column.name
            )))
        }
    })
}

/// CHAR, BINARY, ENUM and SET all arrive as `String` with the real type
/// folded into the metadata.
fn decode_string_family(
    r: &mut ByteReader<'_>,
    col_type: ColumnType,
    metadata: u16,
    column: &ColumnSchema,
) -> Result<ColumnValue, DecodeError> {
    let mut real_type = metadata >> 8;
    let mut max_len = metadata & 0xFF;
    if col_type == ColumnType::String && real_type != 0 && (real_type & 0x30) != 0x30 {
        max_len |= ((real_type & 0x30) ^ 0x30) << 4;
        real_type |= 0x30;
    }
    let real_type = if col_type == ColumnType::String {
        ColumnType::from_u8(real_type as u8).unwrap_or(ColumnType::String)
    } else {
        col_type
    };

    Ok(match real_type {
        ColumnType::Enum => ColumnValue::Enum(r.uint_le(max_len.clamp(1, 2) as usize)? as u16),
        ColumnType::Set => ColumnValue::Set(r.uint_le(max_len.clamp(1, 8) as usize)?),
        _ => {
            let len = if max_len > 255 {
                r.uint_le(2)?
            } else {
                r.uint_le(1)?
            };
            text_or_bytes(r.take(len as usize)?, column)
        }
    })
}

fn decode_time2(r: &mut ByteReader<'_>, fsp: u16) -> Result<ColumnValue, DecodeError> {
    const OFFSET_24: i64 = 0x80_0000;
    let packed: i64 = match fsp {
        0 => (r.uint_be(3)? as i64 - OFFSET_24) << 24,
        1 | 2 => {
            let mut int_part = r.uint_be(3)? as i64 - OFFSET_24;
            let mut frac = i64::from(r.u8()? as i8);
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = r.uint_be(3)? as i64 - OFFSET_24;
            let mut frac = i64::from(r.uint_be(2)? as u16 as i16);
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x1_0000;
            }
            (int_part << 24) + frac * 100
        }
        5 | 6 => r.uint_be(6)? as i64 - 0x8000_0000_0000,
        other => {
            return Err(DecodeError::malformed(format!(
                "fractional precision {other} out of range"
            )))
        }
    };

    let negative = packed < 0;
    let v = packed.unsigned_abs();
    let hms = v >> 24;
    Ok(ColumnValue::Time {
        negative,
        hours: ((hms >> 12) & 0x3FF) as u16,
        minutes: ((hms >> 6) & 0x3F) as u8,
        seconds: (hms & 0x3F) as u8,
        micros: (v & 0xFF_FFFF) as u32,
    })
}

const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// Binary NEWDECIMAL to text. Groups of nine digits are stored in four
/// big-endian bytes; the sign is the inverted top bit and negative values
/// are stored one's-complemented.
fn decode_decimal(
    r: &mut ByteReader<'_>,
    precision: usize,
    scale: usize,
) -> Result<String, DecodeError> {
    if precision == 0 || scale > precision {
        return Err(DecodeError::malformed(format!(
            "decimal({precision},{scale})"
        )));
    }
    let int_digits = precision - scale;
    let int_words = int_digits / 9;
    let int_leftover = int_digits % 9;
    let frac_words = scale / 9;
    let frac_leftover = scale % 9;

    let total = DIG_TO_BYTES[int_leftover]
        + int_words * 4
        + frac_words * 4
        + DIG_TO_BYTES[frac_leftover];
    let mut bytes = r.take(total)?.to_vec();

    let negative = (bytes[0] & 0x80) == 0;
    bytes[0] ^= 0x80;
    if negative {
        bytes.iter_mut().for_each(|b| *b = !*b);
    }

    let mut digits = ByteReader::new(&bytes, "decimal");
    let mut int_part = String::new();

    if int_leftover > 0 {
        let val = digits.uint_be(DIG_TO_BYTES[int_leftover])?;
        if val > 0 {
            int_part.push_str(&val.to_string());
        }
    }
    for _ in 0..int_words {
        let val = digits.uint_be(4)?;
        if int_part.is_empty() {
            if val > 0 {
                int_part.push_str(&val.to_string());
            }
        } else {
            int_part.push_str(&format!("{val:09}"));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut result = String::with_capacity(precision + 2);
    if negative {
        result.push('-');
    }
    result.push_str(&int_part);

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            result.push_str(&format!("{:09}", digits.uint_be(4)?));
        }
        if frac_leftover > 0 {
            let val = digits.uint_be(DIG_TO_BYTES[frac_leftover])?;
            result.push_str(&format!("{val:0width$}", width = frac_leftover));
        }
    }

    Ok(result)
}
