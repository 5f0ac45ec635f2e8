use std::fmt;

use crate::error::{Error, Result};

/// A point in time as recorded on an optical disc image: a local
/// wall-clock reading plus the UTC offset it was recorded against.
///
/// Both ISO 9660's 7-byte short form and UDF's 16-bit-year form reduce to
/// this shape; no timezone database lookups or calendar arithmetic are
/// needed anywhere in this crate; the library never converts between
/// offsets, it only formats and compares the fields it was given.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Timestamp {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// UTC offset in minutes; ISO 9660 quantizes this to multiples of 15,
    /// UDF carries it directly.
    pub utc_offset_minutes: i32,
}
impl Timestamp {
    /// Decodes the 7-byte ISO 9660 "short" timestamp: year-since-1900,
    /// month, day, hour, minute, second, then a signed count of 15-minute
    /// units for the timezone offset.
    pub(crate) fn from_iso9660_short(buf: &[u8; 7]) -> Self {
        Self {
            year: 1900 + i32::from(buf[0]),
            month: buf[1],
            day: buf[2],
            hour: buf[3],
            minute: buf[4],
            second: buf[5],
            utc_offset_minutes: i32::from(buf[6] as i8) * 15,
        }
    }

    /// Decodes a UDF timestamp: full 16-bit year, then month/day/hour/
    /// minute/second, with a signed 12-bit offset in minutes from UTC
    /// (`0x0FFF` marks "not specified", treated here as UTC).
    pub(crate) fn from_udf(
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        type_and_timezone: u16,
    ) -> Self {
        let raw_offset = type_and_timezone & 0x0FFF;
        let utc_offset_minutes = if raw_offset == 0x0FFF {
            0
        } else {
            // sign-extend a 12-bit value
            let signed = if raw_offset & 0x0800 != 0 {
                (raw_offset as i32) - 0x1000
            } else {
                raw_offset as i32
            };
            signed
        };
        Self {
            year: i32::from(year),
            month,
            day,
            hour,
            minute,
            second,
            utc_offset_minutes,
        }
    }

    /// Decodes Rock Ridge TF's LONG_FORM timestamp: 17 ASCII digits giving
    /// year/month/day/hour/minute/second/centisecond, followed by a signed
    /// byte counting 15-minute offset units, mirroring the `dec_datetime`
    /// layout ECMA-119 uses for the volume descriptor creation/modification
    /// dates.
    pub(crate) fn from_rockridge_long(buf: &[u8]) -> Result<Self> {
        if buf.len() < 17 {
            return Err(Error::MalformedDescriptor {
                reason: "Rock Ridge long-form timestamp shorter than 17 bytes".to_string(),
            });
        }
        let digit_field = |range: std::ops::Range<usize>| -> Result<i32> {
            std::str::from_utf8(&buf[range.clone()])
                .ok()
                .and_then(|s| s.parse::<i32>().ok())
                .ok_or_else(|| Error::MalformedDescriptor {
                    reason: "Rock Ridge long-form timestamp contains non-ASCII-digit bytes".to_string(),
                })
        };
        Ok(Self {
            year: digit_field(0..4)?,
            month: digit_field(4..6)? as u8,
            day: digit_field(6..8)? as u8,
            hour: digit_field(8..10)? as u8,
            minute: digit_field(10..12)? as u8,
            second: digit_field(12..14)? as u8,
            utc_offset_minutes: i32::from(buf[16] as i8) * 15,
        })
    }
}
impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.utc_offset_minutes < 0 { '-' } else { '+' };
        let abs_offset = self.utc_offset_minutes.unsigned_abs();
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}{}{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second,
            sign, abs_offset / 60, abs_offset % 60,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_iso9660_short_timestamp() {
        // 2024-03-08T17:44:08+01:00
        let buf = [124, 3, 8, 17, 44, 8, 4];
        let ts = Timestamp::from_iso9660_short(&buf);
        assert_eq!(ts.to_string(), "2024-03-08T17:44:08+01:00");
    }

    #[test]
    fn decodes_udf_timestamp_with_negative_offset() {
        let raw_offset: u16 = (-300i32 as u16) & 0x0FFF;
        let ts = Timestamp::from_udf(2024, 3, 8, 17, 44, 8, raw_offset);
        assert_eq!(ts.utc_offset_minutes, -300);
        assert_eq!(ts.to_string(), "2024-03-08T17:44:08-05:00");
    }

    #[test]
    fn udf_unspecified_offset_defaults_to_utc() {
        let ts = Timestamp::from_udf(2024, 1, 1, 0, 0, 0, 0x0FFF);
        assert_eq!(ts.utc_offset_minutes, 0);
    }

    #[test]
    fn decodes_rockridge_long_form_timestamp() {
        let mut buf = *b"20240308174408004";
        buf[16] = 4; // +1:00 in 15-minute units
        let ts = Timestamp::from_rockridge_long(&buf).unwrap();
        assert_eq!(ts.to_string(), "2024-03-08T17:44:08+01:00");
    }

    #[test]
    fn rockridge_long_form_rejects_short_buffers() {
        assert!(Timestamp::from_rockridge_long(&[0u8; 10]).is_err());
    }
}
