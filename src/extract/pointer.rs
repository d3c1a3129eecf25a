use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde_json::Value;

use crate::error::MeasurementError;

// ─── Parser profile ──────────────────────────────────────────────
//
//   datetime   = time | date ['T' [clock] [offset]]
//   time       = 'T' clock [offset]
//   date       = yyyy ['-' MM ['-' dd]] | yyyy '-' DDD | yyyy '-W' ww ['-' e]
//   clock      = HH [':' mm [':' ss]] [fraction]
//   fraction   = ('.' | ',') digit+          of the smallest unit present
//   offset     = 'Z' | ('+' | '-') HH [[':'] mm [':' ss]]
//
// A space is accepted in place of 'T'. Values without an offset are UTC.
// A bare time is anchored on 1970-01-01.

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Parses an ISO 8601 date-time with the fixed profile used for every
/// timestamp field. Returns `None` when the text does not match.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let mut cur = Cursor::new(text.trim());

    let date = if cur.peek_is(b"Tt") {
        NaiveDate::from_ymd_opt(1970, 1, 1)?
    } else {
        calendar_date(&mut cur)?
    };

    let mut clock = Duration::zero();
    let mut offset = Duration::zero();
    if cur.eat_any(b"Tt ") {
        if cur.peek_is(b"0123456789") {
            clock = time_of_day(&mut cur)?;
        }
        if !cur.is_done() {
            offset = zone_offset(&mut cur)?;
        }
    }
    if !cur.is_done() {
        return None;
    }

    let local: NaiveDateTime = date.and_hms_opt(0, 0, 0)?.checked_add_signed(clock)?;
    Some(local.checked_sub_signed(offset)?.and_utc())
}

fn calendar_date(cur: &mut Cursor<'_>) -> Option<NaiveDate> {
    let (year, _) = cur.digits(4, 4)?;
    let year = i32::try_from(year).ok()?;
    if !cur.eat(b'-') {
        return NaiveDate::from_ymd_opt(year, 1, 1);
    }

    if cur.eat_any(b"Ww") {
        let (week, _) = cur.digits(2, 2)?;
        let day = if cur.eat(b'-') { cur.digits(1, 1)?.0 } else { 1 };
        if !(1..=7).contains(&day) {
            return None;
        }
        let monday = NaiveDate::from_isoywd_opt(year, u32::try_from(week).ok()?, Weekday::Mon)?;
        return monday.checked_add_signed(Duration::days(i64::try_from(day - 1).ok()?));
    }

    let (value, width) = cur.digits(2, 3)?;
    let value = u32::try_from(value).ok()?;
    if width == 3 {
        return NaiveDate::from_yo_opt(year, value);
    }
    let day = if cur.eat(b'-') { cur.digits(2, 2)?.0 } else { 1 };
    NaiveDate::from_ymd_opt(year, value, u32::try_from(day).ok()?)
}

fn time_of_day(cur: &mut Cursor<'_>) -> Option<Duration> {
    let (hour, _) = cur.digits(2, 2)?;
    let mut secs = hour * 3_600;
    let mut unit: u64 = 3_600;

    if cur.eat(b':') {
        let (minute, _) = cur.digits(2, 2)?;
        secs += minute * 60;
        unit = 60;
        if cur.eat(b':') {
            let (second, _) = cur.digits(2, 2)?;
            if second > 59 {
                return None;
            }
            secs += second;
            unit = 1;
        }
        if minute > 59 {
            return None;
        }
    }
    if hour > 23 {
        return None;
    }

    let nanos = cur.fraction().map_or(0, |(numer, denom)| {
        numer * u128::from(unit) * NANOS_PER_SEC / denom
    });
    let total = u128::from(secs) * NANOS_PER_SEC + nanos;
    Some(Duration::nanoseconds(i64::try_from(total).ok()?))
}

fn zone_offset(cur: &mut Cursor<'_>) -> Option<Duration> {
    if cur.eat_any(b"Zz") {
        return Some(Duration::zero());
    }
    let negative = match cur.bump()? {
        b'+' => false,
        b'-' => true,
        _ => return None,
    };

    let (hours, _) = cur.digits(2, 2)?;
    let mut secs = hours * 3_600;
    let colon = cur.eat(b':');
    match cur.digits(2, 2) {
        Some((minutes, _)) if minutes < 60 => {
            secs += minutes * 60;
            if colon && cur.eat(b':') {
                let (seconds, _) = cur.digits(2, 2)?;
                secs += seconds;
                // sub-second offsets are ignored
                let _ = cur.fraction();
            }
        }
        Some(_) => return None,
        None if colon => return None,
        None => {}
    }
    if hours > 23 {
        return None;
    }

    let secs = i64::try_from(secs).ok()?;
    Some(Duration::seconds(if negative { -secs } else { secs }))
}

struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            rest: text.as_bytes(),
        }
    }

    fn is_done(&self) -> bool {
        self.rest.is_empty()
    }

    fn peek_is(&self, set: &[u8]) -> bool {
        self.rest.first().is_some_and(|b| set.contains(b))
    }

    fn bump(&mut self) -> Option<u8> {
        let (&first, rest) = self.rest.split_first()?;
        self.rest = rest;
        Some(first)
    }

    fn eat(&mut self, byte: u8) -> bool {
        self.eat_any(&[byte])
    }

    fn eat_any(&mut self, set: &[u8]) -> bool {
        if self.peek_is(set) {
            self.rest = &self.rest[1..];
            true
        } else {
            false
        }
    }

    /// Reads between `min` and `max` ASCII digits. Returns the value and
    /// how many digits were consumed.
    fn digits(&mut self, min: usize, max: usize) -> Option<(u64, usize)> {
        let width = self
            .rest
            .iter()
            .take(max)
            .take_while(|b| b.is_ascii_digit())
            .count();
        if width < min {
            return None;
        }
        let value = self.rest[..width]
            .iter()
            .fold(0u64, |acc, b| acc * 10 + u64::from(b - b'0'));
        self.rest = &self.rest[width..];
        Some((value, width))
    }

    /// Reads a `.` or `,` decimal fraction as `numerator / denominator`.
    /// Digits past nanosecond-of-hour precision are dropped.
    fn fraction(&mut self) -> Option<(u128, u128)> {
        if !self.peek_is(b".,") || !self.rest.get(1).is_some_and(u8::is_ascii_digit) {
            return None;
        }
        self.rest = &self.rest[1..];
        let width = self.rest.iter().take_while(|b| b.is_ascii_digit()).count();
        let (numer, denom) = self.rest[..width]
            .iter()
            .take(18)
            .fold((0u128, 1u128), |(n, d), b| (n * 10 + u128::from(b - b'0'), d * 10));
        self.rest = &self.rest[width..];
        Some((numer, denom))
    }
}

// ─── Resolver ────────────────────────────────────────────────────

/// Resolves `reference` (a JSON pointer such as `/a/s`) inside `document`
/// and parses the string found there as a timestamp.
///
/// # Errors
///
/// `FieldNotFound` when the pointer addresses nothing, `FieldNotTextual`
/// when it addresses a non-string node, `TimestampParseError` when the
/// string is not a recognised date-time.
pub fn resolve(document: &Value, reference: &str) -> Result<DateTime<Utc>, MeasurementError> {
    let node = document
        .pointer(reference)
        .ok_or_else(|| MeasurementError::FieldNotFound {
            reference: reference.to_owned(),
        })?;

    let text = node
        .as_str()
        .ok_or_else(|| MeasurementError::FieldNotTextual {
            reference: reference.to_owned(),
        })?;

    parse_timestamp(text).ok_or_else(|| MeasurementError::TimestampParseError {
        reference: reference.to_owned(),
        value: text.to_owned(),
    })
}
