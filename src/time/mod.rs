//! Calendar instants with sub-day resolution.
//!
//! The model definition tables and the evaluation interface both traffic in
//! dates: reference times of time functions, valid ranges, release dates,
//! and the epochs deformation is evaluated at. All of them are represented
//! by [Time], a thin wrapper around a naive (timezone-less) datetime - the
//! model convention is that all times are UTC.

use crate::Error;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

static DATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})(-?)(\d{2})(\d{2})$").expect("static pattern"));
static DASHED_DATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").expect("static pattern"));
static DATETIME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})-(\d{2})-(\d{2})\s+(\d{2}):(\d{2}):(\d{2})$").expect("static pattern")
});
static DECIMAL_YEAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})\.\d+$").expect("static pattern"));

/// A calendar instant. Totally ordered; an absent instant (`None` in an
/// `Option<Time>`) sorts before any present one, which is the comparison
/// rule the version tables rely on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(NaiveDateTime);

impl Time {
    /// The current wall-clock time
    pub fn now() -> Time {
        Time(chrono::Local::now().naive_local())
    }

    fn from_ymd_hms(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> Result<Time, Error> {
        let date = NaiveDate::from_ymd_opt(y, m, d)
            .ok_or_else(|| Error::InvalidValue(format!("Invalid date/time {y:04}-{m:02}-{d:02}")))?;
        let dt = date.and_hms_opt(h, mi, s).ok_or_else(|| {
            Error::InvalidValue(format!("Invalid date/time {y:04}-{m:02}-{d:02} {h:02}:{mi:02}:{s:02}"))
        })?;
        Ok(Time(dt))
    }

    /// A decimal year `Y.FFF` maps to Jan 1 of year `Y` plus the fraction of
    /// the actual length of that calendar year, to whole seconds.
    pub fn from_year(year: f64) -> Result<Time, Error> {
        let y = year.floor() as i32;
        let frac = year - year.floor();
        let d0 = NaiveDate::from_ymd_opt(y, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| Error::InvalidValue(format!("Invalid date/time {year}")))?;
        let d1 = NaiveDate::from_ymd_opt(y + 1, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| Error::InvalidValue(format!("Invalid date/time {year}")))?;
        let secs = (d1 - d0).num_seconds() as f64;
        Ok(Time(d0 + Duration::seconds((secs * frac).round() as i64)))
    }

    /// Parse a textual date/time. Empty text, `None` and the literal `0`
    /// denote an absent instant. Fails with `InvalidValue` on anything that
    /// is not one of the recognized forms.
    pub fn parse(text: &str) -> Result<Option<Time>, Error> {
        let text = text.trim();
        if text.is_empty() || text == "0" || text == "None" {
            return Ok(None);
        }
        if text.eq_ignore_ascii_case("now") {
            return Ok(Some(Time::now()));
        }

        if let Some(m) = DATE_PATTERN
            .captures(text)
            .or_else(|| DASHED_DATE_PATTERN.captures(text))
        {
            let field = |i| m.get(i).map_or("", |v| v.as_str());
            // The undashed form must not mix separators, so 2000-0101 is out
            if field(2) == "-" {
                return Err(Error::InvalidValue(format!("Invalid date/time {text}")));
            }
            let (y, mo, d) = (field(1), field(m.len() - 2), field(m.len() - 1));
            return Ok(Some(Self::from_ymd_hms(
                parse_num(y, text)?,
                parse_num(mo, text)?,
                parse_num(d, text)?,
                0,
                0,
                0,
            )?));
        }

        if let Some(m) = DATETIME_PATTERN.captures(text) {
            let field = |i| m.get(i).map_or("", |v: regex::Match| v.as_str());
            return Ok(Some(Self::from_ymd_hms(
                parse_num(field(1), text)?,
                parse_num(field(2), text)?,
                parse_num(field(3), text)?,
                parse_num(field(4), text)?,
                parse_num(field(5), text)?,
                parse_num(field(6), text)?,
            )?));
        }

        if DECIMAL_YEAR_PATTERN.is_match(text) {
            let year: f64 = text
                .parse()
                .map_err(|_| Error::InvalidValue(format!("Invalid date/time {text}")))?;
            return Ok(Some(Time::from_year(year)?));
        }

        Err(Error::InvalidValue(format!("Invalid date/time {text}")))
    }

    /// Parse a date/time that must be present
    pub fn parse_required(text: &str) -> Result<Time, Error> {
        Time::parse(text)?
            .ok_or_else(|| Error::InvalidValue(format!("Missing date/time value '{text}'")))
    }

    /// Signed number of days from `t0` to `self`, with the time-of-day part
    /// contributing fractionally
    pub fn days_after(&self, t0: Time) -> f64 {
        let delta = self.0 - t0.0;
        delta.num_seconds() as f64 / 86400.0
    }

    /// Decimal year: year plus fraction of the actual year length
    pub fn as_year(&self) -> f64 {
        let year = self.0.year();
        // Both dates are in-range by construction
        let d0 = NaiveDate::from_ymd_opt(year, 1, 1).expect("valid year start");
        let d1 = NaiveDate::from_ymd_opt(year + 1, 1, 1).expect("valid year start");
        let ndays = (d1 - d0).num_days() as f64;
        let y0 = Time(d0.and_hms_opt(0, 0, 0).expect("midnight"));
        year as f64 + self.days_after(y0) / ndays
    }

    pub fn format_as(&self, format: &str) -> String {
        self.0.format(format).to_string()
    }
}

fn parse_num<T: std::str::FromStr>(field: &str, text: &str) -> Result<T, Error> {
    field
        .parse()
        .map_err(|_| Error::InvalidValue(format!("Invalid date/time {text}")))
}

/// The default rendering is `%Y-%m-%d`
impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

// ----- T E S T S ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing() -> Result<(), Error> {
        let t = Time::parse_required("2000-01-01")?;
        assert_eq!(t.to_string(), "2000-01-01");

        let t = Time::parse_required("20000101")?;
        assert_eq!(t.to_string(), "2000-01-01");

        let t = Time::parse_required("2000-01-01 12:00:00")?;
        assert_eq!(t.format_as("%Y-%m-%d %H:%M:%S"), "2000-01-01 12:00:00");

        // Absent instants
        assert!(Time::parse("")?.is_none());
        assert!(Time::parse("0")?.is_none());

        // Decimal year: 2000 is a leap year, so .5 lands on July 2nd
        let t = Time::parse_required("2000.5")?;
        assert_eq!(t.format_as("%Y-%m-%d %H:%M"), "2000-07-02 00:00");

        assert!(Time::parse("2000-13-01").is_err());
        assert!(Time::parse("garbage").is_err());
        assert!(Time::parse("2000-0101").is_err());
        Ok(())
    }

    #[test]
    fn ordering_and_arithmetic() -> Result<(), Error> {
        let t0 = Time::parse_required("2000-01-01")?;
        let t1 = Time::parse_required("2001-01-01")?;
        assert!(t0 < t1);
        // An absent operand is less than any present instant
        assert!(None < Some(t0));

        // 2000 is a leap year
        assert_eq!(t1.days_after(t0), 366.0);
        assert_eq!(t0.days_after(t1), -366.0);

        let midday = Time::parse_required("2000-01-01 12:00:00")?;
        assert_eq!(midday.days_after(t0), 0.5);
        Ok(())
    }

    #[test]
    fn decimal_years() -> Result<(), Error> {
        let t = Time::parse_required("2001-01-01")?;
        assert_eq!(t.as_year(), 2001.0);

        let t = Time::parse_required("2001-07-02 12:00:00")?;
        assert!((t.as_year() - (2001.0 + 182.5 / 365.0)).abs() < 1e-9);

        // Round trip through from_year
        let t = Time::from_year(2010.25)?;
        assert!((t.as_year() - 2010.25).abs() < 1e-7);
        Ok(())
    }
}
