use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

pub const WEEKDAYS: [&str; 7] = ["Lunes", "Martes", "Miércoles", "Jueves", "Viernes", "Sábado", "Domingo"];

/// Local wall clock time truncated to whole seconds.
pub fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}
pub fn today() -> NaiveDate {
    now().date()
}

pub fn weekday_name(weekday: i64) -> &'static str {
    usize::try_from(weekday).ok().and_then(|ix| WEEKDAYS.get(ix)).copied().unwrap_or("?")
}

/// `YYYY-MM` key matching `strftime('%Y-%m', column)` in SQLite.
pub fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Lenient `YYYY-MM-DD` parser for filters, blank or malformed input gives `None`.
pub fn parse_date(s: Option<&str>) -> Option<NaiveDate> {
    let s = s?.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// Accepts the `datetime-local` input format with or without seconds.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    for format in ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    None
}

pub fn fdate(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}
pub fn ftime(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}
pub fn fdatetime(dt: NaiveDateTime) -> String {
    dt.format("%d/%m/%Y %H:%M").to_string()
}
/// Value for a `datetime-local` input.
pub fn input_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M").to_string()
}

/// Formats the serialized form of a date or date-time (as found in template contexts).
pub(crate) fn dtstr(iso_str: Option<&str>, with_time: bool) -> String {
    let Some(s) = iso_str else {
        return "--/--/----".to_string()
    };
    if let Some(dt) = parse_datetime(s).or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok()) {
        if with_time { fdatetime(dt) } else { fdate(dt.date()) }
    } else if let Some(d) = parse_date(Some(s)) {
        fdate(d)
    } else {
        s.to_string()
    }
}
pub(crate) fn timestr(iso_str: Option<&str>) -> String {
    let Some(s) = iso_str else {
        return "--:--".to_string()
    };
    if let Some(t) = parse_time(s) {
        ftime(t)
    } else if let Some(dt) = parse_datetime(s) {
        ftime(dt.time())
    } else {
        s.to_string()
    }
}

#[test]
fn test_dtstr() {
    for (src, with_time, expected) in &[
        ("2025-03-05", false, "05/03/2025"),
        ("2025-03-05T14:32:45", false, "05/03/2025"),
        ("2025-03-05T14:32:45", true, "05/03/2025 14:32"),
        ("2025-03-05T14:32:45.250", true, "05/03/2025 14:32"),
        ("garbage", true, "garbage"),
    ] {
        assert_eq!(&dtstr(Some(src), *with_time), expected, "source: {src}");
    }
    assert_eq!(dtstr(None, false), "--/--/----");
}
#[test]
fn test_timestr() {
    assert_eq!(timestr(Some("09:05:00")), "09:05");
    assert_eq!(timestr(Some("2025-03-05T17:30")), "17:30");
    assert_eq!(timestr(None), "--:--");
}
#[test]
fn test_parse_date_is_lenient() {
    assert_eq!(parse_date(Some("2025-01-31")), NaiveDate::from_ymd_opt(2025, 1, 31));
    assert_eq!(parse_date(Some("31/01/2025")), None);
    assert_eq!(parse_date(Some("")), None);
    assert_eq!(parse_date(None), None);
}
#[test]
fn test_weekday_name() {
    assert_eq!(weekday_name(0), "Lunes");
    assert_eq!(weekday_name(6), "Domingo");
    assert_eq!(weekday_name(7), "?");
    assert_eq!(weekday_name(-1), "?");
}
#[test]
fn test_month_key() {
    assert_eq!(month_key(NaiveDate::from_ymd_opt(2025, 3, 9).unwrap()), "2025-03");
}
