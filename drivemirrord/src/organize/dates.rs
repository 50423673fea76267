use std::sync::LazyLock;

use drivemirror_core::DriveItem;
use regex::{Captures, Regex};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, Time};

/// Bucket used for dates outside the requested year window.
pub const FALLBACK_PLACEMENT: Placement = Placement { year: 2000, month: 1 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DateSource {
    /// `YYYYMMDD_HHMMSS` in the file name.
    FilenameTimestamp,
    /// `YYYY-MM-DD` in the file name.
    FilenameDashed,
    /// Bare `YYYYMMDD` in the file name.
    FilenameCompact,
    PhotoTaken,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDate {
    pub date: Date,
    pub source: DateSource,
}

static FILENAME_PATTERNS: LazyLock<Vec<(DateSource, Regex)>> = LazyLock::new(|| {
    [
        (
            DateSource::FilenameTimestamp,
            r"(?P<y>[0-9]{4})(?P<m>[0-9]{2})(?P<d>[0-9]{2})_(?P<hh>[0-9]{2})(?P<mm>[0-9]{2})(?P<ss>[0-9]{2})",
        ),
        (
            DateSource::FilenameDashed,
            r"(?P<y>[0-9]{4})-(?P<m>[0-9]{2})-(?P<d>[0-9]{2})",
        ),
        (
            DateSource::FilenameCompact,
            r"(?P<y>[0-9]{4})(?P<m>[0-9]{2})(?P<d>[0-9]{2})",
        ),
    ]
    .into_iter()
    .filter_map(|(source, pattern)| Regex::new(pattern).ok().map(|re| (source, re)))
    .collect()
});

/// Walks the heuristics in order and returns the first that yields a real
/// calendar date. File-name matches that are not valid dates fall through.
pub fn resolve_date(item: &DriveItem) -> Option<ResolvedDate> {
    let name = item.name.as_deref().unwrap_or_default();
    for (source, pattern) in FILENAME_PATTERNS.iter() {
        if let Some(date) = first_date(pattern, name) {
            return Some(ResolvedDate {
                date,
                source: *source,
            });
        }
    }

    let taken = item
        .photo
        .as_ref()
        .and_then(|photo| photo.taken_date_time.as_deref());
    if let Some(date) = taken.and_then(date_from_timestamp) {
        return Some(ResolvedDate {
            date,
            source: DateSource::PhotoTaken,
        });
    }

    item.created_date_time
        .as_deref()
        .and_then(date_from_timestamp)
        .map(|date| ResolvedDate {
            date,
            source: DateSource::Created,
        })
}

// Digit runs must not continue on either side. Every start position is tried,
// so an invalid candidate never hides a later valid one.
fn first_date(pattern: &Regex, name: &str) -> Option<Date> {
    let bytes = name.as_bytes();
    let mut start = 0;
    while start < name.len() {
        let caps = pattern.captures_at(name, start)?;
        let whole = caps.get(0)?;
        let digit_before = whole
            .start()
            .checked_sub(1)
            .and_then(|at| bytes.get(at))
            .is_some_and(u8::is_ascii_digit);
        let digit_after = bytes.get(whole.end()).is_some_and(u8::is_ascii_digit);
        if !digit_before && !digit_after {
            if let Some(date) = date_from(&caps) {
                return Some(date);
            }
        }
        start = whole.start() + 1;
    }
    None
}

fn date_from(caps: &Captures<'_>) -> Option<Date> {
    let number = |name: &str| caps.name(name)?.as_str().parse::<u16>().ok();
    if caps.name("hh").is_some() {
        let (h, m, s) = (number("hh")?, number("mm")?, number("ss")?);
        Time::from_hms(u8::try_from(h).ok()?, u8::try_from(m).ok()?, u8::try_from(s).ok()?)
            .ok()?;
    }
    let month = Month::try_from(u8::try_from(number("m")?).ok()?).ok()?;
    let day = u8::try_from(number("d")?).ok()?;
    Date::from_calendar_date(i32::from(number("y")?), month, day).ok()
}

fn date_from_timestamp(value: &str) -> Option<Date> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|parsed| parsed.date())
}

/// Year/month bucket an item is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Placement {
    pub year: i32,
    pub month: u8,
}

impl Placement {
    pub fn for_date(date: Date, start_year: i32, end_year: i32) -> Self {
        if (start_year..=end_year).contains(&date.year()) {
            Self {
                year: date.year(),
                month: u8::from(date.month()),
            }
        } else {
            FALLBACK_PLACEMENT
        }
    }

    pub fn year_folder(&self) -> String {
        format!("{:04}", self.year)
    }

    pub fn month_folder(&self) -> String {
        format!("{:02}", self.month)
    }

    /// `"YYYY/MM"`, relative to the source folder.
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.year_folder(), self.month_folder())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivemirror_core::PhotoFacet;
    use time::macros::date;

    fn item(name: &str, taken: Option<&str>, created: Option<&str>) -> DriveItem {
        DriveItem {
            id: "x".into(),
            name: Some(name.into()),
            created_date_time: created.map(Into::into),
            photo: taken.map(|taken| PhotoFacet {
                taken_date_time: Some(taken.into()),
                camera_model: None,
            }),
            ..DriveItem::default()
        }
    }

    #[test]
    fn filename_timestamp_beats_embedded_and_created_dates() {
        let resolved = resolve_date(&item(
            "IMG_20230115_120000.jpg",
            Some("2019-05-05T10:00:00Z"),
            Some("2018-02-02T10:00:00Z"),
        ))
        .unwrap();
        assert_eq!(resolved.date, date!(2023 - 01 - 15));
        assert_eq!(resolved.source, DateSource::FilenameTimestamp);
    }

    #[test]
    fn dashed_and_compact_filename_dates() {
        let dashed = resolve_date(&item("Screenshot 2021-07-04 at 10.00.png", None, None)).unwrap();
        assert_eq!(dashed.date, date!(2021 - 07 - 04));
        assert_eq!(dashed.source, DateSource::FilenameDashed);

        let compact = resolve_date(&item("scan20190312.pdf", None, None)).unwrap();
        assert_eq!(compact.date, date!(2019 - 03 - 12));
        assert_eq!(compact.source, DateSource::FilenameCompact);
    }

    #[test]
    fn invalid_filename_dates_fall_through() {
        let bad_time = resolve_date(&item("IMG_20230115_256199.jpg", None, None)).unwrap();
        assert_eq!(bad_time.source, DateSource::FilenameCompact);
        assert_eq!(bad_time.date, date!(2023 - 01 - 15));

        let bad_day = resolve_date(&item(
            "VID_20230230.mp4",
            None,
            Some("2022-12-31T23:00:00Z"),
        ))
        .unwrap();
        assert_eq!(bad_day.source, DateSource::Created);
        assert_eq!(bad_day.date, date!(2022 - 12 - 31));
    }

    #[test]
    fn invalid_candidate_does_not_hide_a_later_date() {
        let resolved = resolve_date(&item(
            "20231301_20230115.jpg",
            None,
            Some("2022-12-31T23:00:00Z"),
        ))
        .unwrap();
        assert_eq!(resolved.source, DateSource::FilenameCompact);
        assert_eq!(resolved.date, date!(2023 - 01 - 15));

        let dashed = resolve_date(&item("2023-13-01 and 2023-02-03.png", None, None)).unwrap();
        assert_eq!(dashed.source, DateSource::FilenameDashed);
        assert_eq!(dashed.date, date!(2023 - 02 - 03));
    }

    #[test]
    fn longer_digit_runs_are_not_dates() {
        let resolved = resolve_date(&item("order_1234567890.txt", None, None));
        assert_eq!(resolved, None);
    }

    #[test]
    fn photo_taken_then_created_timestamps() {
        let photo = resolve_date(&item(
            "holiday.jpg",
            Some("2020-08-01T09:30:00Z"),
            Some("2024-01-01T00:00:00Z"),
        ))
        .unwrap();
        assert_eq!(photo.source, DateSource::PhotoTaken);
        assert_eq!(photo.date, date!(2020 - 08 - 01));

        let created = resolve_date(&item("holiday.jpg", Some("unknown"), Some("2024-01-01T00:00:00Z")))
            .unwrap();
        assert_eq!(created.source, DateSource::Created);

        assert_eq!(resolve_date(&item("holiday.jpg", None, None)), None);
    }

    #[test]
    fn placement_remaps_out_of_window_years() {
        let inside = Placement::for_date(date!(2023 - 01 - 15), 2000, 2025);
        assert_eq!(inside.relative_path(), "2023/01");

        let before = Placement::for_date(date!(1990 - 06 - 01), 2000, 2025);
        assert_eq!(before, FALLBACK_PLACEMENT);
        assert_eq!(before.relative_path(), "2000/01");

        let after = Placement::for_date(date!(2030 - 12 - 01), 2000, 2025);
        assert_eq!(after, FALLBACK_PLACEMENT);
    }
}
