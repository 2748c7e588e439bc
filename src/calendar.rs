//! Notes arranged by day.
//!
//! Note dates are wall-clock times: a trailing `Z` is ignored rather than
//! converted, so a note saved for 10:00 shows at 10:00 whatever the local
//! offset is.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;

use crate::models::Note;

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

pub fn parse_note_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let wall_clock = raw.strip_suffix('Z').unwrap_or(raw);

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(wall_clock, format) {
            return Some(dt);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    NaiveDate::parse_from_str(wall_clock, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// "May 1, 2024 at 10:30 AM"
pub fn format_note_date(at: &NaiveDateTime) -> String {
    at.format("%B %-d, %Y at %-I:%M %p").to_string()
}

/// Parse `YYYY-MM`.
pub fn parse_month(raw: &str) -> Option<(i32, u32)> {
    let (year, month) = raw.trim().split_once('-')?;
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, 1).map(|_| (year, month))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgendaEntry<'a> {
    pub at: NaiveDateTime,
    pub note: &'a Note,
}

#[derive(Debug, Default)]
pub struct Agenda<'a> {
    days: BTreeMap<NaiveDate, Vec<AgendaEntry<'a>>>,
    undated: Vec<&'a Note>,
}

impl<'a> Agenda<'a> {
    pub fn from_notes(notes: &'a [Note]) -> Self {
        let mut agenda = Agenda::default();
        for note in notes {
            match parse_note_date(&note.note_date) {
                Some(at) => agenda
                    .days
                    .entry(at.date())
                    .or_default()
                    .push(AgendaEntry { at, note }),
                None => {
                    tracing::debug!("Note {} has unparseable date {:?}", note.id, note.note_date);
                    agenda.undated.push(note);
                }
            }
        }
        for entries in agenda.days.values_mut() {
            entries.sort_by_key(|e| (e.at, e.note.id));
        }
        agenda
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty() && self.undated.is_empty()
    }

    pub fn day(&self, date: NaiveDate) -> &[AgendaEntry<'a>] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Days of the given month that have notes, in order.
    pub fn month(&self, year: i32, month: u32) -> Vec<(NaiveDate, &[AgendaEntry<'a>])> {
        let Some(start) = NaiveDate::from_ymd_opt(year, month, 1) else {
            return Vec::new();
        };
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let Some(end) = NaiveDate::from_ymd_opt(next_year, next_month, 1) else {
            return Vec::new();
        };
        self.days
            .range(start..end)
            .map(|(d, e)| (*d, e.as_slice()))
            .collect()
    }

    pub fn undated(&self) -> &[&'a Note] {
        &self.undated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: i64, title: &str, date: &str) -> Note {
        Note {
            id,
            title: title.into(),
            content: String::new(),
            note_date: date.into(),
            user_id: 1,
        }
    }

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn parses_server_and_form_dates() {
        assert_eq!(
            parse_note_date("2024-05-01T10:30:00.000000Z"),
            Some(dt("2024-05-01 10:30:00"))
        );
        assert_eq!(
            parse_note_date("2024-05-01T10:30:00Z"),
            Some(dt("2024-05-01 10:30:00"))
        );
        assert_eq!(
            parse_note_date("2024-05-01T10:30"),
            Some(dt("2024-05-01 10:30:00"))
        );
        assert_eq!(
            parse_note_date("2024-05-01 10:30:15"),
            Some(dt("2024-05-01 10:30:15"))
        );
        assert_eq!(parse_note_date("2024-05-01"), Some(dt("2024-05-01 00:00:00")));
        assert_eq!(
            parse_note_date("2024-05-01T10:30:00+02:00"),
            Some(dt("2024-05-01 10:30:00"))
        );
        assert_eq!(parse_note_date("next tuesday"), None);
    }

    #[test]
    fn formats_like_long_date_short_time() {
        assert_eq!(
            format_note_date(&dt("2024-05-01 14:05:00")),
            "May 1, 2024 at 2:05 PM"
        );
        assert_eq!(
            format_note_date(&dt("2024-12-25 00:00:00")),
            "December 25, 2024 at 12:00 AM"
        );
    }

    #[test]
    fn groups_by_day_sorted_by_time() {
        let notes = vec![
            note(1, "Lunch", "2024-05-01T12:00:00.000000Z"),
            note(2, "Standup", "2024-05-01T09:00:00.000000Z"),
            note(3, "Flight", "2024-05-03T06:00:00.000000Z"),
            note(4, "Someday", "whenever"),
        ];
        let agenda = Agenda::from_notes(&notes);

        let first: Vec<&str> = agenda
            .day(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
            .iter()
            .map(|e| e.note.title.as_str())
            .collect();
        assert_eq!(first, vec!["Standup", "Lunch"]);
        assert!(agenda.day(NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()).is_empty());
        assert_eq!(agenda.month(2024, 5).len(), 2);
        assert!(!agenda.is_empty());
        assert!(Agenda::from_notes(&[]).is_empty());
        assert_eq!(agenda.undated().len(), 1);
        assert_eq!(agenda.undated()[0].id, 4);
    }

    #[test]
    fn month_view_spans_year_end() {
        let notes = vec![
            note(1, "Nov", "2024-11-30T10:00:00Z"),
            note(2, "Dec", "2024-12-31T23:59:00Z"),
            note(3, "Jan", "2025-01-01T00:00:00Z"),
        ];
        let agenda = Agenda::from_notes(&notes);

        let december = agenda.month(2024, 12);
        assert_eq!(december.len(), 1);
        assert_eq!(december[0].1[0].note.title, "Dec");
        assert!(agenda.month(2024, 13).is_empty());
    }

    #[test]
    fn parses_month_argument() {
        assert_eq!(parse_month("2024-05"), Some((2024, 5)));
        assert_eq!(parse_month("2024-13"), None);
        assert_eq!(parse_month("May"), None);
    }
}
