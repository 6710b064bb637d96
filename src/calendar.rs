use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarView {
    Month,
    Week,
    Day,
}

impl CalendarView {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "month" => Some(Self::Month),
            "week" => Some(Self::Week),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Week => "week",
            Self::Day => "day",
        }
    }
}

/// Sunday on or before `d`.
pub fn start_of_week(d: NaiveDate) -> NaiveDate {
    d - Duration::days(d.weekday().num_days_from_sunday() as i64)
}

/// Inclusive date range covered by a view anchored at `anchor`.
pub fn view_range(view: CalendarView, anchor: NaiveDate) -> (NaiveDate, NaiveDate) {
    match view {
        CalendarView::Day => (anchor, anchor),
        CalendarView::Week => {
            let s = start_of_week(anchor);
            (s, s + Duration::days(6))
        }
        CalendarView::Month => {
            let first = anchor.with_day(1).unwrap_or(anchor);
            let next = if first.month() == 12 {
                NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
            };
            let last = next
                .and_then(|n| n.pred_opt())
                .unwrap_or(first);
            (first, last)
        }
    }
}

/// Whole Sunday-first weeks covering the month of `anchor`.
pub fn month_grid(anchor: NaiveDate) -> Vec<[NaiveDate; 7]> {
    let (first, last) = view_range(CalendarView::Month, anchor);
    let mut weeks = Vec::new();
    let mut cursor = start_of_week(first);
    while cursor <= last {
        let mut week = [cursor; 7];
        for (i, slot) in week.iter_mut().enumerate() {
            *slot = cursor + Duration::days(i as i64);
        }
        weeks.push(week);
        cursor = cursor + Duration::days(7);
    }
    weeks
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM` and `YYYY-MM-DDTHH:MM:SS`.
pub fn parse_event_time(s: &str) -> Option<NaiveDateTime> {
    let t = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M"))
        .ok()
}

pub fn format_event_time(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Whether an event spanning [start, end] touches the inclusive day range.
pub fn overlaps(
    start: NaiveDateTime,
    end: NaiveDateTime,
    range_first: NaiveDate,
    range_last: NaiveDate,
) -> bool {
    start.date() <= range_last && end.date() >= range_first
}
