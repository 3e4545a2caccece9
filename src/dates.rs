use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Format a date the way mailbox SINCE searches expect it (01-Mar-2025).
pub fn format_search_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

/// Parse a free-text arrival phrase into a concrete date, biased toward
/// future dates and anchored to `anchor` (normally the message's own Date
/// header). Returns None when the phrase carries no usable date.
///
/// Handled shapes: "today"/"tonight", "tomorrow", a bare weekday name, and
/// month/day forms with an optional leading weekday and optional year
/// ("Monday, March 10", "March 10", "10 March", "Saturday 22 June 2025").
pub fn parse_relative_date(phrase: &str, anchor: NaiveDate) -> Option<NaiveDate> {
    let cleaned = phrase
        .to_lowercase()
        .replace(',', " ")
        .replace('.', " ")
        .trim()
        .to_string();
    if cleaned.is_empty() {
        return None;
    }

    if cleaned.contains("tomorrow") {
        return Some(anchor + Duration::days(1));
    }
    if cleaned.contains("today") || cleaned.contains("tonight") {
        return Some(anchor);
    }

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();

    if tokens.len() == 1 {
        if let Some(weekday) = weekday_from_name(tokens[0]) {
            return Some(next_weekday(anchor, weekday));
        }
    }

    // Drop a leading weekday token; the month/day is authoritative
    let tokens: &[&str] = match weekday_from_name(tokens[0]) {
        Some(_) if tokens.len() > 1 => &tokens[1..],
        _ => &tokens[..],
    };

    let mut month: Option<u32> = None;
    let mut day: Option<u32> = None;
    let mut year: Option<i32> = None;

    for token in tokens {
        if month.is_none() {
            if let Some(m) = month_from_name(token) {
                month = Some(m);
                continue;
            }
        }
        if let Ok(n) = token.trim_end_matches(|c: char| c.is_alphabetic()).parse::<u32>() {
            if n >= 1900 {
                year = Some(n as i32);
            } else if day.is_none() && (1..=31).contains(&n) {
                day = Some(n);
            }
        }
    }

    let month = month?;
    let day = day?;

    match year {
        Some(y) => NaiveDate::from_ymd_opt(y, month, day),
        None => {
            // Prefer-future bias: the nearest such date on or after the anchor
            let this_year = NaiveDate::from_ymd_opt(anchor.year(), month, day)?;
            if this_year >= anchor {
                Some(this_year)
            } else {
                NaiveDate::from_ymd_opt(anchor.year() + 1, month, day)
            }
        }
    }
}

/// Next occurrence of `weekday` on or after `from` (0-6 days ahead).
pub fn next_weekday(from: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (weekday.num_days_from_monday() as i64
        - from.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    from + Duration::days(ahead)
}

pub fn weekday_from_name(name: &str) -> Option<Weekday> {
    match name.trim().to_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" | "tues" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" | "thur" | "thurs" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

fn month_from_name(name: &str) -> Option<u32> {
    let name = name.trim().to_lowercase();
    let months = [
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];
    months
        .iter()
        .position(|m| name == **m || (name.len() >= 3 && m.starts_with(&name)))
        .map(|i| i as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_search_date_format() {
        assert_eq!(format_search_date(date(2025, 3, 1)), "01-Mar-2025");
    }

    #[test]
    fn test_today_and_tomorrow() {
        let anchor = date(2025, 3, 10);
        assert_eq!(parse_relative_date("today", anchor), Some(anchor));
        assert_eq!(
            parse_relative_date("Arriving tonight by 10pm", anchor),
            Some(anchor)
        );
        assert_eq!(
            parse_relative_date("tomorrow", anchor),
            Some(date(2025, 3, 11))
        );
    }

    #[test]
    fn test_bare_weekday_is_next_occurrence() {
        // 2025-03-10 is a Monday
        let anchor = date(2025, 3, 10);
        assert_eq!(parse_relative_date("monday", anchor), Some(anchor));
        assert_eq!(parse_relative_date("Wednesday", anchor), Some(date(2025, 3, 12)));
        assert_eq!(parse_relative_date("sunday", anchor), Some(date(2025, 3, 16)));
    }

    #[test]
    fn test_weekday_month_day() {
        let anchor = date(2025, 3, 1);
        assert_eq!(
            parse_relative_date("Monday, March 10", anchor),
            Some(date(2025, 3, 10))
        );
        assert_eq!(
            parse_relative_date("March 10", anchor),
            Some(date(2025, 3, 10))
        );
        assert_eq!(
            parse_relative_date("10 March", anchor),
            Some(date(2025, 3, 10))
        );
        assert_eq!(
            parse_relative_date("Saturday 22 June 2025", anchor),
            Some(date(2025, 6, 22))
        );
    }

    #[test]
    fn test_prefer_future_wraps_year() {
        let anchor = date(2025, 12, 20);
        assert_eq!(
            parse_relative_date("Monday, January 5", anchor),
            Some(date(2026, 1, 5))
        );
    }

    #[test]
    fn test_abbreviated_month() {
        let anchor = date(2025, 3, 1);
        assert_eq!(
            parse_relative_date("Mar 10", anchor),
            Some(date(2025, 3, 10))
        );
    }

    #[test]
    fn test_unparseable_returns_none() {
        let anchor = date(2025, 3, 1);
        assert_eq!(parse_relative_date("your package", anchor), None);
        assert_eq!(parse_relative_date("", anchor), None);
    }

    #[test]
    fn test_next_weekday_zero_to_six_days() {
        // Monday anchor
        let anchor = date(2025, 3, 10);
        assert_eq!(next_weekday(anchor, Weekday::Mon), anchor);
        assert_eq!(next_weekday(anchor, Weekday::Sun), date(2025, 3, 16));
    }
}
