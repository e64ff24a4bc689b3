//! Text-to-field parsing for detail pages.
//!
//! Listing pages print numbers with Persian or Arabic-Indic digits and
//! locale separators, so every numeric parser normalizes first.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

static DATE_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\d{1,2})\s+(\p{L}+)\s+(\d{4})").ok());
static NUMBER_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").ok());

pub(crate) const ELEVATOR_LABEL: &str = "آسانسور";
pub(crate) const STORAGE_LABEL: &str = "انباری";
pub(crate) const PARKING_LABEL: &str = "پارکینگ";
const GROUND_FLOOR: &str = "همکف";

/// Month names in both the Solar Hijri (Persian) and Gregorian (English) forms.
const MONTHS: &[(&str, u32)] = &[
    ("فروردین", 1),
    ("اردیبهشت", 2),
    ("خرداد", 3),
    ("تیر", 4),
    ("مرداد", 5),
    ("شهریور", 6),
    ("مهر", 7),
    ("آبان", 8),
    ("آذر", 9),
    ("دی", 10),
    ("بهمن", 11),
    ("اسفند", 12),
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
];

/// Maps Persian (U+06F0..) and Arabic-Indic (U+0660..) digits to ASCII, and
/// the Arabic decimal separator to '.'.
#[must_use]
pub fn normalize_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{066B}' => '.',
            _ => c,
        })
        .collect()
}

/// Integer made of every digit in `text`, so "۱٬۲۵۰٬۰۰۰ تومان" is 1250000.
#[must_use]
pub fn parse_grouped_integer(text: &str) -> Option<u64> {
    let digits: String = normalize_digits(text).chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// First number in `text`, e.g. "۸۵ متر" is 85.0.
#[must_use]
pub fn parse_first_number(text: &str) -> Option<f64> {
    let normalized = normalize_digits(text).replace(['٬', ','], "");
    let pattern = NUMBER_PATTERN.as_ref()?;
    pattern.find(&normalized)?.as_str().parse().ok()
}

#[must_use]
pub fn parse_count(text: &str) -> Option<u32> {
    parse_first_number(text).and_then(|n| if n >= 0.0 { Some(n as u32) } else { None })
}

/// Floor number; "ground" maps to 0 and "3 of 5" to 3.
#[must_use]
pub fn parse_floor(text: &str) -> Option<i32> {
    if text.contains(GROUND_FLOOR) {
        return Some(0);
    }
    parse_first_number(text).map(|n| n as i32)
}

/// Splits the category chip: first word is the ad type, the rest the house type.
#[must_use]
pub fn split_category_chip(text: &str) -> (Option<String>, Option<String>) {
    let mut words = text.split_whitespace();
    let ad_type = words.next().map(str::to_string);
    let rest: Vec<&str> = words.collect();
    let house_type = if rest.is_empty() { None } else { Some(rest.join(" ")) };
    (ad_type, house_type)
}

/// City from a subtitle like "آپارتمان در تهران، نیاوران".
#[must_use]
pub fn city_from_subtitle(text: &str) -> Option<String> {
    let after = text.split_once(" در ").map(|(_, rest)| rest)?;
    let city = after.split(['،', ',']).next()?.trim();
    (!city.is_empty()).then(|| city.to_string())
}

/// Neighbourhood: the segment after the first comma of the subtitle.
#[must_use]
pub fn neighborhood_from_subtitle(text: &str) -> Option<String> {
    let segment = text.split(['،', ',']).nth(1)?.trim();
    (!segment.is_empty()).then(|| segment.to_string())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Amenities {
    pub elevator: bool,
    pub storage: bool,
    pub parking: bool,
}

#[must_use]
pub fn amenity_flags(labels: &[String]) -> Amenities {
    let has = |wanted: &str| labels.iter().any(|label| label.trim() == wanted);
    Amenities {
        elevator: has(ELEVATOR_LABEL),
        storage: has(STORAGE_LABEL),
        parking: has(PARKING_LABEL),
    }
}

/// Drops empty and placeholder image sources.
#[must_use]
pub fn keep_images(sources: Vec<String>) -> Vec<String> {
    sources
        .into_iter()
        .map(|src| src.trim().to_string())
        .filter(|src| !src.is_empty() && !src.contains("placeholder"))
        .collect()
}

/// Finds a "day month year" date in free text. The year is kept as printed;
/// no calendar conversion is attempted.
#[must_use]
pub fn parse_posted_on(text: &str) -> Option<NaiveDate> {
    let normalized = normalize_digits(text);
    let captures = DATE_PATTERN.as_ref()?.captures(&normalized)?;
    let day: u32 = captures.get(1)?.as_str().parse().ok()?;
    let month_name = captures.get(2)?.as_str().to_lowercase();
    let year: i32 = captures.get(3)?.as_str().parse().ok()?;
    let month = MONTHS
        .iter()
        .find(|(name, _)| *name == month_name)
        .map(|(_, number)| *number)?;
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("۱۲۳", "123")]
    #[case("٤٥٦", "456")]
    #[case("85 m", "85 m")]
    #[case("۸۵٫۵", "85.5")]
    fn digits_are_normalized(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_digits(input), expected);
    }

    #[rstest]
    #[case("۱٬۲۵۰٬۰۰۰ تومان", Some(1_250_000))]
    #[case("4,500,000,000", Some(4_500_000_000))]
    #[case("توافقی", None)]
    fn grouped_integers(#[case] input: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_grouped_integer(input), expected);
    }

    #[rstest]
    #[case("۸۵", Some(85.0))]
    #[case("120.5 متر", Some(120.5))]
    #[case("", None)]
    fn first_number(#[case] input: &str, #[case] expected: Option<f64>) {
        assert_eq!(parse_first_number(input), expected);
    }

    #[rstest]
    #[case("۳ از ۵", Some(3))]
    #[case("همکف", Some(0))]
    #[case("-1", Some(-1))]
    #[case("نامشخص", None)]
    fn floors(#[case] input: &str, #[case] expected: Option<i32>) {
        assert_eq!(parse_floor(input), expected);
    }

    #[test]
    fn chip_split() {
        assert_eq!(
            split_category_chip("فروش آپارتمان مسکونی"),
            (Some("فروش".to_string()), Some("آپارتمان مسکونی".to_string()))
        );
        assert_eq!(split_category_chip("اجاره"), (Some("اجاره".to_string()), None));
        assert_eq!(split_category_chip("  "), (None, None));
    }

    #[test]
    fn subtitle_parts() {
        let subtitle = "آپارتمان در تهران، نیاوران";
        assert_eq!(city_from_subtitle(subtitle).as_deref(), Some("تهران"));
        assert_eq!(neighborhood_from_subtitle(subtitle).as_deref(), Some("نیاوران"));
        assert_eq!(city_from_subtitle("no location"), None);
    }

    #[test]
    fn amenities_match_exact_labels() {
        let labels = vec![" آسانسور ".to_string(), "پارکینگ".to_string()];
        let flags = amenity_flags(&labels);
        assert!(flags.elevator);
        assert!(flags.parking);
        assert!(!flags.storage);
    }

    #[test]
    fn placeholder_images_dropped() {
        let images = keep_images(vec![
            "https://cdn.test/a.jpg".into(),
            "https://cdn.test/placeholder.png".into(),
            " ".into(),
        ]);
        assert_eq!(images, vec!["https://cdn.test/a.jpg".to_string()]);
    }

    #[rstest]
    #[case("آپارتمان ۸۵ متری - ۱۲ مهر ۱۴۰۲ - دیوار", NaiveDate::from_ymd_opt(1402, 7, 12))]
    #[case("Villa posted 3 March 2024", NaiveDate::from_ymd_opt(2024, 3, 3))]
    #[case("no date here", None)]
    #[case("12 Smarch 2024", None)]
    fn posted_dates(#[case] input: &str, #[case] expected: Option<NaiveDate>) {
        assert_eq!(parse_posted_on(input), expected);
    }
}
