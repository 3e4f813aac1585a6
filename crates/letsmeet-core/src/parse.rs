//! Field parsers turning free-text source values into structured fields.
//!
//! None of these functions fail: a value that cannot be parsed degrades to
//! absent (or to the name placeholder) so the surrounding record still imports.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::{AddressFields, HobbyPriority, PersonName, NAME_PLACEHOLDER};

pub const DATE_FORMAT: &str = "%d.%m.%Y";

static HOBBY_PRIORITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.*?)%(\d+)%").expect("static hobby priority pattern"));

/// Trim; empty becomes absent.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn or_placeholder(part: &str) -> String {
    let part = part.trim();
    if part.is_empty() {
        NAME_PLACEHOLDER.to_string()
    } else {
        part.to_string()
    }
}

/// Split a `"last, first"` string on its first comma.
pub fn split_name(raw: Option<&str>) -> PersonName {
    let Some(raw) = clean_text(raw) else {
        return PersonName::placeholder();
    };
    match raw.split_once(',') {
        Some((last, first)) => PersonName {
            first_name: or_placeholder(first),
            last_name: or_placeholder(last),
        },
        None => PersonName {
            first_name: NAME_PLACEHOLDER.to_string(),
            last_name: raw,
        },
    }
}

/// Parse `"street number, zip, city[, ...]"`. Fewer than three segments yields
/// a fully absent address, never a partial one.
pub fn parse_address(raw: Option<&str>) -> AddressFields {
    let Some(raw) = raw else {
        return AddressFields::empty();
    };
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return AddressFields::empty();
    }

    let (street, house_no) = match parts[0].rsplit_once(' ') {
        Some((street, number)) => (clean_text(Some(street)), clean_text(Some(number))),
        None => (clean_text(Some(parts[0])), None),
    };

    AddressFields {
        street,
        house_no,
        zip_code: clean_text(Some(parts[1])),
        city: clean_text(Some(parts[2])),
    }
}

/// `DD.MM.YYYY` only; anything else, including impossible calendar dates, is absent.
pub fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

/// Keep digits and `+`.
pub fn normalize_phone(raw: Option<&str>) -> Option<String> {
    let digits: String = raw?
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Split a `;`-separated hobby list; `Name%N%` carries priority `N`, plain tokens get 0.
pub fn extract_hobbies(raw: Option<&str>) -> Vec<HobbyPriority> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.split(';').filter_map(parse_hobby_token).collect()
}

fn parse_hobby_token(token: &str) -> Option<HobbyPriority> {
    let marked = HOBBY_PRIORITY.captures(token).and_then(|caps| {
        let priority = caps[2].parse::<u32>().ok().filter(|p| i32::try_from(*p).is_ok())?;
        Some((caps[1].trim().to_string(), priority))
    });
    let (name, priority) = marked.unwrap_or_else(|| (token.trim().to_string(), 0));
    if name.is_empty() {
        None
    } else {
        Some(HobbyPriority { name, priority })
    }
}
