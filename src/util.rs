use chrono::{NaiveDate, Utc};

/// Dates on the portal appear as `dd-mm-yyyy` or `dd/mm/yyyy`, sometimes
/// with a trailing time component we do not care about.
pub fn parse_portal_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim().split_whitespace().next()?;
    ["%d-%m-%Y", "%d/%m/%Y", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

#[inline]
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Collapses the whitespace soup of a free-text block to single spaces.
pub fn squash_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_date_formats() {
        let expect = NaiveDate::from_ymd_opt(2026, 8, 14).unwrap();
        assert_eq!(parse_portal_date("14-08-2026"), Some(expect));
        assert_eq!(parse_portal_date("14/08/2026"), Some(expect));
        assert_eq!(parse_portal_date("2026-08-14"), Some(expect));
        assert_eq!(parse_portal_date("  14-08-2026 05:45 PM "), Some(expect));
    }

    #[test]
    fn portal_date_garbage() {
        assert_eq!(parse_portal_date(""), None);
        assert_eq!(parse_portal_date("N/A"), None);
        assert_eq!(parse_portal_date("32-13-2026"), None);
    }

    #[test]
    fn whitespace_squash() {
        assert_eq!(
            squash_ws("  Dept  Of\n\tDefence,\n  New Delhi "),
            "Dept Of Defence, New Delhi"
        );
    }
}
