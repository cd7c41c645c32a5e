use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound, Utc};

pub const DEFAULT_PREFIX: &str = "Strongbox-Backup";
pub const DEFAULT_EXTENSION: &str = "tar.zst.enc";

/// Timestamped archive names: `{prefix}-YYYY-MM-DDTHH:MM:SSZ.{ext}`.
///
/// Names sort lexicographically in chronological order. `parse` also accepts the
/// older `{prefix}-YYYY-MM-DD_HH-MM-SS.{ext}` layout with any extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingPolicy {
    prefix: String,
    extension: String,
}

impl NamingPolicy {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Name for an archive created at `at`. Sub-second precision is dropped.
    pub fn format(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}-{}.{}",
            self.prefix,
            at.trunc_subsecs(0).format("%Y-%m-%dT%H:%M:%SZ"),
            self.extension
        )
    }

    /// Timestamp encoded in `name`, or `None` when the name is not one of ours.
    pub fn parse(&self, name: &str) -> Option<DateTime<Utc>> {
        let rest = name.strip_prefix(self.prefix.as_str())?.strip_prefix('-')?;

        // "YYYY-MM-DDTHH:MM:SSZ" is 20 bytes, legacy "YYYY-MM-DD_HH-MM-SS" is 19.
        let (stamp, ext) = if rest.len() > 21 && rest.as_bytes()[10] == b'T' {
            let (stamp, ext) = rest.split_at_checked(20)?;
            (parse_current(stamp)?, ext)
        } else if rest.len() > 20 && rest.as_bytes()[10] == b'_' {
            let (stamp, ext) = rest.split_at_checked(19)?;
            (parse_legacy(stamp)?, ext)
        } else {
            return None;
        };

        let ext = ext.strip_prefix('.')?;
        if !valid_extension(ext) {
            return None;
        }
        Some(stamp.and_utc())
    }

    pub fn is_backup_name(&self, name: &str) -> bool {
        self.parse(name).is_some()
    }

    /// Newest entry by parsed name. Unparseable names are ignored; listing order is irrelevant.
    pub fn newest_by<'a, T>(&self, items: &'a [T], name: impl Fn(&T) -> &str) -> Option<&'a T> {
        items
            .iter()
            .filter_map(|item| self.parse(name(item)).map(|at| (at, item)))
            .max_by_key(|(at, _)| *at)
            .map(|(_, item)| item)
    }

    pub fn newest<'a, S: AsRef<str>>(&self, names: &'a [S]) -> Option<&'a S> {
        self.newest_by(names, |n| n.as_ref())
    }
}

impl Default for NamingPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, DEFAULT_EXTENSION)
    }
}

fn parse_current(s: &str) -> Option<NaiveDateTime> {
    let b = s.as_bytes();
    if b.len() != 20 || b[4] != b'-' || b[7] != b'-' || b[10] != b'T' || b[13] != b':'
        || b[16] != b':' || b[19] != b'Z'
    {
        return None;
    }
    build(&s[0..4], &s[5..7], &s[8..10], &s[11..13], &s[14..16], &s[17..19])
}

fn parse_legacy(s: &str) -> Option<NaiveDateTime> {
    let b = s.as_bytes();
    if b.len() != 19 || b[4] != b'-' || b[7] != b'-' || b[10] != b'_' || b[13] != b'-'
        || b[16] != b'-'
    {
        return None;
    }
    build(&s[0..4], &s[5..7], &s[8..10], &s[11..13], &s[14..16], &s[17..19])
}

fn build(y: &str, mo: &str, d: &str, h: &str, mi: &str, s: &str) -> Option<NaiveDateTime> {
    let date = NaiveDate::from_ymd_opt(digits(y)? as i32, digits(mo)?, digits(d)?)?;
    // from_hms_opt rejects hour 24, minute 60 and second 60.
    let time = NaiveTime::from_hms_opt(digits(h)?, digits(mi)?, digits(s)?)?;
    Some(NaiveDateTime::new(date, time))
}

fn digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn valid_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|c| c.is_ascii_alphanumeric()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn format_matches_scheme() {
        let policy = NamingPolicy::new("B", "enc");
        assert_eq!(policy.format(at(2024, 6, 1, 0, 0, 0)), "B-2024-06-01T00:00:00Z.enc");
        assert_eq!(
            NamingPolicy::default().format(at(2020, 5, 25, 12, 1, 2)),
            "Strongbox-Backup-2020-05-25T12:01:02Z.tar.zst.enc"
        );
    }

    #[test]
    fn parse_inverts_format() {
        let policy = NamingPolicy::default();
        for t in [
            at(1970, 1, 1, 0, 0, 0),
            at(2020, 2, 29, 23, 59, 59),
            at(2024, 12, 31, 8, 30, 15),
            at(9999, 12, 31, 23, 59, 59),
        ] {
            let name = policy.format(t);
            assert_eq!(policy.parse(&name), Some(t));
            assert_eq!(policy.format(policy.parse(&name).unwrap()), name);
        }
    }

    #[test]
    fn format_drops_subseconds() {
        let policy = NamingPolicy::default();
        let t = at(2024, 1, 1, 0, 0, 0) + chrono::Duration::milliseconds(999);
        assert_eq!(policy.parse(&policy.format(t)), Some(at(2024, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn lexicographic_order_is_chronological() {
        let policy = NamingPolicy::default();
        let times = [
            at(2019, 12, 31, 23, 59, 59),
            at(2020, 1, 1, 0, 0, 0),
            at(2020, 1, 1, 0, 0, 1),
            at(2020, 10, 2, 0, 0, 0),
        ];
        let mut names: Vec<String> = times.iter().rev().map(|t| policy.format(*t)).collect();
        names.sort();
        let parsed: Vec<_> = names.iter().map(|n| policy.parse(n).unwrap()).collect();
        assert_eq!(parsed, times);
    }

    #[test]
    fn legacy_names_are_accepted() {
        let policy = NamingPolicy::new("Tari-Aurora-Backup", "tar.zst.enc");
        assert_eq!(
            policy.parse("Tari-Aurora-Backup-2020-05-25_12-00-00.zip"),
            Some(at(2020, 5, 25, 12, 0, 0))
        );
        assert_eq!(
            policy.parse("Tari-Aurora-Backup-2021-01-02_03-04-05.zip.enc"),
            Some(at(2021, 1, 2, 3, 4, 5))
        );
    }

    #[test]
    fn unrelated_names_return_none() {
        let policy = NamingPolicy::new("B", "enc");
        for name in [
            "",
            "B",
            "B-",
            "notes.txt",
            "C-2024-01-01T00:00:00Z.enc",
            "B-2024-01-01T00:00:00Z",
            "B-2024-01-01T00:00:00Z.",
            "B-2024-01-01T00:00:00Z.e/c",
            "B-2024-01-01T00:00:00.enc",
            "B-2024-1-01T00:00:00Z.enc",
            "B-2024-01-01 00:00:00Z.enc",
            "B-+024-01-01T00:00:00Z.enc",
            "B-2020-05-25_12-00-0.zip",
            "B-2024-01-01T00:00:00é.enc",
            "B-2024-01-01_00-00-0é.zip",
            "B-2024-01-01T00:00:0é.enc",
            "B-2024-01-01T00:00:00Zé",
        ] {
            assert_eq!(policy.parse(name), None, "{name} should not parse");
        }
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let policy = NamingPolicy::new("B", "zip");
        for name in [
            "B-2020-00-25_12-00-00.zip",
            "B-2020-05-00_12-00-00.zip",
            "B-2020-05-32_12-00-00.zip",
            "B-2021-02-29_12-00-00.zip",
            "B-2020-05-25_24-00-00.zip",
            "B-2020-05-25_12-60-00.zip",
            "B-2020-05-25_12-00-60.zip",
            "B-2020-05-25T12:00:60Z.zip",
        ] {
            assert_eq!(policy.parse(name), None, "{name} should not parse");
        }
    }

    #[test]
    fn newest_wins_regardless_of_order() {
        let policy = NamingPolicy::new("B", "enc");
        let jan = "B-2024-01-01T00:00:00Z.enc";
        let jun = "B-2024-06-01T00:00:00Z.enc";
        assert_eq!(policy.newest(&[jan, jun]), Some(&jun));
        assert_eq!(policy.newest(&[jun, jan]), Some(&jun));
        assert_eq!(policy.newest(&[jun, "zzz-unrelated", jan]), Some(&jun));
        assert_eq!(policy.newest::<&str>(&[]), None);
        assert_eq!(policy.newest(&["junk"]), None);
    }

    #[test]
    fn newest_mixes_legacy_and_current() {
        let policy = NamingPolicy::new("B", "enc");
        let names = [
            "B-2024-03-01_00-00-00.zip".to_string(),
            "B-2024-02-01T00:00:00Z.enc".to_string(),
        ];
        assert_eq!(policy.newest(&names), Some(&names[0]));
    }
}
