use crate::error::BitError;
use crate::BitResult;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

#[derive(PartialEq, Clone, Debug, Hash, Ord, PartialOrd, Eq, Copy)]
pub struct EpochTime(i64);

impl EpochTime {
    pub fn new(i: i64) -> Self {
        Self(i)
    }
}

#[derive(PartialEq, Clone, Debug, Hash, Ord, PartialOrd, Eq, Copy)]
/// timezone offset in minutes
pub struct TimeZoneOffset(i32);

impl TimeZoneOffset {
    pub fn new(offset: i32) -> Self {
        Self(offset)
    }
}

#[derive(PartialEq, Clone, Debug, PartialOrd, Eq, Ord, Hash)]
pub struct Time {
    pub(crate) time: EpochTime,
    pub(crate) offset: TimeZoneOffset,
}

impl Time {
    pub fn new(time: EpochTime, offset: TimeZoneOffset) -> Self {
        Self { time, offset }
    }

    /// deterministic time for tests: commit/tag keys must not depend on the
    /// wall clock.
    pub fn now() -> Self {
        if cfg!(test) {
            Self { time: EpochTime(0), offset: TimeZoneOffset(0) }
        } else {
            let now = chrono::offset::Local::now();
            let offset = TimeZoneOffset(now.offset().local_minus_utc() / 60);
            let time = EpochTime(now.timestamp());
            Self { time, offset }
        }
    }
}

/// an author/committer/tagger line: name, email, and the time it was made.
#[derive(PartialEq, Clone, Debug)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub time: Time,
}

impl Signature {
    pub fn new(name: String, email: String, time: Time) -> Self {
        Self { name, email, time }
    }
}

impl FromStr for TimeZoneOffset {
    type Err = BitError;

    // format: (+|-)0200
    fn from_str(s: &str) -> BitResult<Self> {
        if s.len() != 5 {
            return Err(BitError::codec(format!("invalid timezone offset `{}`", s)));
        }
        let sign = match &s[0..1] {
            "+" => 1,
            "-" => -1,
            _ => return Err(BitError::codec(format!("invalid timezone offset sign in `{}`", s))),
        };
        let hours: i32 = s[1..3]
            .parse()
            .map_err(|_| BitError::codec(format!("invalid timezone offset `{}`", s)))?;
        let minutes: i32 = s[3..5]
            .parse()
            .map_err(|_| BitError::codec(format!("invalid timezone offset `{}`", s)))?;
        Ok(Self(sign * (minutes + hours * 60)))
    }
}

impl FromStr for EpochTime {
    type Err = BitError;

    fn from_str(s: &str) -> BitResult<Self> {
        s.parse()
            .map(Self)
            .map_err(|_| BitError::codec(format!("invalid epoch time `{}`", s)))
    }
}

impl FromStr for Time {
    type Err = BitError;

    fn from_str(s: &str) -> BitResult<Self> {
        let mut splits = s.split_ascii_whitespace();
        let time = splits
            .next()
            .ok_or_else(|| BitError::codec("missing timestamp"))?
            .parse()?;
        let offset = splits
            .next()
            .ok_or_else(|| BitError::codec("missing timezone offset"))?
            .parse()?;
        Ok(Self { time, offset })
    }
}

impl FromStr for Signature {
    type Err = BitError;

    // Andy Yu <andyyu2004@gmail.com> 1616061862 +1300
    fn from_str(s: &str) -> BitResult<Self> {
        let email_start_idx =
            s.find('<').ok_or_else(|| BitError::codec("signature missing `<`"))?;
        let email_end_idx =
            s.find('>').ok_or_else(|| BitError::codec("signature missing `>`"))?;
        if email_start_idx == 0 || email_start_idx >= email_end_idx {
            return Err(BitError::codec(format!("malformed signature `{}`", s)));
        }

        let name = s[..email_start_idx - 1].to_owned();
        let email = s[email_start_idx + 1..email_end_idx].to_owned();
        let time = s[email_end_idx + 1..].trim_start().parse()?;
        Ok(Self { name, email, time })
    }
}

impl Display for EpochTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for TimeZoneOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sign = if self.0 >= 0 { '+' } else { '-' };
        let offset = self.0.abs();
        write!(f, "{}{:02}{:02}", sign, offset / 60, offset % 60)
    }
}

impl Display for Time {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.time, self.offset)
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}> {}", self.name, self.email, self.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrips_through_display_and_parse() {
        let sig = Signature::new(
            "Andy Yu".to_owned(),
            "andyyu2004@gmail.com".to_owned(),
            Time::new(EpochTime::new(1616061862), TimeZoneOffset::new(13 * 60)),
        );
        let rendered = sig.to_string();
        assert_eq!(rendered, "Andy Yu <andyyu2004@gmail.com> 1616061862 +1300");
        let parsed: Signature = rendered.parse().unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn negative_timezone_offset_renders_with_minus_sign() {
        let offset = TimeZoneOffset::new(-8 * 60 - 30);
        assert_eq!(offset.to_string(), "-0830");
        assert_eq!(offset, "-0830".parse().unwrap());
    }

    #[test]
    fn rejects_signature_without_angle_brackets() {
        assert!("Andy Yu andyyu2004@gmail.com 1616061862 +1300".parse::<Signature>().is_err());
    }
}
