//! Time representations used across Warden.

use std::{fmt, ops::Add, str::FromStr, time::Duration};

use jiff::{Span, SpanRelativeTo};
use serde::{
    Deserialize, Deserializer, Serialize,
    de::{self, Visitor},
};

//----------- UnixTime ---------------------------------------------------------

/// A moment in time, in whole seconds since the Unix epoch.
///
/// This is the time type of the enforcer core and the store.  The core never
/// reads the wall clock itself; `now` always arrives as a parameter, which
/// keeps every state transition replayable.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixTime(i64);

impl UnixTime {
    /// The farthest representable future; used as "no wakeup needed".
    pub const FAR_FUTURE: UnixTime = UnixTime(i64::MAX);

    /// Construct from seconds since the epoch.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    /// Seconds since the epoch.
    pub const fn as_secs(&self) -> i64 {
        self.0
    }

    /// The current wall-clock time.
    ///
    /// Only the scheduler and the command surface call this; everything
    /// below them takes `now` as a parameter.
    pub fn now() -> Self {
        Self(jiff::Timestamp::now().as_second())
    }

    /// The earlier of two moments.
    pub fn min(self, other: Self) -> Self {
        std::cmp::Ord::min(self, other)
    }
}

impl Add<Duration> for UnixTime {
    type Output = UnixTime;

    fn add(self, rhs: Duration) -> Self::Output {
        let secs = i64::try_from(rhs.as_secs()).unwrap_or(i64::MAX);
        UnixTime(self.0.saturating_add(secs))
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::FAR_FUTURE {
            return f.write_str("never");
        }
        match jiff::Timestamp::from_second(self.0) {
            Ok(ts) => write!(f, "{ts}"),
            Err(_) => write!(f, "@{}", self.0),
        }
    }
}

//----------- TimeSpan ---------------------------------------------------------

/// A wrapper around [`Duration`] with fancier (de)serialization.
///
/// Accepts plain integers (seconds) as well as `jiff` span strings such as
/// `"90d"`, `"2h 3m 4s"` or `"PT1H"`.
#[derive(Copy, Clone, Debug)]
pub struct TimeSpan {
    duration: Duration,
}

impl TimeSpan {
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn from_secs(secs: u64) -> Self {
        Self {
            duration: Duration::from_secs(secs),
        }
    }
}

struct TimeSpanVisitor;

impl Visitor<'_> for TimeSpanVisitor {
    type Value = TimeSpan;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("string or int")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        FromStr::from_str(value).map_err(E::custom)
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(TimeSpan::from_secs(value.try_into().map_err(|_| {
            E::custom("duration value must be non-negative")
        })?))
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(TimeSpan::from_secs(value))
    }
}

impl<'de> Deserialize<'de> for TimeSpan {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TimeSpanVisitor)
    }
}

impl Serialize for TimeSpan {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.duration.as_secs().serialize(serializer)
    }
}

impl TryFrom<Span> for TimeSpan {
    type Error = String;

    fn try_from(value: Span) -> Result<Self, Self::Error> {
        let signeddur = value
            .to_duration(SpanRelativeTo::days_are_24_hours())
            .map_err(|e| format!("unable to convert duration: {e}\n"))?;

        let duration = Duration::try_from(signeddur)
            .map_err(|e| format!("unable to convert duration: {e}\n"))?;

        Ok(Self { duration })
    }
}

impl From<Duration> for TimeSpan {
    fn from(value: Duration) -> Self {
        TimeSpan { duration: value }
    }
}

impl From<TimeSpan> for Duration {
    fn from(value: TimeSpan) -> Self {
        value.duration
    }
}

impl FromStr for TimeSpan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Handle a small edge case to treat the string "10" as 10 seconds.
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Self::from_secs(secs));
        }
        let span: Span = s
            .parse()
            .map_err(|e| format!("unable to parse {s} as timespan: {e}\n"))?;

        Self::try_from(span)
    }
}

impl PartialEq for TimeSpan {
    fn eq(&self, other: &Self) -> bool {
        self.duration == other.duration
    }
}

impl Eq for TimeSpan {}

impl PartialOrd for TimeSpan {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeSpan {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.duration.cmp(&other.duration)
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::{TimeSpan, UnixTime};
    use serde::Deserialize;
    use std::time::Duration;

    #[test]
    fn parse() {
        #[derive(Debug, Deserialize)]
        struct Foo {
            val: Vec<TimeSpan>,
        }

        let foo: Foo = toml::from_str(
            r#"
            val = [
              10,
              "10",
              "10s",
              "10m",
              "10h",
              "10d",
              "10w",
              "2h 3m 4s",
            ]
            "#,
        )
        .unwrap();
        assert_eq!(
            foo.val,
            vec![
                TimeSpan::from_secs(10),
                TimeSpan::from_secs(10),
                TimeSpan::from_secs(10),
                TimeSpan::from_secs(10 * 60),
                TimeSpan::from_secs(10 * 60 * 60),
                TimeSpan::from_secs(10 * 60 * 60 * 24),
                TimeSpan::from_secs(10 * 60 * 60 * 24 * 7),
                TimeSpan::from_secs((2 * 60 * 60) + (3 * 60) + 4),
            ]
        );
    }

    #[test]
    fn time_arithmetic() {
        let t = UnixTime::from_secs(1000);
        assert_eq!(t + Duration::from_secs(500), UnixTime::from_secs(1500));
        assert_eq!(
            UnixTime::FAR_FUTURE + Duration::from_secs(1),
            UnixTime::FAR_FUTURE
        );
        assert!(UnixTime::from_secs(1) < UnixTime::from_secs(2));
    }
}
