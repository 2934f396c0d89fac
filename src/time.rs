use std::fmt::{Debug, Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// A point in time with microsecond resolution, represented as seconds and microseconds since
///  the UNIX epoch. This is the representation used on the wire (see [crate::envelope]) and in
///  shared memory segment headers, so conversions between the two are lossless.
///
/// The default value is the epoch itself, which doubles as 'not set'.
///
/// NB: `microseconds` is kept normalized to `0..1_000_000`, with negative points in time having
///      negative `seconds`. Derived ordering relies on that.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimeStamp {
    pub seconds: i32,
    pub microseconds: i32,
}

impl TimeStamp {
    pub const EPOCH: TimeStamp = TimeStamp { seconds: 0, microseconds: 0 };

    pub fn now() -> TimeStamp {
        SystemTime::now().into()
    }

    /// Values outside the range of `i32` seconds are saturated
    pub fn from_micros(micros: i64) -> TimeStamp {
        let seconds = micros.div_euclid(MICROS_PER_SECOND);
        let microseconds = micros.rem_euclid(MICROS_PER_SECOND);

        match i32::try_from(seconds) {
            Ok(seconds) => TimeStamp {
                seconds,
                microseconds: microseconds as i32,
            },
            Err(_) if seconds < 0 => TimeStamp { seconds: i32::MIN, microseconds: 0 },
            Err(_) => TimeStamp { seconds: i32::MAX, microseconds: (MICROS_PER_SECOND - 1) as i32 },
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.seconds as i64 * MICROS_PER_SECOND + self.microseconds as i64
    }

    /// fractional seconds since the epoch, rounded to the nearest microsecond
    pub fn from_secs_f64(secs: f64) -> TimeStamp {
        Self::from_micros((secs * MICROS_PER_SECOND as f64).round() as i64)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.as_micros() as f64 / MICROS_PER_SECOND as f64
    }

    pub fn as_system_time(&self) -> SystemTime {
        let micros = self.as_micros();
        if micros >= 0 {
            UNIX_EPOCH + Duration::from_micros(micros as u64)
        }
        else {
            UNIX_EPOCH - Duration::from_micros(micros.unsigned_abs())
        }
    }

    pub fn is_epoch(&self) -> bool {
        *self == Self::EPOCH
    }
}

impl From<SystemTime> for TimeStamp {
    /// truncates to microseconds
    fn from(value: SystemTime) -> Self {
        let micros = match value.duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_micros()).unwrap_or(i64::MAX),
            Err(e) => i64::try_from(e.duration().as_micros()).map(|m| -m).unwrap_or(i64::MIN),
        };
        TimeStamp::from_micros(micros)
    }
}

impl From<TimeStamp> for SystemTime {
    fn from(value: TimeStamp) -> Self {
        value.as_system_time()
    }
}

impl Debug for TimeStamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}s", self.seconds, self.microseconds)
    }
}

impl Display for TimeStamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
