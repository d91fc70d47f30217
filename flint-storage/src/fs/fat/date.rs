//! FAT timestamps.
//!
//! On disk, FAT stores dates and times in packed DOS fields with a
//! 1980-01-01 epoch. The VFS surface speaks unix seconds, so both codecs
//! live here, together with the [`TimeProvider`] hook a host can implement
//! to supply a real clock.

/// Seconds between the unix epoch and 2000-01-01 00:00:00.
pub const EPOCH_2000: u64 = 946_684_800;

/// A DOS date.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Date {
    /// Year number.
    /// Valid range is [1980, 2107].
    year: u16,
    /// Month of the year.
    /// Valid range is [1, 12].
    month: u8,
    /// Day of the month.
    /// Valid range is [1, 31] but it depends on the month
    /// and year (leap year).
    day: u8,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct DosDate {
    dos_date: u16,
}

impl DosDate {
    #[must_use]
    #[inline]
    pub const fn new(dos_date: u16) -> Self {
        Self { dos_date }
    }

    #[must_use]
    #[inline]
    pub const fn dos_date(&self) -> u16 {
        self.dos_date
    }
}

impl Date {
    const MIN_YEAR: u16 = 1980;
    const MAX_YEAR: u16 = 2107;

    /// Creates a new `Date` instance.
    ///
    /// # Panics
    ///
    /// Panics if one of provided arguments is out of the supported range.
    #[must_use]
    pub fn new(year: u16, month: u8, day: u8) -> Self {
        assert!(
            (Self::MIN_YEAR..=Self::MAX_YEAR).contains(&year),
            "year out of range"
        );
        assert!((1..=12).contains(&month), "month out of range");
        assert!((1..=31).contains(&day), "day out of range");
        Self { year, month, day }
    }

    #[must_use]
    /// Creates a new `Date` from a DOS encoded date.
    pub(crate) fn decode(dos_date: DosDate) -> Self {
        let dos_date = dos_date.dos_date();
        let year = (dos_date >> 9) + Self::MIN_YEAR;
        let month = u8::try_from((dos_date >> 5) & 0xF).unwrap_or(1).clamp(1, 12);
        let day = u8::try_from(dos_date & 0x1F).unwrap_or(1).clamp(1, 31);
        Self { year, month, day }
    }

    #[must_use]
    /// Encode the date into a DOS compatible format.
    pub(crate) fn encode(self) -> DosDate {
        let dos_date = ((self.year - Self::MIN_YEAR) << 9)
            | (u16::from(self.month) << 5)
            | u16::from(self.day);
        DosDate::new(dos_date)
    }

    #[must_use]
    #[inline]
    pub const fn year(&self) -> u16 {
        self.year
    }

    #[must_use]
    #[inline]
    pub const fn month(&self) -> u8 {
        self.month
    }

    #[must_use]
    #[inline]
    pub const fn day(&self) -> u8 {
        self.day
    }

    /// Days since the unix epoch (civil-calendar arithmetic).
    #[must_use]
    const fn days_from_unix_epoch(self) -> u64 {
        let y = if self.month <= 2 {
            self.year as u64 - 1
        } else {
            self.year as u64
        };
        let era = y / 400;
        let yoe = y - era * 400;
        let mp = if self.month > 2 {
            self.month as u64 - 3
        } else {
            self.month as u64 + 9
        };
        let doy = (153 * mp + 2) / 5 + self.day as u64 - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        era * 146_097 + doe - 719_468
    }

    /// Date for a day count since the unix epoch.
    ///
    /// The result is clamped to the representable DOS range.
    #[must_use]
    fn from_unix_days(days: u64) -> Self {
        let z = days + 719_468;
        let era = z / 146_097;
        let doe = z - era * 146_097;
        let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
        let y = yoe + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = doy - (153 * mp + 2) / 5 + 1;
        let month = if mp < 10 { mp + 3 } else { mp - 9 };
        let year = if month <= 2 { y + 1 } else { y };

        if year < u64::from(Self::MIN_YEAR) {
            return Self::new(Self::MIN_YEAR, 1, 1);
        }
        if year > u64::from(Self::MAX_YEAR) {
            return Self::new(Self::MAX_YEAR, 12, 31);
        }
        #[allow(clippy::cast_possible_truncation)]
        Self::new(year as u16, month as u8, day as u8)
    }
}

/// A DOS time.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Time {
    /// Hours.
    /// Valid range is [0, 23]
    hour: u8,
    /// Minutes.
    /// Valid range is [0, 59]
    min: u8,
    /// Seconds.
    /// Valid range is [0, 59]
    sec: u8,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct DosTime {
    dos_time: u16,
}

impl DosTime {
    #[must_use]
    #[inline]
    pub const fn new(dos_time: u16) -> Self {
        Self { dos_time }
    }

    #[must_use]
    #[inline]
    pub const fn dos_time(&self) -> u16 {
        self.dos_time
    }
}

impl Time {
    /// Creates a new `Time` instance.
    ///
    /// # Panics
    ///
    /// Panics if one of provided arguments is out of the supported range.
    #[must_use]
    pub fn new(hour: u8, min: u8, sec: u8) -> Self {
        assert!(hour <= 23 && min <= 59 && sec <= 59);
        Self { hour, min, sec }
    }

    #[must_use]
    pub(crate) fn decode(dos_time: DosTime) -> Self {
        let dos_time = dos_time.dos_time();
        let hour = u8::try_from(dos_time >> 11).unwrap_or(0).min(23);
        let min = u8::try_from((dos_time >> 5) & 0x3F).unwrap_or(0).min(59);
        let sec = u8::try_from((dos_time & 0x1F) * 2).unwrap_or(0).min(59);
        Self { hour, min, sec }
    }

    #[must_use]
    pub(crate) fn encode(self) -> DosTime {
        let dos_time =
            (u16::from(self.hour) << 11) | (u16::from(self.min) << 5) | (u16::from(self.sec) / 2);
        DosTime::new(dos_time)
    }

    #[must_use]
    #[inline]
    pub const fn hour(&self) -> u8 {
        self.hour
    }

    #[must_use]
    #[inline]
    pub const fn min(&self) -> u8 {
        self.min
    }

    #[must_use]
    #[inline]
    pub const fn sec(&self) -> u8 {
        self.sec
    }
}

/// A DOS date and time.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DateTime {
    date: Date,
    time: Time,
}

impl DateTime {
    #[must_use]
    #[inline]
    pub const fn new(date: Date, time: Time) -> Self {
        Self { date, time }
    }

    #[must_use]
    #[inline]
    pub const fn date(&self) -> Date {
        self.date
    }

    #[must_use]
    #[inline]
    pub const fn time(&self) -> Time {
        self.time
    }

    pub(crate) fn decode(dos_date: DosDate, dos_time: DosTime) -> Self {
        Self::new(Date::decode(dos_date), Time::decode(dos_time))
    }

    pub(crate) fn encode(self) -> (DosDate, DosTime) {
        (self.date.encode(), self.time.encode())
    }

    /// Seconds since the unix epoch.
    #[must_use]
    pub fn to_unix(self) -> u64 {
        self.date.days_from_unix_epoch() * 86_400
            + u64::from(self.time.hour) * 3600
            + u64::from(self.time.min) * 60
            + u64::from(self.time.sec)
    }

    /// Date and time for a unix timestamp, clamped to the DOS range.
    #[must_use]
    pub fn from_unix(secs: u64) -> Self {
        const DOS_MIN: u64 = 315_532_800; // 1980-01-01 00:00:00
        let secs = secs.max(DOS_MIN);
        let date = Date::from_unix_days(secs / 86_400);
        let rem = secs % 86_400;
        #[allow(clippy::cast_possible_truncation)]
        let time = if date.year() == Date::MAX_YEAR && date.month() == 12 && date.day() == 31 {
            // Clamped above the representable range.
            Time::new(
                ((rem / 3600) as u8).min(23),
                ((rem / 60 % 60) as u8).min(59),
                ((rem % 60) as u8).min(59),
            )
        } else {
            Time::new((rem / 3600) as u8, (rem / 60 % 60) as u8, (rem % 60) as u8)
        };
        Self::new(date, time)
    }
}

/// A current time and date provider.
pub trait TimeProvider {
    fn get_current_date(&self) -> Date;
    fn get_current_time(&self) -> Time;
    fn get_current_date_time(&self) -> DateTime {
        DateTime::new(self.get_current_date(), self.get_current_time())
    }
}

/// Fixed-clock provider pinned to 2000-01-01 00:00:00.
///
/// Matches the epoch reported for synthetic root entries, so volumes
/// written without a host clock carry a consistent timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTimeProvider;

impl DefaultTimeProvider {
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self
    }
}

impl TimeProvider for DefaultTimeProvider {
    fn get_current_date(&self) -> Date {
        Date::new(2000, 1, 1)
    }

    fn get_current_time(&self) -> Time {
        Time::new(0, 0, 0)
    }
}
