use crate::config::{parse_time, MarketSettings};
use crate::error::{BotError, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

/// Exchange trading hours in the exchange's local timezone
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketHours {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    session_cutoff: NaiveTime,
}

impl MarketHours {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime, session_cutoff: NaiveTime) -> Self {
        Self {
            tz,
            open,
            close,
            session_cutoff,
        }
    }

    pub fn from_settings(settings: &MarketSettings) -> Result<Self> {
        let tz: Tz = settings
            .timezone
            .parse()
            .map_err(|e| BotError::Config(format!("market.timezone: {}", e)))?;
        let time = |value: &str| {
            parse_time(value).map_err(|e| BotError::Config(format!("{}: {}", value, e)))
        };
        Ok(Self::new(
            tz,
            time(&settings.open)?,
            time(&settings.close)?,
            time(&settings.session_cutoff)?,
        ))
    }

    pub fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        now.with_timezone(&self.tz).time()
    }

    /// Exchange-local calendar date, used for daily resets
    pub fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// Weekday between the open and the close (both inclusive)
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let t = local.time();
        t >= self.open && t <= self.close
    }

    /// Positions must be flat from the session cut-off onwards
    pub fn past_session_cutoff(&self, now: DateTime<Utc>) -> bool {
        self.local_time(now) >= self.session_cutoff
    }

    pub fn session_cutoff(&self) -> NaiveTime {
        self.session_cutoff
    }
}

impl Default for MarketHours {
    fn default() -> Self {
        Self::new(
            chrono_tz::Asia::Kolkata,
            NaiveTime::from_hms_opt(9, 15, 0).unwrap_or(NaiveTime::MIN),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap_or(NaiveTime::MIN),
            NaiveTime::from_hms_opt(15, 20, 0).unwrap_or(NaiveTime::MIN),
        )
    }
}
