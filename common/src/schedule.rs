//! Weekly preset programme. Evaluated by the host in the fleet's time zone; a
//! change of entry becomes an automation `set_preset`.

use chrono::{DateTime, Datelike, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

use crate::preset::Preset;

const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub day: DayOfWeek,
    #[serde(rename = "startMinutes")]
    pub start_minutes: u16,
    pub preset: Preset,
}

impl ScheduleEntry {
    pub fn is_valid(&self) -> bool {
        self.start_minutes < MINUTES_PER_DAY && !self.preset.is_hidden()
    }

    /// Minutes since Monday 00:00.
    fn week_minute(&self) -> u32 {
        self.day as u32 * u32::from(MINUTES_PER_DAY) + u32::from(self.start_minutes)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub entries: Vec<ScheduleEntry>,
}

impl Schedule {
    /// Drops invalid entries and orders the rest through the week.
    pub fn normalize(&mut self) {
        self.entries.retain(ScheduleEntry::is_valid);
        self.entries.sort_by_key(ScheduleEntry::week_minute);
        self.entries.dedup_by_key(|entry| entry.week_minute());
    }

    /// Preset of the entry in force at `now`. Before the first entry of the week
    /// the last one is still running.
    pub fn current_preset<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<Preset> {
        if !self.enabled {
            return None;
        }
        let position = now.weekday().num_days_from_monday() * u32::from(MINUTES_PER_DAY)
            + now.hour() * 60
            + now.minute();

        self.entries
            .iter()
            .filter(|entry| entry.week_minute() <= position)
            .max_by_key(|entry| entry.week_minute())
            .or_else(|| self.entries.iter().max_by_key(|entry| entry.week_minute()))
            .map(|entry| entry.preset)
    }
}
