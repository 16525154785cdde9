//! Wire models of the feeder's REST API and push channel.
//!
//! Types only; the client lives in `crate::client`.
//!
//! Notes
//! - Keys are PascalCase as produced by the firmware's JSON helpers; the push envelope
//!   (`status`, `history`, `scaleData`) uses lower camel case.
//! - Enumerations travel as integers.
//! - Daytimes are milliseconds since epoch day zero; `CreatedOn` values are unix seconds.

use serde::{Deserialize, Serialize};

/// Implements integer (de)serialization for a fieldless enum.
macro_rules! int_enum {
    ($name:ident, $expecting:literal, { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl $name {
            pub fn code(self) -> i64 {
                match self {
                    $($name::$variant => $value,)+
                }
            }

            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_i64(self.code())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct V;
                impl<'de> serde::de::Visitor<'de> for V {
                    type Value = $name;

                    fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                        write!(f, $expecting)
                    }

                    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        $name::from_code(value)
                            .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Signed(value), &self))
                    }

                    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        i64::try_from(value)
                            .ok()
                            .and_then($name::from_code)
                            .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Unsigned(value), &self))
                    }
                }

                deserializer.deserialize_any(V)
            }
        }
    };
}

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

// =====================
// Enums
// =====================

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum ScheduleMode {
    #[default]
    FixedDaytime,
    MaxTimes,
}

int_enum!(ScheduleMode, "an integer 0 or 1 for ScheduleMode", {
    FixedDaytime = 0,
    MaxTimes = 1,
});

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Feed,
    MissedFeed,
    ContainerEmpty,
    MotorFailure,
    WiFiConnectionLost,
    WiFiConnectionReturned,
    SdConnectionLost,
    SdConnectionReturned,
    SkippedFeed,
}

int_enum!(EventType, "an integer 0..=8 for EventType", {
    Feed = 0,
    MissedFeed = 1,
    ContainerEmpty = 2,
    MotorFailure = 3,
    WiFiConnectionLost = 4,
    WiFiConnectionReturned = 5,
    SdConnectionLost = 6,
    SdConnectionReturned = 7,
    SkippedFeed = 8,
});

impl EventType {
    /// Events that consume or release a feeding slot.
    pub fn is_feeding(self) -> bool {
        matches!(self, EventType::Feed | EventType::MissedFeed | EventType::SkippedFeed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scale {
    Container,
    Plate,
}

int_enum!(Scale, "an integer 0 (container) or 1 (plate) for Scale", {
    Container = 0,
    Plate = 1,
});

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum Language {
    #[default]
    German,
    English,
}

int_enum!(Language, "an integer 0 or 1 for Language", {
    German = 0,
    English = 1,
});

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum Theme {
    #[default]
    Boring,
    Dark,
}

int_enum!(Theme, "an integer 0 or 1 for Theme", {
    Boring = 0,
    Dark = 1,
});

// =====================
// Device state
// =====================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineStatus {
    /// Grams in the storage container.
    pub container_load: f64,
    /// Grams on the plate.
    pub plate_load: f64,
    /// Feeding gate open.
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub motor_operation: bool,
    #[serde(rename = "SDCardConnection", default)]
    pub sd_card_connection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic_feeding: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_feeding: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Schedule {
    /// Absent until the device has persisted the schedule.
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ScheduleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<i64>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub selected: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub mode: ScheduleMode,
    #[serde(default)]
    pub daytimes: Vec<i64>,
    #[serde(default)]
    pub max_times: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_times_start_time: Option<i64>,
    #[serde(default)]
    pub only_when_empty: bool,
}

impl Schedule {
    /// The schedule currently governing feeding on the device.
    pub fn is_current(&self) -> bool {
        self.selected && self.active
    }

    /// Restore the ascending, duplicate-free daytime order.
    pub fn normalize_daytimes(&mut self) {
        self.daytimes.sort_unstable();
        self.daytimes.dedup();
    }

    /// Required fields per mode, checked before any save is attempted.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("schedule name is required".to_string());
        }
        match self.mode {
            ScheduleMode::FixedDaytime if self.daytimes.is_empty() => {
                Err("a fixed-daytime schedule needs at least one daytime".to_string())
            }
            ScheduleMode::MaxTimes if self.max_times == 0 => {
                Err("a max-times schedule needs a positive feeding count".to_string())
            }
            ScheduleMode::MaxTimes if self.max_times_start_time.is_none() => {
                Err("a max-times schedule needs a start time".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleList {
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

// =====================
// Settings
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    pub active: bool,
    pub email: bool,
    pub phone: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotificationList {
    #[serde(default)]
    pub container_empty: Notification,
    #[serde(default)]
    pub did_not_eat_in_a_day: Notification,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pet_name: Option<String>,
    /// Tare of the empty plate.
    #[serde(rename = "PlateTAR", default, skip_serializing_if = "Option::is_none")]
    pub plate_tar: Option<f64>,
    /// Grams that count as a full plate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_filling: Option<f64>,
    #[serde(default)]
    pub notifications: NotificationList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub theme: Theme,
}

// =====================
// History / push channel
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    #[serde(rename = "ID")]
    pub id: EventId,
    pub created_on: i64,
    #[serde(rename = "Type")]
    pub kind: EventType,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScaleData {
    #[serde(rename = "ID", default)]
    pub id: i64,
    pub created_on: i64,
    #[serde(rename = "ScaleID")]
    pub scale: Scale,
    pub value: f64,
}

impl ScaleData {
    pub fn identity(&self) -> (Scale, i64) {
        (self.scale, self.created_on)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoryData {
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(rename = "scaleData", default)]
    pub scale_data: Vec<ScaleData>,
}

impl HistoryData {
    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty() && self.events.is_empty() && self.scale_data.is_empty()
    }
}

/// One message from the push channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MachineStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryData>,
}
