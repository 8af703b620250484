//! Synced record types.

use crate::tracking::{ChangeTracking, RecordKind, TrackedRecord};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

macro_rules! impl_tracked {
    ($record:ty, $key:ty, $kind:expr, |$this:ident| $key_expr:expr) => {
        impl TrackedRecord for $record {
            type Key = $key;

            const KIND: RecordKind = $kind;

            fn key(&self) -> Self::Key {
                let $this = self;
                $key_expr
            }

            fn tracking(&self) -> &ChangeTracking {
                &self.tracking
            }

            fn tracking_mut(&mut self) -> &mut ChangeTracking {
                &mut self.tracking
            }
        }
    };
}

/// Identity of a prescription: the drug and the second it was prescribed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrescriptionKey {
    /// Drug UID of the prescribed medication.
    pub drug_uid: String,
    /// Prescription date as Unix seconds.
    pub prescribed_at: i64,
}

/// A medication prescription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prescription {
    /// Drug UID of the prescribed medication.
    pub drug_uid: String,
    /// When the prescription was issued.
    pub prescription_date: DateTime<Utc>,
    /// Doses per day.
    pub doses_per_day: u32,
    /// Inhalations per dose.
    pub inhales_per_dose: u32,
    /// Change tracking.
    pub tracking: ChangeTracking,
}

impl Prescription {
    /// Creates a prescription with default tracking.
    pub fn new(drug_uid: impl Into<String>, prescription_date: DateTime<Utc>) -> Self {
        Self {
            drug_uid: drug_uid.into(),
            prescription_date,
            doses_per_day: 1,
            inhales_per_dose: 1,
            tracking: ChangeTracking::default(),
        }
    }
}

impl_tracked!(Prescription, PrescriptionKey, RecordKind::Prescription, |p| {
    PrescriptionKey {
        drug_uid: p.drug_uid.clone(),
        prescribed_at: p.prescription_date.timestamp(),
    }
});

/// A connected inhaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Serial number printed on the inhaler.
    pub serial_number: String,
    /// User-chosen name.
    pub nickname: String,
    /// Drug UID of the medication in the inhaler.
    pub drug_uid: String,
    /// Whether the device is in use.
    pub is_active: bool,
    /// Doses remaining as last reported.
    pub remaining_doses: u32,
    /// Last BLE connection.
    pub last_connection: Option<DateTime<Utc>>,
    /// Change tracking.
    pub tracking: ChangeTracking,
}

impl Device {
    /// Creates an active device with default tracking.
    pub fn new(serial_number: impl Into<String>, drug_uid: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            nickname: String::new(),
            drug_uid: drug_uid.into(),
            is_active: true,
            remaining_doses: 0,
            last_connection: None,
            tracking: ChangeTracking::default(),
        }
    }
}

impl_tracked!(Device, String, RecordKind::Device, |d| d.serial_number.clone());

/// Identity of an inhale event: the owning device and the device's event UID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InhaleEventKey {
    /// Serial number of the recording device.
    pub device_serial_number: String,
    /// Event UID assigned by the device.
    pub event_uid: u32,
}

/// An inhalation recorded by an inhaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InhaleEvent {
    /// Serial number of the recording device.
    pub device_serial_number: String,
    /// Event UID assigned by the device.
    pub event_uid: u32,
    /// When the inhaler cap was opened.
    pub event_time: DateTime<Utc>,
    /// Inhalation duration in milliseconds.
    pub duration_ms: u32,
    /// Peak inspiratory flow in tenths of a litre per minute.
    pub peak_flow: u32,
    /// Device status flags.
    pub status: u16,
    /// Change tracking.
    pub tracking: ChangeTracking,
}

impl InhaleEvent {
    /// Creates an event with default tracking.
    pub fn new(
        device_serial_number: impl Into<String>,
        event_uid: u32,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            device_serial_number: device_serial_number.into(),
            event_uid,
            event_time,
            duration_ms: 0,
            peak_flow: 0,
            status: 0,
            tracking: ChangeTracking::default(),
        }
    }
}

impl_tracked!(InhaleEvent, InhaleEventKey, RecordKind::InhaleEvent, |e| {
    InhaleEventKey {
        device_serial_number: e.device_serial_number.clone(),
        event_uid: e.event_uid,
    }
});

/// How the user felt on a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeelingLevel {
    /// Poor.
    Poor,
    /// Bad.
    Bad,
    /// Ok.
    Ok,
    /// Good.
    Good,
    /// Great.
    Great,
}

/// A daily self-assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyFeeling {
    /// The assessed day.
    pub date: NaiveDate,
    /// Reported feeling.
    pub feeling: FeelingLevel,
    /// Change tracking.
    pub tracking: ChangeTracking,
}

impl DailyFeeling {
    /// Creates an assessment with default tracking.
    pub fn new(date: NaiveDate, feeling: FeelingLevel) -> Self {
        Self {
            date,
            feeling,
            tracking: ChangeTracking::default(),
        }
    }
}

impl_tracked!(DailyFeeling, NaiveDate, RecordKind::DailyFeeling, |f| f.date);

/// A reminder on/off setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderSetting {
    /// Setting name, unique per account.
    pub name: String,
    /// Whether the reminder is enabled.
    pub is_enabled: bool,
    /// Seconds after midnight the reminder fires, if scheduled at a fixed time.
    pub time_of_day: Option<u32>,
    /// Change tracking.
    pub tracking: ChangeTracking,
}

impl ReminderSetting {
    /// Creates a setting with default tracking.
    pub fn new(name: impl Into<String>, is_enabled: bool) -> Self {
        Self {
            name: name.into(),
            is_enabled,
            time_of_day: None,
            tracking: ChangeTracking::default(),
        }
    }
}

impl_tracked!(ReminderSetting, String, RecordKind::ReminderSetting, |s| s.name.clone());

/// An account owner or dependent profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Server profile ID.
    pub profile_id: String,
    /// First name.
    pub first_name: String,
    /// Last name.
    pub last_name: String,
    /// Date of birth.
    pub date_of_birth: Option<NaiveDate>,
    /// Whether this profile owns the account.
    pub is_account_owner: bool,
    /// Whether this profile is the one currently in use.
    pub is_active: bool,
    /// Whether this profile is an emancipated minor.
    pub is_emancipated: bool,
    /// Change tracking.
    pub tracking: ChangeTracking,
}

impl UserProfile {
    /// Creates the account owner's profile.
    pub fn account_owner(profile_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            first_name: String::new(),
            last_name: String::new(),
            date_of_birth: None,
            is_account_owner: true,
            is_active: true,
            is_emancipated: false,
            tracking: ChangeTracking::default(),
        }
    }

    /// Creates a dependent profile.
    pub fn dependent(profile_id: impl Into<String>) -> Self {
        Self {
            is_account_owner: false,
            is_active: false,
            ..Self::account_owner(profile_id)
        }
    }
}

impl_tracked!(UserProfile, String, RecordKind::UserProfile, |p| p.profile_id.clone());
