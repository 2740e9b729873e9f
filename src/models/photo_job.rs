use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Location fix captured alongside a photo phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate, PartialEq)]
pub struct LocationSnapshot {
    #[garde(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[garde(range(min = -180.0, max = 180.0))]
    pub longitude: f64,

    #[garde(skip)]
    #[serde(default)]
    pub accuracy_m: Option<f64>,
}

/// One capture phase's photo batch awaiting upload.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct PhotoUploadJob {
    #[garde(skip)]
    pub id: Uuid,

    #[garde(length(min = 1, max = 128))]
    pub ticket_id: String,

    #[garde(length(min = 1, max = 128))]
    pub user_id: String,

    /// Raw capture files, in upload order.
    #[garde(length(min = 1, max = 50), inner(length(min = 1)))]
    pub photo_uris: Vec<String>,

    #[garde(skip)]
    pub timestamp: DateTime<Utc>,

    #[garde(dive)]
    #[serde(default)]
    pub location: Option<LocationSnapshot>,

    /// Ledger `queue_order` of the first photo in this batch.
    #[garde(skip)]
    pub photo_start_index: u32,

    #[garde(skip)]
    #[serde(default)]
    pub attempts: u32,
}

impl PhotoUploadJob {
    pub fn new(
        ticket_id: impl Into<String>,
        user_id: impl Into<String>,
        photo_uris: Vec<String>,
        timestamp: DateTime<Utc>,
        location: Option<LocationSnapshot>,
        photo_start_index: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticket_id: ticket_id.into(),
            user_id: user_id.into(),
            photo_uris,
            timestamp,
            location,
            photo_start_index,
            attempts: 0,
        }
    }

    /// Ledger order of the photo at `index` within this batch.
    pub fn queue_order(&self, index: usize) -> u32 {
        self.photo_start_index + index as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(uris: Vec<String>) -> PhotoUploadJob {
        PhotoUploadJob::new("T-1", "U-1", uris, Utc::now(), None, 4)
    }

    #[test]
    fn well_formed_job_validates() {
        assert!(job(vec!["/tmp/a.jpg".into()]).validate().is_ok());
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(job(vec![]).validate().is_err());
    }

    #[test]
    fn blank_uri_is_rejected() {
        assert!(job(vec!["/tmp/a.jpg".into(), String::new()]).validate().is_err());
    }

    #[test]
    fn out_of_range_location_is_rejected() {
        let mut j = job(vec!["/tmp/a.jpg".into()]);
        j.location = Some(LocationSnapshot {
            latitude: 123.0,
            longitude: 10.0,
            accuracy_m: None,
        });
        assert!(j.validate().is_err());
    }

    #[test]
    fn queue_order_offsets_from_start_index() {
        let j = job(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(j.queue_order(0), 4);
        assert_eq!(j.queue_order(2), 6);
    }
}
