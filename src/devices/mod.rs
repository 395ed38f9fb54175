//! Feeder device records as laid out in the document store.

mod models;
pub mod paths;

pub use models::{
    history_payload, Device, FeedAction, FeedReading, HistoryEntry, NotificationRecord,
};
