pub mod bond;
pub mod holding;
pub mod order;
pub mod trade;
pub mod user;

pub use bond::*;
pub use holding::*;
pub use order::*;
pub use trade::*;
pub use user::*;

// Helper module to serialize DateTime as milliseconds timestamp
pub(crate) mod datetime_as_millis {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(dt.timestamp_millis())
    }
}
