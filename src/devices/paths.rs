//! Store paths for device data.

pub const DEVICES: &str = "devices";

/// Shopping cart items, each with the `createdBy` user id.
pub const CARTS: &str = "cart";

pub fn device(device_id: &str) -> String {
    format!("{DEVICES}/{device_id}")
}

pub fn histories(device_id: &str) -> String {
    format!("{DEVICES}/{device_id}/histories")
}

pub fn notifications(device_id: &str) -> String {
    format!("{DEVICES}/{device_id}/notifications")
}

/// Links between a device and the users following it.
pub fn device_users(device_id: &str) -> String {
    format!("{DEVICES}/{device_id}/users")
}

pub fn user_tokens(user_id: &str) -> String {
    format!("users/{user_id}/device_tokens")
}

/// Device ids become a single path segment.
pub fn is_valid_device_id(device_id: &str) -> bool {
    !device_id.trim().is_empty() && !device_id.contains('/')
}
