pub const PARTITION_KEY_PREFIX: &str = "NAMESPACE#";
pub const SORT_KEY_PREFIX: &str = "KEY#";
pub const MAX_PARTITION_KEY_BYTES: usize = 2048;
pub const MAX_SORT_KEY_BYTES: usize = 1024;

pub fn partition_key(namespace_id: &str) -> String {
    format!("{PARTITION_KEY_PREFIX}{namespace_id}")
}

pub fn sort_key(key: &str) -> String {
    format!("{SORT_KEY_PREFIX}{key}")
}
