/// A group of files sharing the same content hash (duplicates).
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DuplicateGroupByHash {
    pub hash: String,
    pub count: i64,
    /// Sum of the sizes of all files in the group.
    pub size: i64,
}

/// A group of files sharing the same `(inode, device_id)` (hardlinks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroupByInode {
    pub inode: i64,
    pub device_id: Option<i64>,
    pub count: i64,
    pub size: i64,
}
