mod duplicate;
mod file;
mod folder;
mod scan;

pub use self::duplicate::DuplicateGroupByHash;
pub use self::duplicate::DuplicateGroupByInode;
pub use self::file::File;
pub use self::file::HashStatus;
pub use self::file::NewFile;
pub(crate) use self::file::FileRow;
pub use self::folder::Folder;
pub(crate) use self::folder::FolderRow;
pub use self::scan::Scan;
pub(crate) use self::scan::ScanRow;
