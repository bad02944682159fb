#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Out of memory")]
    OutOfMemory,
    #[error("IO: {0}")]
    Io(IoError),
    #[error("FS: {0}")]
    Fs(FsError),
}

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("Out of range")]
    OutOfRange,
    #[error("Read failed")]
    ReadFailed,
}

#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("Bad file system: {0}")]
    BadFs(&'static str),
    #[error("Bad file type")]
    BadFileType,
    #[error("File not found")]
    FileNotFound,
}

pub type Result<T> = core::result::Result<T, Error>;
