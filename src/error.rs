use thiserror::Error;

/// The subset of the WASI `$errno` type this host actually reports back to
/// guests. Values are the wire encoding defined by the snapshot-1 witx; only
/// the codes produced by the stream/stub surface are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u16)]
pub enum Errno {
    /// Errno::Success: No error occurred
    #[error("Success: No error occurred")]
    Success = 0,
    /// Errno::Acces: Permission denied
    #[error("Acces: Permission denied")]
    Acces = 2,
    /// Errno::Again: Resource unavailable, or operation would block
    #[error("Again: Resource unavailable, or operation would block")]
    Again = 6,
    /// Errno::Badf: Bad file descriptor
    #[error("Badf: Bad file descriptor")]
    Badf = 8,
    /// Errno::Fault: Bad address
    #[error("Fault: Bad address")]
    Fault = 21,
    /// Errno::Inval: Invalid argument
    #[error("Inval: Invalid argument")]
    Inval = 28,
    /// Errno::Io: I/O error
    #[error("Io: I/O error")]
    Io = 29,
    /// Errno::Noent: No such file or directory
    #[error("Noent: No such file or directory")]
    Noent = 44,
    /// Errno::Nosys: Function not supported
    #[error("Nosys: Function not supported")]
    Nosys = 52,
    /// Errno::Notsup: Not supported, or operation not supported on socket
    #[error("Notsup: Not supported")]
    Notsup = 58,
    /// Errno::Overflow: Value too large to be stored in data type
    #[error("Overflow: Value too large to be stored in data type")]
    Overflow = 61,
    /// Errno::Perm: Operation not permitted
    #[error("Perm: Operation not permitted")]
    Perm = 63,
    /// Errno::Range: Result too large
    #[error("Range: Result too large")]
    Range = 68,
    /// Errno::Spipe: Invalid seek
    #[error("Spipe: Invalid seek")]
    Spipe = 70,
}

impl Errno {
    /// The value written back over the guest ABI boundary.
    pub fn raw(self) -> i32 {
        self as u16 as i32
    }
}
