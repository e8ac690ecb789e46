use read_process_memory::Pid;
use thiserror::Error;

/// Everything that can go wrong while reading a process or rebuilding an
/// image out of it. All of these are fatal to the operation in progress;
/// nothing here is retried or papered over with default values.
#[derive(Error, Debug)]
pub(crate) enum DumpError {
    #[error("failed to get a handle to pid {pid} (are you running as root?)")]
    PermissionDenied { pid: Pid },

    #[error("memory read at {address:#x} failed: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("partial read at {address:#x}: requested {requested:#x} bytes, got {got:#x}")]
    PartialRead {
        address: u64,
        requested: u64,
        got: u64,
    },

    #[error("not a Mach-O image (magic {magic:#010x})")]
    NotAnImage { magic: u32 },

    #[error("malformed load command table: {reason}")]
    MalformedLoadCommands { reason: String },

    #[error("no main executable image found in the target process")]
    NotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
