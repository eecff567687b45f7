/// Reserved bytes at the start of every pool backing file. The encoded
/// pool attributes live here; the usable region starts right after.
pub const POOL_HDR_SIZE: usize = 4096;

/// Upper bound on the number of lanes granted to a single session.
pub const NLANES_MAX: u32 = 1024;

/// Environment variable overriding the tunnel binary name on the client.
pub const SSH_ENV_VAR: &str = "RPMEM_SSH_ENV";
pub const DEFAULT_SSH: &str = "ssh";

pub const STDIN_FD: i32 = 0;
pub const STDOUT_FD: i32 = 1;

/// How much of the tunnel's stderr we read when turning it into a
/// one-line error message.
pub const ERR_LINE_MAX: usize = 4096;
