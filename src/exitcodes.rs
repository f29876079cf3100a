//! Process exit codes used by the cloakfs binary.
//!
//! Scripts depend on these staying stable, so they are spelled out instead
//! of being derived from error variants.

/// Wrong command line or conflicting options.
pub const USAGE: i32 = 9;
/// Could not read the password (terminal, stdin or passfile).
pub const READ_PASSWORD: i32 = 10;
/// The password was empty.
pub const PASSWORD_EMPTY: i32 = 12;
/// The cipher directory is missing, not a directory, or not usable.
pub const CIPHER_DIR: i32 = 16;
/// Volume initialization failed.
pub const INIT: i32 = 21;
/// Loading the config file failed (missing, malformed, or wrong password).
pub const LOAD_CONF: i32 = 23;
/// Writing the config file failed.
pub const WRITE_CONF: i32 = 24;
/// An exclude pattern could not be parsed.
pub const EXCLUDE_ERROR: i32 = 25;
