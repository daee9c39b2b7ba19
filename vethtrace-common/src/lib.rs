//! Traffic record layout shared between the kernel probe and userspace
//!
//! The probe writes fixed-offset records into its output map. Every
//! multi-byte field sits in its own 4-byte slot so the kernel side can write
//! it with a plain store; only the leading bytes of a slot are meaningful for
//! the 16-bit fields.
//!
//! ```text
//!  0      4        8        12       16       20       24         28     32   33        83
//!  | phase| daddr  | dport  | saddr  | sport  | seq    | duration | pid  | len| path    | status ...
//! ```
//!
//! Ports, sequence and duration are big-endian (copied from the wire); the
//! pid is written by the probe in host order and is little-endian on every
//! supported target.

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Record offsets
pub mod layout {
    /// Protocol phase marker (single byte)
    pub const PHASE: usize = 0;
    /// Destination IPv4 address (4 bytes)
    pub const DST_ADDR: usize = 4;
    /// Destination port slot (first 2 bytes, big-endian)
    pub const DST_PORT: usize = 8;
    /// Source IPv4 address (4 bytes)
    pub const SRC_ADDR: usize = 12;
    /// Source port slot (first 2 bytes, big-endian)
    pub const SRC_PORT: usize = 16;
    /// Sequence slot (first 2 bytes, big-endian)
    pub const SEQ: usize = 20;
    /// Request duration in ticks (big-endian u32)
    pub const DURATION: usize = 24;
    /// Originating process id (little-endian u32)
    pub const PID: usize = 28;
    /// Length prefix of the compressed path
    pub const PATH_LEN: usize = 32;
    /// Start of the NUL-padded compressed path buffer
    pub const PATH: usize = 33;
    /// Start of the NUL-padded compressed status trailer
    pub const STATUS: usize = 83;

    /// Size of the kernel-side path buffer
    pub const PATH_CAPACITY: usize = STATUS - PATH;

    /// Smallest buffer that carries every fixed field
    pub const MIN_RECORD_LEN: usize = STATUS;
}

/// Capacity of the dynamic table used when the probe-side header block was
/// compressed
pub const HEADER_TABLE_CAPACITY: usize = 2048;

const _: () = {
    use layout::*;
    assert!(DST_PORT == DST_ADDR + 4, "address and port slots must be adjacent");
    assert!(SRC_PORT == SRC_ADDR + 4, "address and port slots must be adjacent");
    assert!(PID + 4 == PATH_LEN, "pid must directly precede the path length");
    assert!(PATH == PATH_LEN + 1, "path must follow its length prefix");
    assert!(PATH_CAPACITY == 50, "path buffer must be 50 bytes");
};
