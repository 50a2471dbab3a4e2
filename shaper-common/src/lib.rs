//! Common constants shared by the shaper crates.

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u64 = 1024;
    pub const MiB: u64 = 1024 * KiB;
    pub const GiB: u64 = 1024 * MiB;

    /// Largest datagram the daemon ever hands to the transport. The global
    /// bucket capacity is never allowed below this, so a lone datagram can
    /// always be admitted eventually.
    pub const MAX_DATAGRAM_SIZE: u64 = 64 * KiB;

    /// Data block size used by the synchronization protocol. Watermarks are
    /// configured in multiples of this.
    pub const CHUNK_SIZE: u64 = 128 * KiB;

    /// Stand-in fill rate for "unlimited" (a configured rate of zero).
    pub const MAX_RATE: u64 = 8 * GiB;

    /// Lowest rate the negotiation protocol will ever assign to a peer.
    pub const MIN_RATE: u64 = 4 * KiB;
}
