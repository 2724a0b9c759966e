use std::time::Duration;
use anyhow::bail;

pub struct ArqConfig {
    /// This is the MTU (i.e. the IP packet size) that the engine assumes for all datagrams it
    ///  sends. The usable payload is derived from it by subtracting IP and UDP header sizes,
    ///  the encryption envelope (if any) and the ARQ header.
    ///
    /// There is no MTU discovery. With full Ethernet frames on all routes, 1500 works; across
    ///  the internet there may be surprising network hardware on (some of) the routes, and 576
    ///  is the size every IPv4 host must accept.
    ///
    /// Choosing this value too big causes datagrams to be dropped, which may be partial if only
    ///  some of the routes support smaller frames. Choosing it too small wastes bandwidth.
    pub mtu: usize,

    /// The protocol version this side starts with. Version 2 batches several overdue packages
    ///  into a single combined resend datagram, version 1 resends one package per datagram.
    ///  A connection downgrades to version 1 when the peer sends version 1 datagrams.
    pub protocol_version: u8,

    /// This is the maximum number of sent but unacknowledged *packages* (not bytes). Once it is
    ///  reached, no new data is sent until acknowledgements free up space - resends and
    ///  feedback still flow.
    pub unconfirmed_package_limit: usize,

    /// upper bound for the number of resent packages per sending cycle
    pub max_resent_count_per_call: usize,

    /// If there are at least this many unacknowledged packages, the peer is asked for a full
    ///  snapshot of its receive state ('force sync') rather than waiting for incremental acks
    pub urgent_sync_triggered_threshold: usize,
    pub urgent_sync_interval: Duration,

    /// interval for heartbeat packages if keep alive is enabled and nothing else was sent
    pub heartbeat_interval: Duration,

    /// A connection that did not receive anything valid for this long is considered dead. `None`
    ///  disables the check.
    pub untransmitted_timeout: Option<Duration>,

    /// grace period for a session to receive its first valid datagram
    pub max_tolerated_before_first_package: Duration,
    /// maximum time between two valid datagrams once the session is established
    pub max_tolerated_before_valid_package: Duration,
    /// number of invalid datagrams (bad checksum, failed decryption, ...) after which the session
    ///  is treated as invalid
    pub max_invalid_packages: u32,

    /// upper bound for the length of a single received datagram and for the declared length of
    ///  a reassembled package or an application message
    pub max_recv_package_length: usize,

    /// Tracked sequence numbers that are further ahead than this of the last contiguously
    ///  received sequence number are dropped.
    ///
    /// NB: This must be bigger than the peer's `unconfirmed_package_limit`
    pub disordered_seq_window: u32,
    /// how long a gap in received sequence numbers is waited for before it is skipped
    pub max_seq_gap_wait: Duration,
    /// datagrams arriving before the peer's first package are cached up to this number
    pub max_cached_before_first_package: usize,

    /// staleness threshold for partially received segmented packages
    pub uncompleted_package_timeout: Duration,
    /// upper bound for the number of cached segments across all partially received packages
    pub max_cached_segments: usize,

    pub min_resend_interval: Duration,
    pub max_resend_interval: Duration,
    /// resend interval before any round trip was observed
    pub initial_resend_interval: Duration,

    /// 0 means 'unlimited'
    pub max_datagrams_per_second: u32,

    /// The static X25519 private key to answer ECDH handshakes initiated by the peer. `None`
    ///  means the engine can only act as the initiator of a key exchange.
    pub ecdh_private_key: Option<[u8; 32]>,

    /// interval at which the driver checks for resends, heartbeats and timeouts
    pub tick_interval: Duration,
}

impl ArqConfig {
    pub const PROTOCOL_VERSION_1: u8 = 1;
    pub const PROTOCOL_VERSION_2: u8 = 2;

    /// full Ethernet MTU end-to-end, e.g. inside a data center
    pub fn default_lan() -> ArqConfig {
        ArqConfig {
            mtu: 1500,
            protocol_version: Self::PROTOCOL_VERSION_2,
            unconfirmed_package_limit: 320,
            max_resent_count_per_call: 16,
            urgent_sync_triggered_threshold: 280,
            urgent_sync_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_secs(10),
            untransmitted_timeout: Some(Duration::from_secs(60)),
            max_tolerated_before_first_package: Duration::from_secs(30),
            max_tolerated_before_valid_package: Duration::from_secs(20),
            max_invalid_packages: 16,
            max_recv_package_length: 8*1024*1024,
            disordered_seq_window: 10_000,
            max_seq_gap_wait: Duration::from_secs(15),
            max_cached_before_first_package: 64,
            uncompleted_package_timeout: Duration::from_secs(20),
            max_cached_segments: 8192,
            min_resend_interval: Duration::from_millis(20),
            max_resend_interval: Duration::from_secs(3),
            initial_resend_interval: Duration::from_millis(200),
            max_datagrams_per_second: 0,
            ecdh_private_key: None,
            tick_interval: Duration::from_millis(20),
        }
    }

    /// minimum MTU every IPv4 host must accept
    pub fn default_internet() -> ArqConfig {
        ArqConfig {
            mtu: 576,
            ..Self::default_lan()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 128 {
            bail!("MTU is too small");
        }
        if self.mtu > 65_535 {
            bail!("MTU is too big for UDP");
        }
        if self.protocol_version != Self::PROTOCOL_VERSION_1 && self.protocol_version != Self::PROTOCOL_VERSION_2 {
            bail!("unsupported protocol version {}", self.protocol_version);
        }
        if self.unconfirmed_package_limit == 0 {
            bail!("unconfirmed package limit must be positive");
        }
        if self.max_resent_count_per_call == 0 {
            bail!("max resent count per call must be positive");
        }
        if self.disordered_seq_window as usize <= self.unconfirmed_package_limit {
            bail!("disordered seq window must be bigger than the unconfirmed package limit");
        }
        if self.disordered_seq_window >= 0x8000_0000 {
            bail!("disordered seq window must be less than half the sequence number space");
        }
        if self.min_resend_interval > self.max_resend_interval {
            bail!("min resend interval is bigger than max resend interval");
        }
        if self.initial_resend_interval < self.min_resend_interval || self.initial_resend_interval > self.max_resend_interval {
            bail!("initial resend interval must be between min and max resend interval");
        }
        if self.max_recv_package_length < self.mtu {
            bail!("max receive package length must be at least the MTU");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }

        Ok(())
    }
}
