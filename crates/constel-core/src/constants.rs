use std::net::Ipv4Addr;
use std::time::Duration;

/// Reserved overlay address of the first coordinator.
pub const COORDINATOR_VPN_IP: Ipv4Addr = Ipv4Addr::new(10, 118, 0, 1);
/// Overlay network all VPN IPs are allocated from.
pub const VPN_NETWORK: Ipv4Addr = Ipv4Addr::new(10, 118, 0, 0);
pub const VPN_PREFIX_LEN: u8 = 16;

/// Port of the internal control-plane API (VPN-API) on coordinators.
pub const COORDINATOR_PORT: u16 = 9000;
/// Port of the activation API every fresh node serves on its public address.
pub const ACTIVATION_PORT: u16 = 9001;
pub const WIREGUARD_PORT: u16 = 51820;

/// Length of generated cluster IDs and derived owner IDs.
pub const RNG_LENGTH_DEFAULT: usize = 32;

/// Deadline for cloud metadata calls.
pub const CLOUD_TIMEOUT: Duration = Duration::from_secs(60);
/// Backoff between rounds of initial peer retrieval.
pub const RETRIEVE_INITIAL_PEERS_BACKOFF: Duration = Duration::from_secs(60);
/// Cache lifetime of invariant cloud resources (region, zones).
pub const CLOUD_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub const NODE_STATE_PATH: &str = "/run/state/constellation/node_state.json";
pub const MEASUREMENT_PATH: &str = "/run/state/constellation/measurement";

// Access manager layout on the host.
pub const HOST_ROOT: &str = "/host";
pub const HOME_DIR: &str = "/var/home";
pub const EVICTED_DIR: &str = "/var/evicted";
pub const SSH_KEYS_RELATIVE_PATH: &str = ".ssh/authorized_keys.d/constellation-ssh-keys";
pub const PASSWD_PATH: &str = "/etc/passwd";

// Tag / label conventions shared by all providers.
pub const UID_METADATA_KEY: &str = "constellation-uid";
pub const ROLE_METADATA_KEY: &str = "constellation-role";
pub const USE_METADATA_KEY: &str = "constellation-use";
pub const VPN_IP_METADATA_KEY: &str = "constellation-vpn-ip";

/// HKDF salt used for owner ID derivation.
pub const OWNER_ID_SALT: &[u8] = b"Constellation";
pub const OWNER_ID_INFO: &[u8] = b"id";
