//! VPN datapath port and its wireguard implementation.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use constel_core::constants::{VPN_PREFIX_LEN, WIREGUARD_PORT};
use constel_core::instance::Peer;
use constel_core::naming::join_host_port;
use constel_core::role::Role;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::shell::run;

/// The overlay datapath. Holds no authoritative state: it can always be
/// reconciled from the peer store.
pub trait Vpn: Send + Sync {
    /// Bring the interface up with `private_key`, or a freshly generated key.
    fn setup(&self, private_key: Option<&[u8]>) -> Result<()>;
    fn get_private_key(&self) -> Result<Vec<u8>>;
    fn get_public_key(&self) -> Result<Vec<u8>>;
    fn get_interface_ip(&self) -> Result<String>;
    fn set_interface_ip(&self, ip: &str) -> Result<()>;
    fn add_peer(&self, pub_key: &[u8], public_ip: &str, vpn_ip: &str) -> Result<()>;
    fn remove_peer(&self, pub_key: &[u8]) -> Result<()>;
    /// Converge the datapath on exactly `peers`.
    fn update_peers(&self, peers: &[Peer]) -> Result<()>;
}

fn generate_private_key() -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

fn private_key_from(bytes: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("VPN private key must be 32 bytes, got {}", bytes.len()))?;
    Ok(Zeroizing::new(key))
}

fn public_key_of(private_key: &[u8; 32]) -> Vec<u8> {
    PublicKey::from(&StaticSecret::from(*private_key))
        .as_bytes()
        .to_vec()
}

/// A peer as reported by `wg show <iface> dump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeer {
    pub pub_key: Vec<u8>,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
}

/// Parse the peer lines of `wg show <iface> dump`. The first line describes
/// the interface itself and is skipped.
pub fn parse_wg_dump(output: &str) -> Result<Vec<WgPeer>> {
    let mut peers = Vec::new();
    for line in output.lines().skip(1).filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 4 {
            bail!("Malformed wg dump line: {}", line);
        }
        let pub_key = STANDARD
            .decode(fields[0])
            .with_context(|| format!("Invalid peer key in wg dump: {}", fields[0]))?;
        let endpoint = (fields[2] != "(none)").then(|| fields[2].to_string());
        let allowed_ips = if fields[3] == "(none)" {
            Vec::new()
        } else {
            fields[3].split(',').map(str::to_string).collect()
        };
        peers.push(WgPeer {
            pub_key,
            endpoint,
            allowed_ips,
        });
    }
    Ok(peers)
}

/// Datapath changes needed to go from `current` to `wanted`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PeerDiff {
    pub add: Vec<Peer>,
    pub remove: Vec<Vec<u8>>,
}

pub fn diff_peers(current: &[WgPeer], wanted: &[Peer], port: u16) -> PeerDiff {
    let current: BTreeMap<&[u8], &WgPeer> =
        current.iter().map(|p| (p.pub_key.as_slice(), p)).collect();
    let wanted_keys: BTreeMap<&[u8], &Peer> =
        wanted.iter().map(|p| (p.vpn_pub_key.as_slice(), p)).collect();

    let mut diff = PeerDiff::default();
    for (key, _) in current.iter().filter(|(k, _)| !wanted_keys.contains_key(*k)) {
        diff.remove.push(key.to_vec());
    }
    for (key, peer) in wanted_keys {
        let allowed = format!("{}/32", peer.vpn_ip);
        let endpoint = peer
            .endpoint_host()
            .ok()
            .map(|host| join_host_port(&host, &port.to_string()));
        let unchanged = current
            .get(key)
            .is_some_and(|c| c.allowed_ips == [allowed.clone()] && c.endpoint == endpoint);
        if !unchanged {
            diff.add.push(peer.clone());
        }
    }
    diff
}

/// Wireguard interface driven through the `ip` and `wg` tools.
pub struct WgVpn {
    interface: String,
    port: u16,
    private_key: Mutex<Option<Zeroizing<[u8; 32]>>>,
}

impl WgVpn {
    pub fn new(interface: &str, port: u16) -> Self {
        Self {
            interface: interface.to_string(),
            port,
            private_key: Mutex::new(None),
        }
    }

    fn key(&self) -> MutexGuard<'_, Option<Zeroizing<[u8; 32]>>> {
        self.private_key.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_key(&self) -> Result<Zeroizing<[u8; 32]>> {
        self.key()
            .clone()
            .context("VPN interface has not been set up")
    }

    fn ensure_interface(&self) -> Result<()> {
        if run("ip", &["link", "show", "dev", &self.interface]).is_ok() {
            return Ok(());
        }
        run(
            "ip",
            &["link", "add", "dev", &self.interface, "type", "wireguard"],
        )?;
        Ok(())
    }

    fn apply_peer(&self, pub_key: &[u8], public_ip: &str, vpn_ip: &str) -> Result<()> {
        let key = STANDARD.encode(pub_key);
        let allowed = format!("{}/32", vpn_ip);
        let mut args = vec![
            "set",
            self.interface.as_str(),
            "peer",
            key.as_str(),
            "allowed-ips",
            allowed.as_str(),
        ];
        let endpoint = join_host_port(public_ip, &self.port.to_string());
        if !public_ip.is_empty() {
            args.extend(["endpoint", endpoint.as_str()]);
        }
        run("wg", &args)?;
        Ok(())
    }
}

impl Default for WgVpn {
    fn default() -> Self {
        Self::new("wg0", WIREGUARD_PORT)
    }
}

impl Vpn for WgVpn {
    fn setup(&self, private_key: Option<&[u8]>) -> Result<()> {
        let key = match private_key {
            Some(bytes) => private_key_from(bytes)?,
            None => generate_private_key(),
        };
        self.ensure_interface()?;

        let mut key_file = tempfile::NamedTempFile::new().context("Failed to create key file")?;
        let encoded = Zeroizing::new(STANDARD.encode(&key[..]));
        key_file
            .write_all(encoded.as_bytes())
            .context("Failed to write key file")?;
        let key_path = key_file.path().to_string_lossy().into_owned();
        run(
            "wg",
            &[
                "set",
                &self.interface,
                "listen-port",
                &self.port.to_string(),
                "private-key",
                &key_path,
            ],
        )?;
        run("ip", &["link", "set", "up", "dev", &self.interface])?;

        *self.key() = Some(key);
        info!(interface = %self.interface, port = self.port, "VPN interface configured");
        Ok(())
    }

    fn get_private_key(&self) -> Result<Vec<u8>> {
        Ok(self.current_key()?.to_vec())
    }

    fn get_public_key(&self) -> Result<Vec<u8>> {
        let key = self.current_key()?;
        Ok(public_key_of(&*key))
    }

    fn get_interface_ip(&self) -> Result<String> {
        let out = run("ip", &["-4", "-o", "addr", "show", "dev", &self.interface])?;
        parse_interface_ip(&out)
            .with_context(|| format!("No IPv4 address on {}", self.interface))
    }

    fn set_interface_ip(&self, ip: &str) -> Result<()> {
        let cidr = format!("{}/{}", ip, VPN_PREFIX_LEN);
        run(
            "ip",
            &["addr", "replace", &cidr, "dev", &self.interface],
        )?;
        info!(interface = %self.interface, vpn_ip = ip, "Set VPN interface IP");
        Ok(())
    }

    fn add_peer(&self, pub_key: &[u8], public_ip: &str, vpn_ip: &str) -> Result<()> {
        self.apply_peer(pub_key, public_ip, vpn_ip)?;
        debug!(vpn_ip, public_ip, "Added VPN peer");
        Ok(())
    }

    fn remove_peer(&self, pub_key: &[u8]) -> Result<()> {
        let key = STANDARD.encode(pub_key);
        run("wg", &["set", &self.interface, "peer", &key, "remove"])?;
        debug!(peer = %key, "Removed VPN peer");
        Ok(())
    }

    fn update_peers(&self, peers: &[Peer]) -> Result<()> {
        let dump = run("wg", &["show", &self.interface, "dump"])?;
        let diff = diff_peers(&parse_wg_dump(&dump)?, peers, self.port);
        for key in &diff.remove {
            self.remove_peer(key)?;
        }
        for peer in &diff.add {
            let host = peer.endpoint_host().unwrap_or_default();
            self.apply_peer(&peer.vpn_pub_key, &host, &peer.vpn_ip)?;
        }
        info!(
            added = diff.add.len(),
            removed = diff.remove.len(),
            "Updated VPN peers"
        );
        Ok(())
    }
}

/// Address from `ip -4 -o addr show` output, without the prefix length.
fn parse_interface_ip(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    words.find(|w| *w == "inet")?;
    let cidr = words.next()?;
    Some(cidr.split('/').next().unwrap_or(cidr).to_string())
}

#[derive(Debug, Default)]
struct FakeVpnState {
    private_key: Option<Vec<u8>>,
    interface_ip: String,
    peers: Vec<Peer>,
}

/// In-memory datapath for tests.
#[derive(Debug, Default)]
pub struct FakeVpn {
    state: Mutex<FakeVpnState>,
    add_peer_err: Option<String>,
}

impl FakeVpn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `add_peer` call fail with `message`.
    pub fn with_add_peer_error(mut self, message: &str) -> Self {
        self.add_peer_err = Some(message.to_string());
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeVpnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.state().peers.clone()
    }

    pub fn interface_ip(&self) -> String {
        self.state().interface_ip.clone()
    }
}

impl Vpn for FakeVpn {
    fn setup(&self, private_key: Option<&[u8]>) -> Result<()> {
        let key = match private_key {
            Some(bytes) => private_key_from(bytes)?,
            None => generate_private_key(),
        };
        self.state().private_key = Some(key.to_vec());
        Ok(())
    }

    fn get_private_key(&self) -> Result<Vec<u8>> {
        self.state()
            .private_key
            .clone()
            .context("VPN interface has not been set up")
    }

    fn get_public_key(&self) -> Result<Vec<u8>> {
        let private = private_key_from(&self.get_private_key()?)?;
        Ok(public_key_of(&private))
    }

    fn get_interface_ip(&self) -> Result<String> {
        Ok(self.state().interface_ip.clone())
    }

    fn set_interface_ip(&self, ip: &str) -> Result<()> {
        self.state().interface_ip = ip.to_string();
        Ok(())
    }

    fn add_peer(&self, pub_key: &[u8], public_ip: &str, vpn_ip: &str) -> Result<()> {
        if let Some(msg) = &self.add_peer_err {
            bail!("{}", msg);
        }
        let mut state = self.state();
        state.peers.retain(|p| p.vpn_pub_key != pub_key);
        state.peers.push(Peer {
            public_endpoint: public_ip.to_string(),
            vpn_ip: vpn_ip.to_string(),
            vpn_pub_key: pub_key.to_vec(),
            role: Role::Unknown,
        });
        Ok(())
    }

    fn remove_peer(&self, pub_key: &[u8]) -> Result<()> {
        self.state().peers.retain(|p| p.vpn_pub_key != pub_key);
        Ok(())
    }

    fn update_peers(&self, peers: &[Peer]) -> Result<()> {
        self.state().peers = peers.to_vec();
        Ok(())
    }
}
