use crate::error::Error;

/// Transform a hostname into a lowercase RFC 1123 name as Kubernetes expects for node names.
///
/// Only lowercases and replaces underscores; other invalid characters are left alone.
pub fn k8s_compliant_hostname(name: &str) -> String {
    name.to_lowercase().replace('_', "-")
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(addr: &str) -> Result<(String, String), Error> {
    let missing_port = || Error::Configuration(format!("missing port in address {:?}", addr));

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::Configuration(format!("missing ']' in address {:?}", addr)))?;
        let port = after.strip_prefix(':').ok_or_else(missing_port)?;
        return Ok((host.to_string(), port.to_string()));
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(missing_port)?;
    if host.contains(':') {
        return Err(Error::Configuration(format!(
            "too many colons in address {:?}",
            addr
        )));
    }
    Ok((host.to_string(), port.to_string()))
}

/// Join host and port, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
