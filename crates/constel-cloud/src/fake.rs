//! In-memory metadata for tests and local runs.

use std::sync::Mutex;

use anyhow::{Result, anyhow};
use constel_core::Error;
use constel_core::instance::Instance;
use constel_core::role::Role;

#[derive(Debug, Default)]
pub struct FakeMetadata {
    self_instance: Instance,
    instances: Vec<Instance>,
    load_balancer: Option<String>,
    uid: String,
    supported: bool,
    signaled_roles: Mutex<Vec<Role>>,
    vpn_ips: Mutex<Vec<String>>,
}

impl FakeMetadata {
    /// Supported metadata whose listing contains only `self_instance`.
    pub fn new(self_instance: Instance) -> Self {
        Self {
            instances: vec![self_instance.clone()],
            self_instance,
            supported: true,
            ..Default::default()
        }
    }

    pub fn with_instances(mut self, instances: Vec<Instance>) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_load_balancer(mut self, endpoint: &str) -> Self {
        self.load_balancer = Some(endpoint.to_string());
        self
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = uid.to_string();
        self
    }

    pub fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    pub fn list(&self) -> Result<Vec<Instance>> {
        Ok(self.instances.clone())
    }

    pub fn self_instance(&self) -> Result<Instance> {
        Ok(self.self_instance.clone())
    }

    pub fn get_instance(&self, provider_id: &str) -> Result<Instance> {
        self.instances
            .iter()
            .chain(std::iter::once(&self.self_instance))
            .find(|i| i.provider_id == provider_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("instance {}", provider_id)).into())
    }

    pub fn get_load_balancer_endpoint(&self) -> Result<String> {
        self.load_balancer
            .clone()
            .ok_or_else(|| Error::NotFound("load balancer".to_string()).into())
    }

    pub fn uid(&self) -> String {
        self.uid.clone()
    }

    pub fn signal_role(&self, role: Role) -> Result<()> {
        self.signaled_roles
            .lock()
            .map_err(|_| anyhow!("signaled roles lock poisoned"))?
            .push(role);
        Ok(())
    }

    pub fn set_vpn_ip(&self, vpn_ip: &str) -> Result<()> {
        self.vpn_ips
            .lock()
            .map_err(|_| anyhow!("vpn ips lock poisoned"))?
            .push(vpn_ip.to_string());
        Ok(())
    }

    pub fn supported(&self) -> bool {
        self.supported
    }

    /// Roles passed to [`FakeMetadata::signal_role`], in order.
    pub fn signaled_roles(&self) -> Vec<Role> {
        self.signaled_roles
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn vpn_ips(&self) -> Vec<String> {
        self.vpn_ips.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_signals() {
        let fake = FakeMetadata::new(Instance::default());
        fake.signal_role(Role::Coordinator).unwrap();
        fake.set_vpn_ip("10.118.0.1").unwrap();
        assert_eq!(fake.signaled_roles(), vec![Role::Coordinator]);
        assert_eq!(fake.vpn_ips(), vec!["10.118.0.1".to_string()]);
    }

    #[test]
    fn test_get_instance() {
        let me = Instance {
            name: "me".to_string(),
            provider_id: "fake://me".to_string(),
            ..Default::default()
        };
        let fake = FakeMetadata::new(me.clone()).with_instances(vec![]);
        assert_eq!(fake.get_instance("fake://me").unwrap(), me);
        assert!(fake.get_instance("fake://other").is_err());
        assert!(fake.get_load_balancer_endpoint().is_err());
        assert!(!fake.unsupported().supported());
    }
}
