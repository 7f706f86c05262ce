use crate::engine::{EngineFactory, TunnelEngine};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Stand-in for hosts without a userspace tunnel device.
pub struct PortableFactory;

#[async_trait]
impl EngineFactory for PortableFactory {
    async fn create(&self, name: &str, _mtu: u32) -> Result<Arc<dyn TunnelEngine>> {
        Err(Error::unsupported(format!(
            "cannot create tunnel device {} on {}",
            name,
            std::env::consts::OS
        )))
    }
}

pub fn device_report() -> Result<String> {
    Err(Error::unsupported(format!(
        "no tunnel devices on {}",
        std::env::consts::OS
    )))
}
