//! Static Lease
//!
//! A fixed assignment: one configured node is always primary, every other
//! node always follows it. No network calls are made.

use async_trait::async_trait;
use std::time::Instant;

use super::{Lease, Leaser, PrimaryInfo};
use crate::config::StaticConfig;
use crate::error::{Error, Result};

pub struct StaticLeaser {
    node_id: String,
    primary: bool,
    info: PrimaryInfo,
}

impl StaticLeaser {
    pub fn new(config: &StaticConfig, node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            primary: config.primary,
            info: PrimaryInfo {
                hostname: config.hostname.clone(),
                advertise_addr: config.advertise_address.clone(),
            },
        }
    }
}

#[async_trait]
impl Leaser for StaticLeaser {
    fn kind(&self) -> &'static str {
        "static"
    }

    fn advertise_addr(&self) -> &str {
        &self.info.advertise_addr
    }

    async fn acquire(&self) -> Result<Lease> {
        if !self.primary {
            return Err(Error::LeaseHeld {
                holder: self.info.hostname.clone(),
            });
        }

        Ok(Lease::new(
            self.node_id.clone(),
            self.info.advertise_addr.clone(),
            None,
            None,
            Instant::now(),
        ))
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        if !self.primary {
            return Err(Error::LeaseLost);
        }
        Ok(lease.renewed(Instant::now()))
    }

    async fn release(&self, _lease: &Lease) -> Result<()> {
        Ok(())
    }

    async fn primary_info(&self) -> Result<Option<PrimaryInfo>> {
        Ok(Some(self.info.clone()))
    }
}
