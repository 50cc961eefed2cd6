use crate::prelude::*;

use crate::register::DeviceTypeString;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

// registers 13-15 hold major.minor.patch on the families seen so far
const FIRMWARE_REGISTERS: std::ops::Range<usize> = 13..16;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DeviceIdentity {
    pub device_type: String,
    pub firmware_version: Option<String>,
}

impl DeviceIdentity {
    /// Decodes the identification block (registers 0-15).
    pub fn from_registers(values: &[u16]) -> Option<Self> {
        let code = *values.first()?;

        let firmware_version = values
            .get(FIRMWARE_REGISTERS)
            .map(|v| format!("{}.{}.{}", v[0], v[1], v[2]));

        Some(Self {
            device_type: DeviceTypeString::from_value(code),
            firmware_version,
        })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum IdentityState {
    #[default]
    Unset,
    /// a read has been started for this session
    Pending,
    /// `None` when the read failed; it is not retried
    Resolved(Option<DeviceIdentity>),
}

/// Per-session one-shot memo of the device identity.
#[derive(Clone, Debug, Default)]
pub struct IdentityCache(Arc<Mutex<IdentityState>>);

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> IdentityState {
        self.lock().clone()
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        match &*self.lock() {
            IdentityState::Resolved(identity) => identity.clone(),
            _ => None,
        }
    }

    /// Claims the read for this session. False if it was already claimed.
    pub fn begin(&self) -> bool {
        let mut state = self.lock();
        if *state == IdentityState::Unset {
            *state = IdentityState::Pending;
            true
        } else {
            false
        }
    }

    /// Settles a pending read. Ignored if the session was reset meanwhile.
    pub fn resolve(&self, identity: Option<DeviceIdentity>) {
        let mut state = self.lock();
        if *state == IdentityState::Pending {
            *state = IdentityState::Resolved(identity);
        }
    }

    pub fn reset(&self) {
        *self.lock() = IdentityState::Unset;
    }

    /// Runs `read` the first time it is called for a session and decodes the
    /// result. Failures resolve to `None` and are never retried. Returns the
    /// identity only when this call resolved it.
    pub async fn ensure<F, Fut>(&self, read: F) -> Option<DeviceIdentity>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u16>>>,
    {
        if !self.begin() {
            return None;
        }

        let identity = match read().await {
            Ok(values) => DeviceIdentity::from_registers(&values),
            Err(e) => {
                debug!("could not read device info registers, skipping: {:#}", e);
                None
            }
        };

        if let Some(i) = &identity {
            info!(
                "device: {} (firmware {})",
                i.device_type,
                i.firmware_version.as_deref().unwrap_or("unknown")
            );
        }

        self.resolve(identity.clone());
        identity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdentityState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_type_and_firmware() {
        let mut values = vec![0u16; 16];
        values[0] = 3;
        values[13] = 1;
        values[14] = 47;
        values[15] = 0;

        assert_eq!(
            DeviceIdentity::from_registers(&values),
            Some(DeviceIdentity {
                device_type: "Single-phase Hybrid Inverter".to_owned(),
                firmware_version: Some("1.47.0".to_owned()),
            })
        );
    }

    #[test]
    fn short_block_has_no_firmware() {
        let identity = DeviceIdentity::from_registers(&[0x99; 15]).unwrap();
        assert_eq!(identity.device_type, "Type 153");
        assert_eq!(identity.firmware_version, None);

        assert_eq!(DeviceIdentity::from_registers(&[]), None);
    }

    #[test]
    fn latch_transitions() {
        let cache = IdentityCache::new();
        assert_eq!(cache.state(), IdentityState::Unset);

        assert!(cache.begin());
        assert_eq!(cache.state(), IdentityState::Pending);
        assert!(!cache.begin());

        cache.resolve(None);
        assert_eq!(cache.state(), IdentityState::Resolved(None));
        assert!(!cache.begin());

        cache.reset();
        assert_eq!(cache.state(), IdentityState::Unset);
    }

    #[test]
    fn reset_while_pending_discards_result() {
        let cache = IdentityCache::new();
        assert!(cache.begin());
        cache.reset();
        cache.resolve(DeviceIdentity::from_registers(&[2]));
        assert_eq!(cache.state(), IdentityState::Unset);
    }

    #[tokio::test]
    async fn failure_is_never_retried() {
        let cache = IdentityCache::new();

        let r = cache.ensure(|| async { Err(anyhow!("timed out")) }).await;
        assert_eq!(r, None);
        assert_eq!(cache.state(), IdentityState::Resolved(None));

        // a second read would succeed, but must not happen
        let r = cache.ensure(|| async { Ok(vec![3]) }).await;
        assert_eq!(r, None);
        assert_eq!(cache.identity(), None);
    }

    #[tokio::test]
    async fn success_is_cached() {
        let cache = IdentityCache::new();
        let r = cache.ensure(|| async { Ok(vec![2]) }).await;

        assert_eq!(r.as_ref().map(|i| i.device_type.as_str()), Some("String Inverter"));
        assert_eq!(cache.identity(), r);
    }
}
