//! In-memory hardware binding for tests and local runs without accelerators.

use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use super::ContainerGrant;
use super::DeviceCapability;
use super::DeviceError;
use super::DeviceMapping;

#[derive(Debug, Default)]
pub struct MockDevices {
    ids: Vec<String>,
    failing: HashSet<String>,
    release_calls: AtomicUsize,
}

impl MockDevices {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Make every grant that includes `id` fail.
    pub fn fail_grant_for(mut self, id: impl Into<String>) -> Self {
        self.failing.insert(id.into());
        self
    }

    /// How many times [`DeviceCapability::release`] has been called.
    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }
}

impl DeviceCapability for MockDevices {
    fn count(&self) -> Result<usize, DeviceError> {
        Ok(self.ids.len())
    }

    fn enumerate(&self) -> Result<Vec<String>, DeviceError> {
        Ok(self.ids.clone())
    }

    fn grant(&self, ids: &[String]) -> Result<ContainerGrant, DeviceError> {
        let mut grant = ContainerGrant::default();
        for (idx, id) in ids.iter().enumerate() {
            if self.failing.contains(id) {
                return Err(DeviceError::Driver(format!("grant failed for device {id}")));
            }
            if !self.ids.contains(id) {
                return Err(DeviceError::UnknownDevice(id.clone()));
            }
            grant.devices.push(DeviceMapping::new(
                format!("/dev/mock{id}"),
                format!("/dev/mock{idx}"),
                "rw",
            ));
        }
        Ok(grant)
    }

    fn release(&self) -> Result<(), DeviceError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
