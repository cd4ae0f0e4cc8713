//! An in-memory profile store.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{
    Device, DeviceType, Profile, ProfileDb, ProfileDbError, ProfileLookup,
};
use crate::base::{DeviceId, HumanId, HumanIdLower, ProfileId};

//------------ MemoryProfileDb -----------------------------------------------

/// A [`ProfileDb`] keeping all profiles and devices in memory.
///
/// Devices can be added explicitly through [`add_device`][Self::add_device]
/// or are created automatically for unknown human identifiers. In the
/// latter case the number of devices per profile is limited.
#[derive(Debug)]
pub struct MemoryProfileDb {
    index: RwLock<Index>,
    max_devices: usize,
}

#[derive(Debug, Default)]
struct Index {
    profiles: HashMap<ProfileId, Arc<Profile>>,
    devices: HashMap<DeviceId, (Arc<Device>, ProfileId)>,
    human_ids: HashMap<(ProfileId, HumanIdLower), DeviceId>,
    linked_ips: HashMap<IpAddr, DeviceId>,
    dedicated_ips: HashMap<IpAddr, DeviceId>,
    next_auto_id: u32,
}

impl MemoryProfileDb {
    /// Creates an empty store.
    ///
    /// Automatic device creation fails once a profile has `max_devices`
    /// devices.
    pub fn new(max_devices: usize) -> Self {
        MemoryProfileDb {
            index: RwLock::new(Index::default()),
            max_devices,
        }
    }

    /// Adds or replaces a profile.
    ///
    /// The profile's device set is kept from a previous version of the
    /// profile, if any, since it is maintained by the store.
    pub fn add_profile(&self, mut profile: Profile) {
        let mut index = self.index.write();
        if let Some(old) = index.profiles.get(&profile.id) {
            profile.device_ids = old.device_ids.clone();
        }
        index.profiles.insert(profile.id.clone(), Arc::new(profile));
    }

    /// Marks a profile as deleted.
    ///
    /// Returns whether the profile existed.
    pub fn delete_profile(&self, id: &ProfileId) -> bool {
        let mut index = self.index.write();
        match index.profiles.get_mut(id) {
            Some(profile) => {
                Arc::make_mut(profile).deleted = true;
                true
            }
            None => false,
        }
    }

    /// Adds a device to an existing profile.
    ///
    /// An existing device with the same identifier is replaced.
    pub fn add_device(
        &self,
        profile_id: &ProfileId,
        device: Device,
    ) -> Result<(), ProfileDbError> {
        let mut index = self.index.write();
        index.insert_device(profile_id, device).map(|_| ())
    }

    /// Returns the number of devices in the store.
    pub fn device_count(&self) -> usize {
        self.index.read().devices.len()
    }
}

impl Index {
    fn lookup(&self, id: &DeviceId) -> Result<ProfileLookup, ProfileDbError> {
        let (device, profile_id) =
            self.devices.get(id).ok_or(ProfileDbError::NotFound)?;
        let profile = self
            .profiles
            .get(profile_id)
            .ok_or(ProfileDbError::NotFound)?;
        Ok((profile.clone(), device.clone()))
    }

    fn insert_device(
        &mut self,
        profile_id: &ProfileId,
        device: Device,
    ) -> Result<ProfileLookup, ProfileDbError> {
        if !self.profiles.contains_key(profile_id) {
            return Err(ProfileDbError::NotFound);
        }
        if let Some((old, old_profile)) = self.devices.remove(&device.id) {
            self.unindex(&old, &old_profile);
        }

        let id = device.id.clone();
        if let Some(human_id) = &device.human_id_lower {
            self.human_ids
                .insert((profile_id.clone(), human_id.clone()), id.clone());
        }
        if let Some(addr) = device.linked_ip {
            self.linked_ips.insert(addr, id.clone());
        }
        for addr in &device.dedicated_ips {
            self.dedicated_ips.insert(*addr, id.clone());
        }

        let device = Arc::new(device);
        self.devices
            .insert(id.clone(), (device.clone(), profile_id.clone()));
        let profile = match self.profiles.get_mut(profile_id) {
            Some(profile) => profile,
            None => return Err(ProfileDbError::NotFound),
        };
        Arc::make_mut(profile).device_ids.insert(id);
        Ok((profile.clone(), device))
    }

    fn unindex(&mut self, device: &Device, profile_id: &ProfileId) {
        if let Some(human_id) = &device.human_id_lower {
            self.human_ids
                .remove(&(profile_id.clone(), human_id.clone()));
        }
        if let Some(addr) = device.linked_ip {
            self.linked_ips.remove(&addr);
        }
        for addr in &device.dedicated_ips {
            self.dedicated_ips.remove(addr);
        }
        if let Some(profile) = self.profiles.get_mut(profile_id) {
            Arc::make_mut(profile).device_ids.remove(&device.id);
        }
    }

    /// Returns an unused device identifier.
    fn next_device_id(&mut self) -> Result<DeviceId, ProfileDbError> {
        loop {
            let id = format!("{:08x}", self.next_auto_id);
            self.next_auto_id = self.next_auto_id.wrapping_add(1);
            let id = DeviceId::new(&id)
                .map_err(|err| ProfileDbError::Other(Box::new(err)))?;
            if !self.devices.contains_key(&id) {
                return Ok(id);
            }
        }
    }
}

#[async_trait]
impl ProfileDb for MemoryProfileDb {
    async fn profile_by_device_id(
        &self,
        id: &DeviceId,
    ) -> Result<ProfileLookup, ProfileDbError> {
        self.index.read().lookup(id)
    }

    async fn profile_by_human_id(
        &self,
        profile_id: &ProfileId,
        human_id: &HumanIdLower,
    ) -> Result<ProfileLookup, ProfileDbError> {
        let index = self.index.read();
        let id = index
            .human_ids
            .get(&(profile_id.clone(), human_id.clone()))
            .ok_or(ProfileDbError::NotFound)?;
        index.lookup(id)
    }

    async fn profile_by_linked_ip(
        &self,
        addr: IpAddr,
    ) -> Result<ProfileLookup, ProfileDbError> {
        let index = self.index.read();
        let id = index.linked_ips.get(&addr).ok_or(ProfileDbError::NotFound)?;
        index.lookup(id)
    }

    async fn profile_by_dedicated_ip(
        &self,
        addr: IpAddr,
    ) -> Result<ProfileLookup, ProfileDbError> {
        let index = self.index.read();
        let id = index
            .dedicated_ips
            .get(&addr)
            .ok_or(ProfileDbError::NotFound)?;
        index.lookup(id)
    }

    async fn create_auto_device(
        &self,
        profile_id: &ProfileId,
        human_id: &HumanId,
        device_type: DeviceType,
    ) -> Result<ProfileLookup, ProfileDbError> {
        let human_id_lower = human_id.to_lower();
        let mut index = self.index.write();

        // Another query may have created the device in the meantime.
        if let Some(id) = index
            .human_ids
            .get(&(profile_id.clone(), human_id_lower.clone()))
        {
            return index.lookup(id);
        }

        let profile = index
            .profiles
            .get(profile_id)
            .ok_or(ProfileDbError::NotFound)?;
        if profile.device_ids.len() >= self.max_devices {
            return Err(ProfileDbError::DeviceQuotaExceeded);
        }

        let mut device = Device::new(index.next_device_id()?);
        device.human_id_lower = Some(human_id_lower);
        device.device_type = device_type;
        debug!(
            profile = %profile_id,
            device = %device.id,
            human_id = %human_id,
            "created auto device"
        );
        index.insert_device(profile_id, device)
    }
}

//============ Testing =======================================================
