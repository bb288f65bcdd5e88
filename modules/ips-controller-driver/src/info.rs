// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Structures reported by the controller firmware.
//!
//! The driver reads these structures through management commands, into a scratch region of
//! physical memory where each of them has a fixed location. All the fields are little-endian.

use crate::MAX_DRIVES;

use alloc::{string::String, vec::Vec};
use arrayvec::ArrayVec;

/// Offset within the scratch region of the adapter information.
pub const ADAPTER_INFO_OFFSET: usize = 0;
/// Offset within the scratch region of the logical drives information.
pub const DRIVE_INFO_OFFSET: usize = ADAPTER_INFO_OFFSET + AdapterInfo::SIZE;
/// Offset within the scratch region of the configuration.
pub const CONFIGURATION_OFFSET: usize = DRIVE_INFO_OFFSET + DriveInfo::SIZE;
/// Offset within the scratch region of the page 5 of the NVRAM.
pub const NVRAM_PAGE5_OFFSET: usize = CONFIGURATION_OFFSET + Configuration::SIZE;
/// Total size of the scratch region.
pub const SCRATCH_SIZE: usize = NVRAM_PAGE5_OFFSET + NvramPage5::SIZE;

/// Number of channels of physical devices.
pub const NUM_CHANNELS: usize = 4;
/// Number of targets per channel in the configuration table.
pub const TARGETS_PER_CHANNEL: usize = 16;
/// Highest target identifier, exclusive, that can be a member of a logical drive.
pub const MAX_MEMBER_TARGET: u8 = 15;
/// Maximum number of chunks of a logical drive.
pub const MAX_CHUNKS: usize = 16;

/// Model names, indexed by the adapter type found in the page 5 of the NVRAM.
const ADAPTER_NAMES: &[Option<&str>] = &[
    None,
    None,
    Some("II"),
    Some("onboard"),
    Some("onboard"),
    Some("3H"),
    Some("3L"),
    Some("4H"),
    Some("4M"),
    Some("4L"),
    Some("4Mx"),
    Some("4Lx"),
    Some("5i"),
    Some("5i"),
    Some("6M"),
    Some("6i"),
    Some("7t"),
    Some("7k"),
    Some("7M"),
];

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn le32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

/// Turns a fixed-size text field into a string, stopping at the first NUL byte and ignoring
/// what isn't printable ASCII.
fn text(field: &[u8]) -> String {
    field
        .iter()
        .take_while(|b| **b != 0)
        .filter(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|b| char::from(*b))
        .collect::<String>()
        .trim_end()
        .into()
}

/// General information about the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Number of logical drives.
    pub drive_count: u8,
    pub misc_flags: u8,
    pub firmware: [u8; 8],
    pub bios: [u8; 8],
    /// Size in sectors of each logical drive.
    pub drive_sizes: [u32; MAX_DRIVES],
    /// Number of commands that the adapter can process concurrently.
    pub command_count: u8,
    pub max_physical_devices: u8,
    pub defunct_disk_count: u8,
    pub rebuild_flag: u8,
    pub offline_drive_count: u8,
    pub critical_drive_count: u8,
    pub config_update_count: u16,
}

impl AdapterInfo {
    pub const SIZE: usize = 196;

    /// Decodes the structure.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`AdapterInfo::SIZE`].
    pub fn decode(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);

        let mut drive_sizes = [0; MAX_DRIVES];
        for (n, size) in drive_sizes.iter_mut().enumerate() {
            *size = le32(bytes, 24 + n * 4);
        }

        AdapterInfo {
            drive_count: bytes[0],
            misc_flags: bytes[1],
            firmware: array(bytes, 8),
            bios: array(bytes, 16),
            drive_sizes,
            command_count: bytes[56],
            max_physical_devices: bytes[57],
            defunct_disk_count: bytes[60],
            rebuild_flag: bytes[61],
            offline_drive_count: bytes[62],
            critical_drive_count: bytes[63],
            config_update_count: le16(bytes, 64),
        }
    }

    /// Returns the version of the firmware, as printable text.
    pub fn firmware_version(&self) -> String {
        text(&self.firmware)
    }

    /// Returns the version of the BIOS, as printable text.
    pub fn bios_version(&self) -> String {
        text(&self.bios)
    }
}

/// State of a logical drive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VolumeState {
    Free,
    Offline,
    Online,
    Degraded,
    System,
    /// Value that doesn't correspond to any known state.
    Other(u8),
}

impl From<u8> for VolumeState {
    fn from(value: u8) -> VolumeState {
        match value {
            0x00 => VolumeState::Free,
            0x02 => VolumeState::Offline,
            0x03 => VolumeState::Online,
            0x04 => VolumeState::Degraded,
            0x06 => VolumeState::System,
            other => VolumeState::Other(other),
        }
    }
}

/// Logical drive, as reported by the drive information command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalDrive {
    pub id: u8,
    pub raid_level: u8,
    pub state: VolumeState,
    pub sector_count: u32,
}

/// List of the logical drives of the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveInfo {
    pub drives: ArrayVec<[LogicalDrive; MAX_DRIVES]>,
}

impl DriveInfo {
    pub const SIZE: usize = 68;

    /// Decodes the structure. The reported number of drives is capped at [`MAX_DRIVES`].
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`DriveInfo::SIZE`].
    pub fn decode(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);

        let count = usize::from(bytes[0]).min(MAX_DRIVES);
        let drives = (0..count)
            .map(|n| {
                let entry = &bytes[4 + n * 8..4 + (n + 1) * 8];
                LogicalDrive {
                    id: entry[0],
                    raid_level: entry[2],
                    state: VolumeState::from(entry[3]),
                    sector_count: le32(entry, 4),
                }
            })
            .collect();

        DriveInfo { drives }
    }
}

/// Member of a logical drive, as found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub channel: u8,
    pub target: u8,
    pub start_sector: u32,
    pub sector_count: u32,
}

/// Configuration of a logical drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalDriveConfig {
    pub state: VolumeState,
    pub raid_cache_params: u8,
    pub stripe_size: u8,
    pub params: u8,
    /// Size of the drive in sectors.
    pub size: u32,
    pub chunks: ArrayVec<[Chunk; MAX_CHUNKS]>,
}

impl LogicalDriveConfig {
    const SIZE: usize = 204;

    fn decode(bytes: &[u8]) -> Self {
        let chunk_count = usize::from(bytes[4]).min(MAX_CHUNKS);
        let chunks = (0..chunk_count)
            .map(|n| {
                let entry = &bytes[12 + n * 12..12 + (n + 1) * 12];
                Chunk {
                    channel: entry[0],
                    target: entry[1],
                    start_sector: le32(entry, 4),
                    sector_count: le32(entry, 8),
                }
            })
            .collect();

        LogicalDriveConfig {
            state: VolumeState::from(bytes[2]),
            raid_cache_params: bytes[3],
            stripe_size: bytes[5],
            params: bytes[6],
            size: le32(bytes, 8),
            chunks,
        }
    }
}

/// Flags found in the state of a physical device.
pub mod device_state {
    /// All the bits must be set for the device to be present.
    pub const PRESENT: u8 = 0x81;
    pub const REBUILD: u8 = 0x02;
    pub const SPARE: u8 = 0x04;
    pub const MEMBER: u8 = 0x08;
}

/// State of a physical disk, derived from its flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskState {
    Offline,
    /// Present but neither a member of a logical drive, a spare, or being rebuilt.
    Present,
    Online,
    HotSpare,
    Rebuilding,
}

/// Physical device, as found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    pub initiator: u8,
    pub params: u8,
    pub misc_flags: u8,
    /// Combination of the flags of [`device_state`].
    pub state: u8,
    pub sector_count: u32,
    /// Vendor and product identification, as reported by the device.
    pub device_id: [u8; 28],
}

impl PhysicalDevice {
    const SIZE: usize = 36;

    fn decode(bytes: &[u8]) -> Self {
        PhysicalDevice {
            initiator: bytes[0],
            params: bytes[1],
            misc_flags: bytes[2],
            state: bytes[3],
            sector_count: le32(bytes, 4),
            device_id: array(bytes, 8),
        }
    }

    /// Returns true if the device is physically present.
    pub fn is_present(&self) -> bool {
        self.state & device_state::PRESENT == device_state::PRESENT
    }

    /// Returns the state of the disk.
    pub fn disk_state(&self) -> DiskState {
        if !self.is_present() {
            return DiskState::Offline;
        }

        // When multiple flags are set, the last one checked wins.
        let mut state = DiskState::Present;
        if self.state & device_state::REBUILD != 0 {
            state = DiskState::Rebuilding;
        }
        if self.state & device_state::SPARE != 0 {
            state = DiskState::HotSpare;
        }
        if self.state & device_state::MEMBER != 0 {
            state = DiskState::Online;
        }
        state
    }
}

/// Configuration of the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    /// Number of logical drives, as reported by the configuration.
    pub logical_drive_count: u8,
    pub board: [u8; 8],
    pub cpu: [u8; 8],
    /// Always contains one entry per possible logical drive.
    pub logical_drives: Vec<LogicalDriveConfig>,
    /// Indexed by `channel * TARGETS_PER_CHANNEL + target`.
    pub devices: Vec<PhysicalDevice>,
}

impl Configuration {
    pub const SIZE: usize = 4508;

    const HARDWARE_OFFSET: usize = 36;
    const LOGICAL_DRIVES_OFFSET: usize = 60;
    const DEVICES_OFFSET: usize =
        Self::LOGICAL_DRIVES_OFFSET + MAX_DRIVES * LogicalDriveConfig::SIZE;

    /// Decodes the structure.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`Configuration::SIZE`].
    pub fn decode(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);

        let logical_drives = (0..MAX_DRIVES)
            .map(|n| {
                let start = Self::LOGICAL_DRIVES_OFFSET + n * LogicalDriveConfig::SIZE;
                LogicalDriveConfig::decode(&bytes[start..start + LogicalDriveConfig::SIZE])
            })
            .collect();

        let devices = (0..NUM_CHANNELS * TARGETS_PER_CHANNEL)
            .map(|n| {
                let start = Self::DEVICES_OFFSET + n * PhysicalDevice::SIZE;
                PhysicalDevice::decode(&bytes[start..start + PhysicalDevice::SIZE])
            })
            .collect();

        Configuration {
            logical_drive_count: bytes[0],
            board: array(bytes, Self::HARDWARE_OFFSET),
            cpu: array(bytes, Self::HARDWARE_OFFSET + 8),
            logical_drives,
            devices,
        }
    }

    /// Returns the physical device at the given location, if the location is valid.
    pub fn device(&self, channel: u8, target: u8) -> Option<&PhysicalDevice> {
        let (channel, target) = (usize::from(channel), usize::from(target));
        if channel >= NUM_CHANNELS || target >= TARGETS_PER_CHANNEL {
            return None;
        }
        self.devices.get(channel * TARGETS_PER_CHANNEL + target)
    }
}

/// Page 5 of the NVRAM of the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NvramPage5 {
    pub signature: u32,
    pub slot: u8,
    pub adapter_type: u16,
    pub bios_high: [u8; 4],
    pub bios_low: [u8; 4],
    pub os: u8,
    pub driver_high: [u8; 4],
    pub driver_low: [u8; 4],
}

impl NvramPage5 {
    pub const SIZE: usize = 128;

    /// Decodes the structure.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`NvramPage5::SIZE`].
    pub fn decode(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);
        NvramPage5 {
            signature: le32(bytes, 0),
            slot: bytes[5],
            adapter_type: le16(bytes, 6),
            bios_high: array(bytes, 8),
            bios_low: array(bytes, 12),
            os: bytes[19],
            driver_high: array(bytes, 20),
            driver_low: array(bytes, 24),
        }
    }

    /// Returns the commercial name of the adapter model, if known.
    pub fn adapter_model(&self) -> Option<&'static str> {
        ADAPTER_NAMES
            .get(usize::from(self.adapter_type))
            .copied()
            .flatten()
    }
}

/// Error when looking up a volume or a disk.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum LookupError {
    #[display(fmt = "no volume {}", _0)]
    NoSuchVolume(usize),
    #[display(fmt = "volume {} has no disk {}", volume, disk)]
    NoSuchDisk { volume: usize, disk: usize },
    /// The configuration refers to a device location that can't exist.
    #[display(fmt = "disk at invalid location {}:{}", channel, target)]
    InvalidLocation { channel: u8, target: u8 },
}

/// Summary of the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSummary {
    pub model: Option<&'static str>,
    pub firmware: String,
    pub bios: String,
    /// Number of commands that the driver can have in flight.
    pub command_slots: usize,
    pub volume_count: usize,
    /// Total number of disks that are members of a volume.
    pub disk_count: usize,
}

/// Summary of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSummary {
    pub state: VolumeState,
    pub raid_level: u8,
    pub chunk_count: usize,
    pub size_sectors: u32,
}

/// Summary of a disk that is a member of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSummary {
    pub channel: u8,
    pub target: u8,
    pub device_id: [u8; 28],
    /// Number of sectors of the disk that belong to the volume.
    pub size_sectors: u32,
    /// Number of sectors of the whole physical disk.
    pub device_sectors: u32,
    pub state: DiskState,
}

/// Everything the driver knows about the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerInfo {
    pub adapter: AdapterInfo,
    pub drives: DriveInfo,
    pub configuration: Configuration,
    /// `None` if the adapter failed to report it.
    pub nvram_page5: Option<NvramPage5>,
}

impl ControllerInfo {
    /// Returns the number of volumes (logical drives) of the adapter.
    pub fn volume_count(&self) -> usize {
        self.drives.drives.len()
    }

    pub fn summary(&self, command_slots: usize) -> AdapterSummary {
        let disk_count = (0..self.volume_count())
            .filter_map(|n| self.configuration.logical_drives.get(n))
            .map(|ld| ld.chunks.len())
            .sum();

        AdapterSummary {
            model: self.nvram_page5.as_ref().and_then(|pg5| pg5.adapter_model()),
            firmware: self.adapter.firmware_version(),
            bios: self.adapter.bios_version(),
            command_slots,
            volume_count: self.volume_count(),
            disk_count,
        }
    }

    fn logical_drive(
        &self,
        volume: usize,
    ) -> Result<(&LogicalDrive, &LogicalDriveConfig), LookupError> {
        let drive = self
            .drives
            .drives
            .get(volume)
            .ok_or(LookupError::NoSuchVolume(volume))?;
        let config = self
            .configuration
            .logical_drives
            .get(volume)
            .ok_or(LookupError::NoSuchVolume(volume))?;
        Ok((drive, config))
    }

    /// Returns the summary of the given volume.
    pub fn volume(&self, volume: usize) -> Result<VolumeSummary, LookupError> {
        let (drive, config) = self.logical_drive(volume)?;
        Ok(VolumeSummary {
            state: config.state,
            raid_level: drive.raid_level,
            chunk_count: config.chunks.len(),
            size_sectors: config.size,
        })
    }

    /// Returns the summary of the `disk`th member of the given volume.
    pub fn volume_disk(&self, volume: usize, disk: usize) -> Result<DiskSummary, LookupError> {
        let (_, config) = self.logical_drive(volume)?;
        let chunk = config
            .chunks
            .get(disk)
            .ok_or(LookupError::NoSuchDisk { volume, disk })?;

        let invalid = LookupError::InvalidLocation {
            channel: chunk.channel,
            target: chunk.target,
        };
        if usize::from(chunk.channel) >= NUM_CHANNELS || chunk.target >= MAX_MEMBER_TARGET {
            return Err(invalid);
        }
        let device = self
            .configuration
            .device(chunk.channel, chunk.target)
            .ok_or(invalid)?;

        Ok(DiskSummary {
            channel: chunk.channel,
            target: chunk.target,
            device_id: device.device_id,
            size_sectors: chunk.sector_count,
            device_sectors: device.sector_count,
            state: device.disk_state(),
        })
    }

    /// Returns the number of sectors of the given target, if it exists.
    pub(crate) fn target_sectors(&self, target: u8) -> Option<u32> {
        self.drives
            .drives
            .get(usize::from(target))
            .map(|drive| drive.sector_count)
    }
}

/// Number of commands that the driver uses, given the number reported by the adapter.
pub(crate) fn command_slots(reported: u8) -> usize {
    usize::from(reported).max(1).min(crate::MAX_COMMANDS)
}

/// Returns the name of the adapter model, for logging purposes.
pub(crate) fn model_or_unknown(info: &ControllerInfo) -> &'static str {
    info.nvram_page5
        .as_ref()
        .and_then(|pg5| pg5.adapter_model())
        .unwrap_or("(unknown model)")
}
