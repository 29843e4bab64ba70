//! Firmware image loading.
//!
//! The image is a raw flash image for the application region. Its version
//! tag is embedded at two fixed offsets: the hardware half and the vendor
//! half, four bytes each.

use {
    crate::{
        config::Config,
        error::{Error, Result},
        protocol::checksum16,
        version::{HW_PREFIX_LEN, VersionRecord},
    },
    log::{debug, info},
    std::{
        fs::File,
        io::{Read, Seek, SeekFrom},
        path::{Path, PathBuf},
    },
};

/// Random-access reader for the firmware image.
pub trait FirmwareSource {
    /// Size of the image in bytes.
    fn size(&mut self) -> std::io::Result<u64>;

    /// Fill `buf` from `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
}

/// Firmware image on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileFirmware {
    path: PathBuf,
}

impl FileFirmware {
    /// Firmware at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path
                .as_ref()
                .to_path_buf(),
        }
    }

    /// Firmware at the configured location.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.firmware_path())
    }

    /// Image path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FirmwareSource for FileFirmware {
    fn size(&mut self) -> std::io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

fn read_slice(data: &[u8], offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    let start = usize::try_from(offset).map_err(std::io::Error::other)?;
    let src = start
        .checked_add(buf.len())
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
    buf.copy_from_slice(src);
    Ok(())
}

impl FirmwareSource for &[u8] {
    fn size(&mut self) -> std::io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        read_slice(self, offset, buf)
    }
}

impl FirmwareSource for Vec<u8> {
    fn size(&mut self) -> std::io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        read_slice(self, offset, buf)
    }
}

/// Read the version tag embedded in the image.
pub fn read_version_tag<S: FirmwareSource + ?Sized>(
    source: &mut S,
    config: &Config,
) -> Result<VersionRecord> {
    let mut tag = [0u8; 2 * HW_PREFIX_LEN];
    let (hw, vendor) = tag.split_at_mut(HW_PREFIX_LEN);
    source.read_at(config.version_offset, hw)?;
    source.read_at(config.vendor_info_offset, vendor)?;
    Ok(VersionRecord::parse(&tag)?)
}

/// A complete image held in memory for one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    checksum: u16,
}

impl FirmwareImage {
    /// Read the whole image from `source`.
    ///
    /// Images that do not fit the application region are rejected before
    /// anything is allocated. The buffer is reserved up front; an allocation
    /// failure is reported as [`Error::OutOfMemory`] instead of aborting.
    pub fn load<S: FirmwareSource + ?Sized>(source: &mut S, config: &Config) -> Result<Self> {
        let size = source.size()?;
        if size == 0 {
            return Err(Error::Image("firmware image is empty".into()));
        }
        if size > u64::from(config.app_region_len) {
            return Err(Error::Image(format!(
                "image is {size} bytes, application region holds {}",
                config.app_region_len
            )));
        }
        let requested = usize::try_from(size).map_err(|_| Error::OutOfMemory {
            requested: usize::MAX,
        })?;

        let mut data = Vec::new();
        data.try_reserve_exact(requested)
            .map_err(|_| Error::OutOfMemory { requested })?;
        data.resize(requested, 0);

        source.read_at(0, &mut data)?;
        let image = Self::from_bytes(data, config)?;
        info!(
            "Loaded {} byte image, checksum {:#06x}",
            image.len(),
            image.checksum
        );
        Ok(image)
    }

    /// Wrap an in-memory image.
    pub fn from_bytes(data: Vec<u8>, config: &Config) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Image("firmware image is empty".into()));
        }
        if data.len() as u64 > u64::from(config.app_region_len) {
            return Err(Error::Image(format!(
                "image is {} bytes, application region holds {}",
                data.len(),
                config.app_region_len
            )));
        }
        let checksum = checksum16(&data);
        debug!("Image checksum16 {checksum:#06x}");
        Ok(Self { data, checksum })
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.data
            .len()
    }

    /// Always false; empty images are rejected when loading.
    pub fn is_empty(&self) -> bool {
        self.data
            .is_empty()
    }

    /// 16-bit additive checksum of the whole image.
    pub fn checksum16(&self) -> u16 {
        self.checksum
    }

    /// Version tag embedded in the image.
    pub fn version(&self, config: &Config) -> Result<VersionRecord> {
        read_version_tag(&mut self.data.as_slice(), config)
    }
}
