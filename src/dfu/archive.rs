//! Firmware archive reader.
//!
//! A DFU package is a ZIP container holding an init packet (`.dat`) and a
//! firmware image (`.bin`). Members are selected by suffix; no manifest is
//! parsed. Both members are read fully into memory.

use std::io::Read;
use std::path::Path;

use super::error::{DfuError, DfuResult};

/// Suffix of the init packet member.
const INIT_SUFFIX: &str = ".dat";

/// Suffix of the firmware image member.
const IMAGE_SUFFIX: &str = ".bin";

/// Contents of a DFU firmware package.
#[derive(Debug)]
pub struct FirmwareArchive {
    init_data: Vec<u8>,
    firmware_data: Vec<u8>,
}

impl FirmwareArchive {
    /// Open a firmware archive and load its init packet and image.
    ///
    /// When several members share a suffix, the last one in the archive
    /// wins.
    pub fn open<P: AsRef<Path>>(path: P) -> DfuResult<Self> {
        let file = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)?;

        let mut init_name: Option<String> = None;
        let mut image_name: Option<String> = None;
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            let name = entry.name().to_string();
            if name.ends_with(INIT_SUFFIX) {
                if let Some(previous) = &init_name {
                    log::debug!("init packet {:?} superseded by {:?}", previous, name);
                }
                init_name = Some(name);
            } else if name.ends_with(IMAGE_SUFFIX) {
                if let Some(previous) = &image_name {
                    log::debug!("firmware image {:?} superseded by {:?}", previous, name);
                }
                image_name = Some(name);
            }
        }

        let init_name = init_name.ok_or(DfuError::MissingArchiveMember {
            suffix: INIT_SUFFIX,
        })?;
        let image_name = image_name.ok_or(DfuError::MissingArchiveMember {
            suffix: IMAGE_SUFFIX,
        })?;

        let init_data = read_member(&mut archive, &init_name)?;
        let firmware_data = read_member(&mut archive, &image_name)?;

        Ok(Self {
            init_data,
            firmware_data,
        })
    }

    /// Init packet bytes (`.dat` member).
    pub fn init_data(&self) -> &[u8] {
        &self.init_data
    }

    /// Firmware image bytes (`.bin` member).
    pub fn firmware_data(&self) -> &[u8] {
        &self.firmware_data
    }

    /// Combined size of both members, used as the progress total.
    pub fn total_size(&self) -> u64 {
        (self.init_data.len() + self.firmware_data.len()) as u64
    }
}

/// Read a member from the archive by name.
// TODO: stream members on demand instead of loading them whole.
fn read_member(
    archive: &mut zip::ZipArchive<std::fs::File>,
    name: &str,
) -> DfuResult<Vec<u8>> {
    let mut member = archive.by_name(name)?;
    let mut data = Vec::with_capacity(member.size() as usize);
    member.read_to_end(&mut data)?;
    Ok(data)
}
