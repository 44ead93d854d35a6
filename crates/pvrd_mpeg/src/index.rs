use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Result, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use strum::FromRepr;
use tracing::{error, warn};

pub const INDEX_FILE_NAME: &str = "index.vdr";
pub const RESUME_FILE_NAME: &str = "resume.vdr";

pub const FRAMES_PER_SEC: usize = 25;

/// Frames are never expected to be larger than this.
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

pub const MAX_FILE_NUMBER: u8 = 255;

/// Frames to stay away from the end of a recording that is still being written.
const INDEX_SAFETY_LIMIT: usize = 150;

const RECORD_SIZE: u64 = 8;

/// Path of the data file with the given number inside a recording directory.
pub fn data_file_name(dir: &Path, file_number: u8) -> PathBuf {
    dir.join(format!("{:03}.vdr", file_number))
}

/// Formats a frame index as `h:mm:ss.ff`.
pub fn index_to_hmsf(index: usize) -> String {
    let frames = index % FRAMES_PER_SEC;
    let seconds = index / FRAMES_PER_SEC;

    format!(
        "{}:{:02}:{:02}.{:02}",
        seconds / 3600,
        seconds / 60 % 60,
        seconds % 60,
        frames + 1,
    )
}

#[derive(Copy, Clone, Debug, Eq, FromRepr, PartialEq)]
#[repr(u8)]
pub enum PictureType {
    Unknown = 0,
    I = 1,
    P = 2,
    B = 3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IndexRecord {
    pub offset: u32,
    pub picture_type: PictureType,
    pub file_number: u8,
}

impl IndexRecord {
    pub fn read(mut reader: impl Read) -> Result<Self> {
        let offset = reader.read_i32::<LE>()?;
        let picture_type = reader.read_u8()?;
        let file_number = reader.read_u8()?;
        let _reserved = reader.read_i16::<LE>()?;

        Ok(Self {
            offset: u32::try_from(offset).map_err(|_| ErrorKind::InvalidData)?,
            picture_type: PictureType::from_repr(picture_type).unwrap_or(PictureType::Unknown),
            file_number,
        })
    }

    pub fn write(&self, mut writer: impl Write) -> Result<()> {
        writer.write_i32::<LE>(self.offset as i32)?;
        writer.write_u8(self.picture_type as u8)?;
        writer.write_u8(self.file_number)?;
        writer.write_i16::<LE>(0)?;

        Ok(())
    }
}

/// Where a frame lives on disk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameLocation {
    pub file_number: u8,
    pub offset: u64,
    pub picture_type: PictureType,

    /// `None` if the frame extends to the end of its file.
    pub length: Option<usize>,
}

/// The frame index of a recording.
#[derive(Clone, Debug, Default)]
pub struct IndexFile {
    path: Option<PathBuf>,
    records: Vec<IndexRecord>,
    bytes_read: u64,
}

impl IndexFile {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut index = Self {
            path: Some(dir.join(INDEX_FILE_NAME)),
            records: Vec::new(),
            bytes_read: 0,
        };

        index.catch_up()?;
        Ok(index)
    }

    pub fn from_records(records: Vec<IndexRecord>) -> Self {
        Self {
            path: None,
            records,
            bytes_read: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The highest valid frame index.
    pub fn last(&self) -> Option<usize> {
        self.records.len().checked_sub(1)
    }

    /// Reads records appended since the last call. Returns the number of new records.
    pub fn catch_up(&mut self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let mut file = File::open(path)?;
        let size = file.metadata()?.len();

        if size < self.bytes_read {
            warn!("{} shrank, re-reading it", path.display());
            self.records.clear();
            self.bytes_read = 0;
        }

        let complete = (size - self.bytes_read) / RECORD_SIZE;
        if complete == 0 {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(self.bytes_read))?;
        let mut reader = BufReader::new(file);

        for _ in 0..complete {
            self.records.push(IndexRecord::read(&mut reader)?);
            self.bytes_read += RECORD_SIZE;
        }

        Ok(complete as usize)
    }

    pub fn get(&self, index: usize) -> Option<FrameLocation> {
        let record = self.records.get(index)?;

        let length = self
            .records
            .get(index + 1)
            .filter(|next| next.file_number == record.file_number)
            .and_then(|next| next.offset.checked_sub(record.offset))
            .map(|length| length as usize);

        Some(FrameLocation {
            file_number: record.file_number,
            offset: record.offset as u64,
            picture_type: record.picture_type,
            length,
        })
    }

    /// Finds the closest I-frame strictly after (or before) `index`.
    ///
    /// With `stay_off_end`, forward searches keep a safety distance to the end of a
    /// recording that is still growing.
    pub fn next_i_frame(
        &self,
        index: usize,
        forward: bool,
        stay_off_end: bool,
    ) -> Option<(usize, FrameLocation)> {
        let last = self.last()?;
        let limit = if forward && stay_off_end {
            last.checked_sub(INDEX_SAFETY_LIMIT)?
        } else {
            last
        };

        let candidate = |i: usize| {
            let location = self.get(i)?;
            if location.picture_type != PictureType::I {
                return None;
            }

            if location.length.is_none() {
                error!("'I' frame at end of file #{}", location.file_number);
            }

            Some((i, location))
        };

        if forward {
            (index.saturating_add(1)..limit).find_map(candidate)
        } else {
            (0..index.min(limit)).rev().find_map(candidate)
        }
    }

    /// The frame index stored by an interrupted replay session, if any.
    pub fn read_resume(dir: &Path) -> Option<usize> {
        let mut file = File::open(dir.join(RESUME_FILE_NAME)).ok()?;
        let index = file.read_i32::<LE>().ok()?;

        usize::try_from(index).ok()
    }

    pub fn store_resume(dir: &Path, index: usize) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(RESUME_FILE_NAME))?;

        let index = i32::try_from(index).map_err(|_| ErrorKind::InvalidInput)?;
        file.write_i32::<LE>(index)?;

        Ok(())
    }
}
